use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use slotkv_client::ClientConfig;
use slotkv_storage::{KvConfig, NodeAddress};
use slotkv_types::BlockId;

use crate::error::{ServerError, ServerResult};

fn parse<T: for<'de> Deserialize<'de>>(text: &str) -> ServerResult<T> {
    toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))
}

fn read(path: &Path) -> ServerResult<String> {
    std::fs::read_to_string(path).map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))
}

/// Configuration of one storage node process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageNodeConfig {
    /// Address other processes reach this node at. Also the bind address.
    pub host: String,
    pub service_port: u16,
    pub management_port: u16,
    pub notification_port: u16,
    pub chain_port: u16,
    pub num_blocks: u32,
    /// Directory the node reports overload to.
    pub directory_addr: Option<String>,
    /// Snapshots from dump/sync land under this directory.
    pub persistence_root: PathBuf,
    pub kv: KvConfig,
    pub client: ClientConfig,
}

impl Default for StorageNodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            service_port: 9090,
            management_port: 9091,
            notification_port: 9092,
            chain_port: 9093,
            num_blocks: 64,
            directory_addr: Some("127.0.0.1:9990".to_string()),
            persistence_root: PathBuf::from("data"),
            kv: KvConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl StorageNodeConfig {
    pub fn from_toml(text: &str) -> ServerResult<Self> {
        let config: Self = parse(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ServerResult<Self> {
        Self::from_toml(&read(path)?)
    }

    pub fn address(&self) -> NodeAddress {
        NodeAddress {
            host: self.host.clone(),
            service_port: self.service_port,
            management_port: self.management_port,
            notification_port: self.notification_port,
            chain_port: self.chain_port,
        }
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.num_blocks == 0 {
            return Err(ServerError::Config("num_blocks must be positive".into()));
        }
        let ports: HashSet<u16> = [self.service_port, self.management_port, self.notification_port, self.chain_port]
            .into_iter()
            .collect();
        if ports.len() != 4 {
            return Err(ServerError::Config("the four ports must be distinct".into()));
        }
        let kv = &self.kv;
        if !(0.0..=1.0).contains(&kv.threshold_lo) || !(0.0..=1.0).contains(&kv.threshold_hi) || kv.threshold_lo >= kv.threshold_hi {
            return Err(ServerError::Config(format!(
                "need 0 <= threshold_lo < threshold_hi <= 1, got {} and {}",
                kv.threshold_lo, kv.threshold_hi
            )));
        }
        if kv.export_batch == 0 {
            return Err(ServerError::Config("export_batch must be positive".into()));
        }
        Ok(())
    }
}

/// A storage node as the directory knows it at startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageNodeEntry {
    pub host: String,
    pub service_port: u16,
    pub management_port: u16,
    pub notification_port: u16,
    pub chain_port: u16,
    pub num_blocks: u32,
}

impl Default for StorageNodeEntry {
    fn default() -> Self {
        let node = StorageNodeConfig::default();
        Self {
            host: node.host,
            service_port: node.service_port,
            management_port: node.management_port,
            notification_port: node.notification_port,
            chain_port: node.chain_port,
            num_blocks: node.num_blocks,
        }
    }
}

impl StorageNodeEntry {
    pub fn block_ids(&self) -> Vec<BlockId> {
        (0..self.num_blocks)
            .map(|id| {
                BlockId::new(
                    self.host.clone(),
                    self.service_port,
                    self.management_port,
                    self.notification_port,
                    self.chain_port,
                    id,
                )
            })
            .collect()
    }
}

impl From<&StorageNodeConfig> for StorageNodeEntry {
    fn from(node: &StorageNodeConfig) -> Self {
        Self {
            host: node.host.clone(),
            service_port: node.service_port,
            management_port: node.management_port,
            notification_port: node.notification_port,
            chain_port: node.chain_port,
            num_blocks: node.num_blocks,
        }
    }
}

/// Configuration of the directory process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub bind_addr: String,
    /// Connect timeout for management calls to storage nodes.
    pub management_timeout_ms: u64,
    /// Nodes whose blocks form the allocation pool.
    pub storage_nodes: Vec<StorageNodeEntry>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9990".to_string(),
            management_timeout_ms: 1000,
            storage_nodes: Vec::new(),
        }
    }
}

impl DirectoryConfig {
    pub fn from_toml(text: &str) -> ServerResult<Self> {
        let config: Self = parse(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ServerResult<Self> {
        Self::from_toml(&read(path)?)
    }

    pub fn management_timeout(&self) -> Duration {
        Duration::from_millis(self.management_timeout_ms)
    }

    /// Every block of every configured node.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.storage_nodes.iter().flat_map(StorageNodeEntry::block_ids).collect()
    }

    pub fn validate(&self) -> ServerResult<()> {
        let mut seen = HashSet::new();
        for node in &self.storage_nodes {
            let prefix = format!("{}:{}", node.host, node.service_port);
            if !seen.insert(prefix.clone()) {
                return Err(ServerError::Config(format!("storage node {prefix} listed twice")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn storage_defaults() {
        let c = StorageNodeConfig::default();
        assert_eq!(c.service_port, 9090);
        assert_eq!(c.chain_port, 9093);
        assert_eq!(c.kv.capacity, 134_217_728);
        assert_eq!(c.kv.export_batch, 1024);
        assert_eq!(c.client.timeout, Duration::from_secs(1));
        c.validate().unwrap();
    }

    #[test]
    fn partial_storage_toml_keeps_defaults() {
        let c = StorageNodeConfig::from_toml(
            r#"
            host = "10.0.0.7"
            num_blocks = 8

            [kv]
            capacity = 4096
            "#,
        )
        .unwrap();
        assert_eq!(c.host, "10.0.0.7");
        assert_eq!(c.num_blocks, 8);
        assert_eq!(c.kv.capacity, 4096);
        assert_eq!(c.kv.threshold_hi, 0.95);
        assert_eq!(c.management_port, 9091);
        assert_eq!(c.address().block_id(3).to_string(), "10.0.0.7:9090:9091:9092:9093:3");
    }

    #[test]
    fn bad_storage_configs_are_rejected() {
        assert!(StorageNodeConfig::from_toml("num_blocks = 0").is_err());
        assert!(StorageNodeConfig::from_toml("chain_port = 9090").is_err());
        assert!(StorageNodeConfig::from_toml("[kv]\nthreshold_lo = 0.9\nthreshold_hi = 0.5").is_err());
        assert!(StorageNodeConfig::from_toml("num_blocks = \"many\"").is_err());
    }

    #[test]
    fn directory_lists_node_blocks() {
        let c = DirectoryConfig::from_toml(
            r#"
            bind_addr = "0.0.0.0:7000"

            [[storage_nodes]]
            host = "a"
            num_blocks = 2

            [[storage_nodes]]
            host = "b"
            num_blocks = 3
            "#,
        )
        .unwrap();
        assert_eq!(c.bind_addr, "0.0.0.0:7000");
        let blocks = c.block_ids();
        assert_eq!(blocks.len(), 5);
        assert_eq!(blocks[0].node_prefix(), "a:9090:9091:9092:9093");
        assert_eq!(blocks[4].id, 2);
    }

    #[test]
    fn duplicate_nodes_are_rejected() {
        let text = "[[storage_nodes]]\nhost = \"a\"\n[[storage_nodes]]\nhost = \"a\"\n";
        assert!(DirectoryConfig::from_toml(text).is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "num_blocks = 2\npersistence_root = \"/var/lib/slotkv\"").unwrap();
        let c = StorageNodeConfig::from_file(file.path()).unwrap();
        assert_eq!(c.num_blocks, 2);
        assert_eq!(c.persistence_root, PathBuf::from("/var/lib/slotkv"));

        assert!(DirectoryConfig::from_file(Path::new("/nonexistent/slotkv.toml")).is_err());
    }
}
