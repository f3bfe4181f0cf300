use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use colored::Colorize;

use slotkv_client::{ClientConfig, KvClient};
use slotkv_protocol::{DirectoryService, Transport};
use slotkv_server::{
    DirectoryConfig, DirectoryServer, RemoteDirectory, StorageNodeConfig, StorageServer, TcpTransport,
};
use slotkv_types::{ChainStatus, DataFlags, DataStatus, SlotRange};

use crate::cli::*;

/// What every client command needs to reach the cluster.
struct Session {
    directory: Arc<dyn DirectoryService>,
    transport: Arc<dyn Transport>,
    client: ClientConfig,
    format: OutputFormat,
}

impl Session {
    fn new(cli: &Cli) -> Self {
        let timeout = Duration::from_millis(cli.timeout_ms);
        Self {
            directory: Arc::new(RemoteDirectory::new(cli.directory.clone(), timeout)),
            transport: Arc::new(TcpTransport::new(timeout)),
            client: ClientConfig {
                timeout,
                ..ClientConfig::default()
            },
            format: cli.format.clone(),
        }
    }

    async fn open(&self, path: &str) -> anyhow::Result<KvClient> {
        KvClient::open(
            Arc::clone(&self.transport),
            Arc::clone(&self.directory),
            path,
            self.client.clone(),
        )
        .await
        .with_context(|| format!("opening {path}"))
    }

    async fn backing_path(&self, path: &str, given: Option<String>) -> anyhow::Result<String> {
        match given {
            Some(backing) => Ok(backing),
            None => Ok(self.directory.dstatus(path).await?.backing_path),
        }
    }
}

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let session = Session::new(&cli);
    match cli.command {
        Command::Storage(args) => cmd_storage(args.config.as_deref()).await,
        Command::Directory(args) => cmd_directory(args.config.as_deref()).await,
        Command::Create(args) => cmd_create(&session, args).await,
        Command::Destroy(args) => {
            session.directory.remove(&args.path).await?;
            println!("{} Removed {}", "✓".green().bold(), args.path.bold());
            Ok(())
        }
        Command::Status(args) => {
            let status = session.directory.dstatus(&args.path).await?;
            print_status(&args.path, &status, &session.format)
        }
        Command::Put(args) => {
            session.open(&args.path).await?.put(&args.key, &args.value).await?;
            println!("{} {}", "✓".green(), args.key.yellow());
            Ok(())
        }
        Command::Get(args) => {
            let value = session.open(&args.path).await?.get(&args.key).await?;
            println!("{value}");
            Ok(())
        }
        Command::Update(args) => {
            let old = session.open(&args.path).await?.update(&args.key, &args.value).await?;
            println!("{} {} (was {})", "✓".green(), args.key.yellow(), old.dimmed());
            Ok(())
        }
        Command::Remove(args) => {
            let old = session.open(&args.path).await?.remove(&args.key).await?;
            println!("{} removed {} (was {})", "✓".green(), args.key.yellow(), old.dimmed());
            Ok(())
        }
        Command::Exists(args) => {
            let found = session.open(&args.path).await?.exists(&args.key).await?;
            println!("{found}");
            Ok(())
        }
        Command::Keys(args) => {
            let mut keys = session.open(&args.path).await?.keys().await?;
            keys.sort();
            match session.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&keys)?),
                OutputFormat::Text => keys.iter().for_each(|k| println!("{k}")),
            }
            Ok(())
        }
        Command::NumKeys(args) => {
            println!("{}", session.open(&args.path).await?.num_keys().await?);
            Ok(())
        }
        Command::Split(args) => {
            let range = SlotRange::new(args.begin, args.end)?;
            session.directory.split_slot_range(&args.path, range).await?;
            println!("{} Split {} of {}", "✓".green().bold(), range.to_string().cyan(), args.path.bold());
            Ok(())
        }
        Command::Merge(args) => {
            let range = SlotRange::new(args.begin, args.end)?;
            session.directory.merge_slot_range(&args.path, range).await?;
            println!("{} Merged {} of {}", "✓".green().bold(), range.to_string().cyan(), args.path.bold());
            Ok(())
        }
        Command::AddBlock(args) => {
            session.directory.add_block_to_file(&args.path).await?;
            let status = session.directory.dstatus(&args.path).await?;
            println!("{} {} now has {} chains", "✓".green().bold(), args.path.bold(), status.chains.len());
            Ok(())
        }
        Command::Dump(args) => {
            let backing = session.backing_path(&args.path, args.backing_path).await?;
            session.directory.dump(&args.path, &backing).await?;
            println!("{} Dumped {} to {}", "✓".green().bold(), args.path.bold(), backing.blue());
            Ok(())
        }
        Command::Load(args) => {
            let backing = session.backing_path(&args.path, args.backing_path).await?;
            session.directory.load(&args.path, &backing).await?;
            println!("{} Loaded {} from {}", "✓".green().bold(), args.path.bold(), backing.blue());
            Ok(())
        }
        Command::Sync(args) => {
            let backing = session.backing_path(&args.path, args.backing_path).await?;
            session.directory.sync(&args.path, &backing).await?;
            println!("{} Synced {} to {}", "✓".green().bold(), args.path.bold(), backing.blue());
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "installing ctrl-c handler");
    }
}

async fn cmd_storage(config: Option<&Path>) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => StorageNodeConfig::from_file(path)?,
        None => StorageNodeConfig::default(),
    };
    let server = StorageServer::new(config)?;
    server.run_until_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn cmd_directory(config: Option<&Path>) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => DirectoryConfig::from_file(path)?,
        None => DirectoryConfig::default(),
    };
    let server = DirectoryServer::new(config)?;
    server.run_until_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn cmd_create(session: &Session, args: CreateArgs) -> anyhow::Result<()> {
    let mut flags = DataFlags::default();
    if args.pinned {
        flags.set(DataFlags::PINNED);
    }
    if args.static_provisioned {
        flags.set(DataFlags::STATIC_PROVISIONED);
    }
    if args.mapped {
        flags.set(DataFlags::MAPPED);
    }
    let backing = args.backing_path.unwrap_or_else(|| args.path.clone());
    let status = session
        .directory
        .create(&args.path, &backing, args.blocks, args.chain_length, flags.0)
        .await?;
    println!("{} Created {}", "✓".green().bold(), args.path.bold());
    print_status(&args.path, &status, &session.format)
}

fn print_status(path: &str, status: &DataStatus, format: &OutputFormat) -> anyhow::Result<()> {
    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }
    println!("{}  backing: {}  replicas: {}", path.bold(), status.backing_path.blue(), status.chain_length);
    for chain in &status.chains {
        let state = match chain.status {
            ChainStatus::Stable => "stable".green(),
            ChainStatus::Exporting => "exporting".yellow(),
            ChainStatus::Importing => "importing".yellow(),
        };
        println!("  {}  {}  {:?}", chain.slot_range.to_string().cyan(), state, chain.mode);
        for block in &chain.blocks {
            println!("    {}", block.to_string().dimmed());
        }
    }
    Ok(())
}
