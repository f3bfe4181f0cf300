use tracing::debug;

use slotkv_types::ops::kv;
use slotkv_types::{reply, BlockId};

use crate::chain_client::ReplicaChainClient;
use crate::error::{ClientError, ClientResult};

/// Chain client that holds the partition lock for its lifetime.
///
/// The lock reply tells whether the partition is exporting. When it is, the
/// reply names the export target and [`LockedClient::redirect_chain`] returns
/// it so multi-key work can be mirrored on the destination.
#[derive(Debug)]
pub struct LockedClient {
    inner: ReplicaChainClient,
    redirect_chain: Option<Vec<BlockId>>,
}

impl LockedClient {
    /// Wrap `inner` and take the lock.
    pub async fn lock(mut inner: ReplicaChainClient) -> ClientResult<Self> {
        let redirect_chain = Self::acquire(&mut inner).await?;
        Ok(Self { inner, redirect_chain })
    }

    async fn acquire(inner: &mut ReplicaChainClient) -> ClientResult<Option<Vec<BlockId>>> {
        let result = inner.run_command(kv::LOCK, Vec::new()).await?;
        let first = result.into_iter().next().ok_or(ClientError::EmptyResponse)?;
        if first == reply::OK {
            return Ok(None);
        }
        let target = first
            .strip_prefix('!')
            .ok_or_else(|| ClientError::UnexpectedReply(first.clone()))?;
        let chain = BlockId::parse_chain(target)?;
        debug!(path = inner.path(), target = %BlockId::join_chain(&chain), "locked exporting partition");
        Ok(Some(chain))
    }

    /// Re-take the lock after an explicit [`unlock`](Self::unlock).
    pub async fn relock(&mut self) -> ClientResult<()> {
        self.redirect_chain = Self::acquire(&mut self.inner).await?;
        Ok(())
    }

    pub async fn unlock(&mut self) -> ClientResult<()> {
        let result = self.inner.run_command(kv::UNLOCK, Vec::new()).await?;
        match result.first().map(String::as_str) {
            Some(reply::OK) => Ok(()),
            Some(reply::BLOCK_NOT_LOCKED) => Err(ClientError::BlockNotLocked),
            Some(other) => Err(ClientError::UnexpectedReply(other.to_string())),
            None => Err(ClientError::EmptyResponse),
        }
    }

    pub async fn run_command(&mut self, op_id: i32, args: Vec<String>) -> ClientResult<Vec<String>> {
        self.inner.run_command(op_id, args).await
    }

    pub async fn run_command_redirected(&mut self, op_id: i32, args: Vec<String>) -> ClientResult<Vec<String>> {
        self.inner.run_command_redirected(op_id, args).await
    }

    /// Returns `true` if the partition was exporting when locked.
    pub fn redirecting(&self) -> bool {
        self.redirect_chain.is_some()
    }

    pub fn redirect_chain(&self) -> Option<&[BlockId]> {
        self.redirect_chain.as_deref()
    }

    pub fn inner(&self) -> &ReplicaChainClient {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::chain_client::testing::*;
    use slotkv_types::{kv_ops, SlotRange};

    fn locked_client(net: &Arc<FakeTransport>) -> ReplicaChainClient {
        ReplicaChainClient::new(
            Arc::new(FakeNetwork(Arc::clone(net))),
            None,
            "/file",
            chain_of(&[0], SlotRange::full()),
            kv_ops(),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn lock_on_regular_partition() {
        let net = FakeTransport::new(|_, _, _| vec![reply::OK.to_string()]);
        let mut c = LockedClient::lock(locked_client(&net)).await.unwrap();
        assert!(!c.redirecting());
        assert!(c.redirect_chain().is_none());
        c.unlock().await.unwrap();
        let ops: Vec<i32> = net.requests.lock().unwrap().iter().map(|r| r.1).collect();
        assert_eq!(ops, vec![kv::LOCK, kv::UNLOCK]);
    }

    #[tokio::test]
    async fn lock_on_exporting_partition_names_target() {
        let target = vec![block(7), block(8)];
        let raw = format!("!{}", BlockId::join_chain(&target));
        let net = FakeTransport::new(move |_, op, _| {
            if op == kv::LOCK {
                vec![raw.clone()]
            } else {
                vec![reply::OK.to_string()]
            }
        });
        let c = LockedClient::lock(locked_client(&net)).await.unwrap();
        assert!(c.redirecting());
        assert_eq!(c.redirect_chain().unwrap(), target.as_slice());
    }

    #[tokio::test]
    async fn unlock_without_lock_is_reported() {
        let net = FakeTransport::new(|_, op, _| {
            if op == kv::LOCK {
                vec![reply::OK.to_string()]
            } else {
                vec![reply::BLOCK_NOT_LOCKED.to_string()]
            }
        });
        let mut c = LockedClient::lock(locked_client(&net)).await.unwrap();
        assert!(matches!(c.unlock().await, Err(ClientError::BlockNotLocked)));
    }
}
