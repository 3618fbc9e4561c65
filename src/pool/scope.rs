//! Explicit owner for the pools of one unit of work.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::ConnectionPool;
use crate::session::Connector;

/// Something a [`PoolScope`] can close.
#[async_trait]
pub trait Shutdown: Send + Sync {
    fn name(&self) -> &str;

    fn is_closed(&self) -> bool;

    async fn shutdown(&self);
}

#[async_trait]
impl<C: Connector> Shutdown for ConnectionPool<C> {
    fn name(&self) -> &str {
        ConnectionPool::name(self)
    }

    fn is_closed(&self) -> bool {
        ConnectionPool::is_closed(self)
    }

    async fn shutdown(&self) {
        self.close().await;
    }
}

/// Aggregates pools so they can be closed together.
///
/// ```ignore
/// let scope = PoolScope::new();
/// let pool = scope.register(ConnectionPool::from_config("main", &config)?);
/// // ...
/// scope.close_all().await;
/// ```
#[derive(Default)]
pub struct PoolScope {
    pools: Mutex<Vec<Arc<dyn Shutdown>>>,
}

impl PoolScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pool to the scope and hands it back.
    pub fn register<P>(&self, pool: P) -> P
    where
        P: Shutdown + Clone + 'static,
    {
        self.pools.lock().push(Arc::new(pool.clone()));
        pool
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    /// Closes every registered pool, in registration order, and forgets them.
    pub async fn close_all(&self) {
        let pools: Vec<Arc<dyn Shutdown>> = std::mem::take(&mut *self.pools.lock());
        for pool in &pools {
            pool.shutdown().await;
        }
        tracing::debug!(closed = pools.len(), "Pool scope closed");
    }
}

impl Drop for PoolScope {
    fn drop(&mut self) {
        let open: Vec<String> = self
            .pools
            .get_mut()
            .iter()
            .filter(|p| !p.is_closed())
            .map(|p| p.name().to_string())
            .collect();
        if !open.is_empty() {
            tracing::warn!(pools = ?open, "Pool scope dropped with open pools");
        }
    }
}
