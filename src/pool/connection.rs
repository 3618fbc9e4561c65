//! Leased connection handle.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use deadpool::managed::Object;
use serde::Serialize;
use ulid::Ulid;

use super::initializer;
use super::manager::{SessionManager, Shared};
use crate::error::{BridgeError, EngineError, QueryContext};
use crate::session::Connector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Active,
    Closed,
    Error,
}

/// A connection leased from a [`ConnectionPool`](super::ConnectionPool).
///
/// Hand it back with [`ConnectionPool::release`](super::ConnectionPool::release).
/// Dropping it also returns it, with a warning; initializer cleanup is then
/// deferred to the next checkout. A handle dropped in state `Error` or inside
/// an open transaction is discarded instead.
pub struct PooledConnection<C: Connector> {
    obj: Option<Object<SessionManager<C>>>,
    lease: Ulid,
    pool_id: Ulid,
    state: ConnectionState,
    last_statement: Option<(String, DateTime<Utc>)>,
    in_transaction: bool,
    shared: Arc<Shared<C>>,
}

impl<C: Connector> PooledConnection<C> {
    pub(crate) fn new(obj: Object<SessionManager<C>>, shared: Arc<Shared<C>>) -> Self {
        let lease = Ulid::new();
        shared.leases.lock().insert(lease);
        Self {
            obj: Some(obj),
            lease,
            pool_id: shared.id,
            state: ConnectionState::Active,
            last_statement: None,
            in_transaction: false,
            shared,
        }
    }

    /// The underlying session.
    pub fn session(&self) -> Result<&C::Conn, BridgeError> {
        self.obj
            .as_deref()
            .map(|tracked| tracked.session())
            .ok_or_else(|| BridgeError::pool("connection has already been released"))
    }

    pub fn lease_id(&self) -> Ulid {
        self.lease
    }

    pub fn pool_id(&self) -> Ulid {
        self.pool_id
    }

    pub fn pool_name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Marks the connection unusable; it will be discarded on release.
    pub fn mark_error(&mut self) {
        self.state = ConnectionState::Error;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn set_in_transaction(&mut self, open: bool) {
        self.in_transaction = open;
    }

    /// Records the statement about to run.
    pub fn record_statement(&mut self, statement: &str) {
        self.last_statement = Some((crate::error::preview(statement), Utc::now()));
    }

    pub fn last_statement(&self) -> Option<(&str, DateTime<Utc>)> {
        self.last_statement.as_ref().map(|(s, at)| (s.as_str(), *at))
    }

    /// Stores a value in this session's scratch table.
    pub async fn stash(&mut self, key: &str, value: &str) -> Result<(), BridgeError> {
        self.record_statement("stash");
        let result = initializer::stash(self.session()?, key, value).await;
        result.map_err(|e| self.scratch_error("stash", e))
    }

    /// Reads a value stored with [`stash`](Self::stash) on this session.
    pub async fn stashed(&mut self, key: &str) -> Result<Option<String>, BridgeError> {
        self.record_statement("stashed");
        let result = initializer::stashed(self.session()?, key).await;
        result.map_err(|e| self.scratch_error("stashed", e))
    }

    fn scratch_error(&mut self, op: &str, err: EngineError) -> BridgeError {
        if err.is_connection_failure() {
            self.mark_error();
        }
        BridgeError::query(
            format!("scratch table {} failed: {}", op, err.message),
            QueryContext::new(initializer::SCRATCH_TABLE, ""),
            Some(err),
        )
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<C>> {
        &self.shared
    }

    /// Takes the pooled object out of the handle, ending the lease.
    pub(crate) fn detach(&mut self) -> Option<Object<SessionManager<C>>> {
        self.shared.leases.lock().remove(&self.lease);
        let obj = self.obj.take();
        if obj.is_some() {
            self.state = ConnectionState::Closed;
        }
        obj
    }

    /// True when the connection must not go back to the pool.
    pub(crate) fn must_discard(&self) -> bool {
        self.state == ConnectionState::Error || self.in_transaction
    }
}

impl<C: Connector> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.shared.name)
            .field("lease", &self.lease)
            .field("state", &self.state)
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let discard = self.must_discard();
        let in_transaction = self.in_transaction;
        let Some(mut obj) = self.detach() else {
            return;
        };
        if discard {
            tracing::warn!(
                pool = %self.shared.name,
                lease = %self.lease,
                in_transaction,
                "Connection dropped in error or mid-transaction, discarding"
            );
            drop(Object::take(obj));
        } else {
            tracing::warn!(
                pool = %self.shared.name,
                lease = %self.lease,
                "Connection dropped without release, returning to pool"
            );
            // Cleanup runs on the next checkout.
            obj.mark_returned(false);
        }
    }
}
