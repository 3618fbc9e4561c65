//! Nested transactions on one pooled connection.
//!
//! A top-level scope owns the connection (`BEGIN` / `COMMIT` / `ROLLBACK`).
//! Nested scopes share it through savepoints numbered from one counter per
//! connection. Only the innermost active scope may commit, roll back, or open
//! another nested scope.
//!
//! ```ignore
//! let id = executor
//!     .with_transaction(TransactionOptions::default(), |tx| async move {
//!         tx.execute_sql("INSERT INTO audit (msg) VALUES ($1)", &["start".into()], None).await?;
//!         tx.with_nested(|inner| async move {
//!             inner.execute_cypher("CREATE (:Step {n: 1})", &Params::new(), "g", None).await
//!         })
//!         .await?;
//!         Ok(42)
//!     })
//!     .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::cypher::compile;
use crate::error::{BridgeError, QueryContext};
use crate::executor::{
    attempt, cypher_context, positional_context, Outcome, QueryExecutor, QueryOptions, Statement,
};
use crate::pool::PooledConnection;
use crate::row::QueryResult;
use crate::session::Connector;
use crate::traits::{CypherExecutor, SqlExecutor};
use crate::value::{Params, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options for a top-level transaction. Nested scopes inherit them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: Option<bool>,
    pub deferrable: Option<bool>,
    /// Rolls the transaction back if it is still active after this long.
    pub timeout: Option<Duration>,
}

impl TransactionOptions {
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = Some(deferrable);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The `BEGIN` statement for these options.
    pub fn begin_sql(&self) -> String {
        let mut modes = Vec::new();
        if let Some(level) = self.isolation {
            modes.push(format!("ISOLATION LEVEL {}", level.as_sql()));
        }
        if let Some(read_only) = self.read_only {
            modes.push(if read_only { "READ ONLY" } else { "READ WRITE" }.to_string());
        }
        if let Some(deferrable) = self.deferrable {
            modes.push(if deferrable { "DEFERRABLE" } else { "NOT DEFERRABLE" }.to_string());
        }
        if modes.is_empty() {
            "BEGIN".to_string()
        } else {
            format!("BEGIN {}", modes.join(", "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
    Error,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionStatus::Active => "active",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RolledBack => "rolled back",
            TransactionStatus::Error => "failed",
        })
    }
}

/// The connection shared by a top-level scope and all of its nested scopes.
struct TxConnection<C: Connector> {
    id: Ulid,
    conn: tokio::sync::Mutex<Option<PooledConnection<C>>>,
    executor: QueryExecutor<C>,
    savepoints: AtomicU64,
    innermost: AtomicU32,
    /// `(level, savepoint)` of nested scopes dropped while active.
    abandoned: Mutex<Vec<(u32, String)>>,
}

impl<C: Connector> TxConnection<C> {
    /// Takes the outermost abandoned savepoint and moves `innermost` above it.
    fn take_abandoned(&self) -> Option<(u32, String)> {
        let outermost = std::mem::take(&mut *self.abandoned.lock())
            .into_iter()
            .min_by_key(|(level, _)| *level)?;
        self.innermost
            .fetch_min(outermost.0.saturating_sub(1), Ordering::SeqCst);
        Some(outermost)
    }

    async fn release(&self, conn: PooledConnection<C>) {
        if let Err(err) = self.executor.pool().release(conn).await {
            tracing::warn!(tx = %self.id, error = %err, "Failed to release transaction connection");
        }
    }
}

struct Scope<C: Connector> {
    shared: Arc<TxConnection<C>>,
    /// 0 for the top-level scope.
    level: u32,
    savepoint: Option<String>,
    status: Mutex<TransactionStatus>,
    options: TransactionOptions,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> Scope<C> {
    fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: TransactionStatus) {
        *self.status.lock() = status;
    }

    fn error(&self, message: impl Into<String>, source: Option<&BridgeError>) -> BridgeError {
        BridgeError::transaction(message, self.level, source.and_then(|e| e.engine().cloned()))
    }

    fn ensure_active(&self) -> Result<(), BridgeError> {
        match self.status() {
            TransactionStatus::Active => Ok(()),
            status => Err(self.error(format!("transaction is {}", status), None)),
        }
    }

    /// Checks that this scope may commit, roll back or nest.
    fn ensure_innermost(&self, action: &str) -> Result<(), BridgeError> {
        self.ensure_active()?;
        if self.shared.innermost.load(Ordering::SeqCst) != self.level {
            return Err(self.error(
                format!("cannot {} while a nested scope is active", action),
                None,
            ));
        }
        Ok(())
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    fn control_timeout(&self) -> Option<Duration> {
        self.shared.executor.defaults().timeout
    }

    async fn control(
        &self,
        slot: &mut Option<PooledConnection<C>>,
        sql: &str,
    ) -> Result<(), BridgeError> {
        let conn = slot
            .as_mut()
            .ok_or_else(|| self.error("transaction connection has been released", None))?;
        let context = QueryContext::new(sql, "");
        attempt(conn, &Statement::Control { text: sql }, self.control_timeout(), &context)
            .await
            .map(|_| ())
    }

    /// Undoes the writes of nested scopes that were dropped without commit.
    ///
    /// Rolling back to the outermost abandoned savepoint also discards every
    /// savepoint opened after it.
    async fn settle(&self, slot: &mut Option<PooledConnection<C>>) -> Result<(), BridgeError> {
        let Some((level, name)) = self.shared.take_abandoned() else {
            return Ok(());
        };
        if slot.is_none() {
            return Ok(());
        }
        for sql in [
            format!("ROLLBACK TO SAVEPOINT {}", name),
            format!("RELEASE SAVEPOINT {}", name),
        ] {
            if let Err(err) = self.control(slot, &sql).await {
                self.set_status(TransactionStatus::Error);
                return Err(self.error(format!("{} failed: {}", sql, err), Some(&err)));
            }
        }
        tracing::warn!(
            tx = %self.shared.id,
            level,
            savepoint = %name,
            "Rolled back savepoint of a dropped nested scope"
        );
        Ok(())
    }

    /// Fired by the timer task.
    async fn expire(&self, limit: Duration) {
        let mut slot = self.shared.conn.lock().await;
        if self.status() != TransactionStatus::Active {
            return;
        }
        self.set_status(TransactionStatus::Error);
        tracing::warn!(
            tx = %self.shared.id,
            timeout_ms = limit.as_millis() as u64,
            "Transaction timed out, rolling back"
        );
        let rolled_back = self.control(&mut slot, "ROLLBACK").await;
        self.shared.innermost.store(0, Ordering::SeqCst);
        if let Some(mut conn) = slot.take() {
            match rolled_back {
                Ok(()) => conn.set_in_transaction(false),
                Err(err) => {
                    tracing::warn!(tx = %self.shared.id, error = %err, "Rollback after timeout failed");
                    conn.mark_error();
                }
            }
            self.shared.release(conn).await;
        }
    }
}

impl<C: Connector> Drop for Scope<C> {
    fn drop(&mut self) {
        self.cancel_timer();
        if *self.status.get_mut() != TransactionStatus::Active {
            return;
        }
        if let Some(name) = self.savepoint.take() {
            let _ = self.shared.innermost.compare_exchange(
                self.level,
                self.level - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            tracing::warn!(
                tx = %self.shared.id,
                level = self.level,
                savepoint = %name,
                "Nested scope dropped while active, its writes will be rolled back"
            );
            self.shared.abandoned.lock().push((self.level, name));
            return;
        }
        tracing::warn!(
            tx = %self.shared.id,
            level = self.level,
            "Transaction scope dropped while active"
        );
    }
}

/// Handle to one transaction scope.
///
/// Clones refer to the same scope. Statements run on the shared connection
/// without retries.
pub struct Transaction<C: Connector> {
    scope: Arc<Scope<C>>,
}

impl<C: Connector> Clone for Transaction<C> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
        }
    }
}

impl<C: Connector> fmt::Debug for Transaction<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.scope.shared.id)
            .field("level", &self.scope.level)
            .field("savepoint", &self.scope.savepoint)
            .field("status", &self.scope.status())
            .finish()
    }
}

impl<C: Connector> QueryExecutor<C> {
    /// Leases a connection and opens a top-level transaction on it.
    pub async fn begin_transaction(
        &self,
        options: TransactionOptions,
    ) -> Result<Transaction<C>, BridgeError> {
        let mut conn = self.pool().acquire().await?;
        let sql = options.begin_sql();
        let context = QueryContext::new(&sql, "");
        let begun = attempt(
            &mut conn,
            &Statement::Control { text: &sql },
            self.defaults().timeout,
            &context,
        )
        .await;
        if let Err(err) = begun {
            if let Err(release) = self.pool().release(conn).await {
                tracing::warn!(error = %release, "Failed to release connection");
            }
            return Err(BridgeError::transaction(
                format!("{} failed: {}", sql, err),
                0,
                err.engine().cloned(),
            ));
        }
        conn.set_in_transaction(true);

        let shared = Arc::new(TxConnection {
            id: Ulid::new(),
            conn: tokio::sync::Mutex::new(Some(conn)),
            executor: self.clone(),
            savepoints: AtomicU64::new(0),
            innermost: AtomicU32::new(0),
            abandoned: Mutex::new(Vec::new()),
        });
        let scope = Arc::new(Scope {
            shared,
            level: 0,
            savepoint: None,
            status: Mutex::new(TransactionStatus::Active),
            options,
            timer: Mutex::new(None),
        });

        if let Some(limit) = scope.options.timeout {
            let weak: Weak<Scope<C>> = Arc::downgrade(&scope);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                if let Some(scope) = weak.upgrade() {
                    scope.expire(limit).await;
                }
            });
            *scope.timer.lock() = Some(timer);
        }

        tracing::debug!(tx = %scope.shared.id, begin = %sql, "Transaction started");
        Ok(Transaction { scope })
    }

    /// Runs `f` in a new transaction.
    ///
    /// Commits when `f` succeeds and the transaction is still active. On failure
    /// the transaction is rolled back and `f`'s error is returned.
    pub async fn with_transaction<F, Fut, T>(
        &self,
        options: TransactionOptions,
        f: F,
    ) -> Result<T, BridgeError>
    where
        F: FnOnce(Transaction<C>) -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        let tx = self.begin_transaction(options).await?;
        run_scope(tx, f).await
    }
}

async fn run_scope<C, F, Fut, T>(tx: Transaction<C>, f: F) -> Result<T, BridgeError>
where
    C: Connector,
    F: FnOnce(Transaction<C>) -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
{
    match f(tx.clone()).await {
        Ok(value) => {
            if tx.status() == TransactionStatus::Active {
                if let Err(err) = tx.commit().await {
                    tx.rollback_quietly().await;
                    return Err(err);
                }
            }
            Ok(value)
        }
        Err(err) => {
            tx.rollback_quietly().await;
            Err(err)
        }
    }
}

impl<C: Connector> Transaction<C> {
    pub fn id(&self) -> Ulid {
        self.scope.shared.id
    }

    /// Nesting depth: 0 for the top-level scope.
    pub fn level(&self) -> u32 {
        self.scope.level
    }

    pub fn is_nested(&self) -> bool {
        self.scope.level > 0
    }

    pub fn savepoint(&self) -> Option<&str> {
        self.scope.savepoint.as_deref()
    }

    pub fn status(&self) -> TransactionStatus {
        self.scope.status()
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.scope.options
    }

    /// Opens a nested scope backed by a new savepoint.
    pub async fn begin_nested(&self) -> Result<Transaction<C>, BridgeError> {
        let scope = &self.scope;
        let mut slot = scope.shared.conn.lock().await;
        scope.ensure_active()?;
        scope.settle(&mut slot).await?;
        scope.ensure_innermost("open a nested scope")?;

        let n = scope.shared.savepoints.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("sp_{}", n);
        let level = scope.level + 1;
        scope
            .control(&mut slot, &format!("SAVEPOINT {}", name))
            .await
            .map_err(|err| {
                BridgeError::transaction(
                    format!("SAVEPOINT {} failed: {}", name, err),
                    level,
                    err.engine().cloned(),
                )
            })?;
        scope.shared.innermost.store(level, Ordering::SeqCst);

        tracing::debug!(tx = %scope.shared.id, level, savepoint = %name, "Nested scope started");
        Ok(Transaction {
            scope: Arc::new(Scope {
                shared: scope.shared.clone(),
                level,
                savepoint: Some(name),
                status: Mutex::new(TransactionStatus::Active),
                options: scope.options.clone(),
                timer: Mutex::new(None),
            }),
        })
    }

    /// Runs `f` in a nested scope, releasing its savepoint on success and
    /// rolling back to it on failure.
    pub async fn with_nested<F, Fut, T>(&self, f: F) -> Result<T, BridgeError>
    where
        F: FnOnce(Transaction<C>) -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        let nested = self.begin_nested().await?;
        run_scope(nested, f).await
    }

    /// Commits this scope. Nested scopes release their savepoint.
    pub async fn commit(&self) -> Result<(), BridgeError> {
        let scope = &self.scope;
        let mut slot = scope.shared.conn.lock().await;
        scope.ensure_active()?;
        scope.settle(&mut slot).await?;
        scope.ensure_innermost("commit")?;
        scope.cancel_timer();

        let sql = match &scope.savepoint {
            Some(name) => format!("RELEASE SAVEPOINT {}", name),
            None => "COMMIT".to_string(),
        };
        if let Err(err) = scope.control(&mut slot, &sql).await {
            scope.set_status(TransactionStatus::Error);
            return Err(scope.error(format!("{} failed: {}", sql, err), Some(&err)));
        }

        scope.set_status(TransactionStatus::Committed);
        if scope.level > 0 {
            scope.shared.innermost.store(scope.level - 1, Ordering::SeqCst);
        } else if let Some(mut conn) = slot.take() {
            conn.set_in_transaction(false);
            scope.shared.release(conn).await;
        }
        tracing::debug!(tx = %scope.shared.id, level = scope.level, "Transaction committed");
        Ok(())
    }

    /// Rolls this scope back. Allowed from `Active` and `Error`.
    ///
    /// Nested scopes roll back to their savepoint. The top-level scope issues
    /// `ROLLBACK` and returns the connection to the pool, or discards it when
    /// the rollback itself failed.
    pub async fn rollback(&self) -> Result<(), BridgeError> {
        let scope = &self.scope;
        let mut slot = scope.shared.conn.lock().await;
        let status = scope.status();
        if !matches!(status, TransactionStatus::Active | TransactionStatus::Error) {
            return Err(scope.error(format!("cannot roll back a {} transaction", status), None));
        }
        if scope.level == 0 {
            // ROLLBACK discards every abandoned savepoint too.
            scope.shared.take_abandoned();
        } else {
            scope.settle(&mut slot).await?;
        }
        if slot.is_none() {
            scope.set_status(TransactionStatus::RolledBack);
            return Ok(());
        }
        if scope.shared.innermost.load(Ordering::SeqCst) > scope.level {
            return Err(scope.error("cannot roll back while a nested scope is active", None));
        }
        scope.cancel_timer();

        let sql = match &scope.savepoint {
            Some(name) => format!("ROLLBACK TO SAVEPOINT {}", name),
            None => "ROLLBACK".to_string(),
        };
        let result = scope.control(&mut slot, &sql).await;

        if scope.level > 0 {
            scope.shared.innermost.store(scope.level - 1, Ordering::SeqCst);
        } else if let Some(mut conn) = slot.take() {
            if result.is_ok() {
                conn.set_in_transaction(false);
            } else {
                conn.mark_error();
            }
            scope.shared.release(conn).await;
        }

        match result {
            Ok(()) => {
                scope.set_status(TransactionStatus::RolledBack);
                tracing::debug!(tx = %scope.shared.id, level = scope.level, "Transaction rolled back");
                Ok(())
            }
            Err(err) => {
                scope.set_status(TransactionStatus::Error);
                Err(scope.error(format!("{} failed: {}", sql, err), Some(&err)))
            }
        }
    }

    async fn rollback_quietly(&self) {
        if !matches!(
            self.status(),
            TransactionStatus::Active | TransactionStatus::Error
        ) {
            return;
        }
        if let Err(err) = self.rollback().await {
            tracing::warn!(tx = %self.id(), level = self.level(), error = %err, "Rollback during cleanup failed");
        }
    }

    /// Stores a value in the session scratch table of this transaction's connection.
    pub async fn stash(&self, key: &str, value: &str) -> Result<(), BridgeError> {
        let mut slot = self.scope.shared.conn.lock().await;
        self.scope.ensure_active()?;
        self.scope.settle(&mut slot).await?;
        let conn = slot
            .as_mut()
            .ok_or_else(|| self.scope.error("transaction connection has been released", None))?;
        conn.stash(key, value).await
    }

    pub async fn stashed(&self, key: &str) -> Result<Option<String>, BridgeError> {
        let mut slot = self.scope.shared.conn.lock().await;
        self.scope.ensure_active()?;
        self.scope.settle(&mut slot).await?;
        let conn = slot
            .as_mut()
            .ok_or_else(|| self.scope.error("transaction connection has been released", None))?;
        conn.stashed(key).await
    }

    async fn run(
        &self,
        stmt: Statement<'_>,
        options: Option<&QueryOptions>,
        context: QueryContext,
    ) -> Result<Outcome, BridgeError> {
        let scope = &self.scope;
        let mut slot = scope.shared.conn.lock().await;
        scope.ensure_active()?;
        scope.settle(&mut slot).await?;
        let conn = slot
            .as_mut()
            .ok_or_else(|| scope.error("transaction connection has been released", None))?;
        let timeout = match options {
            Some(options) => options.timeout,
            None => scope.control_timeout(),
        };
        attempt(conn, &stmt, timeout, &context).await
    }
}

#[async_trait]
impl<C: Connector> SqlExecutor for Transaction<C> {
    async fn execute_sql(
        &self,
        sql: &str,
        params: &[Value],
        options: Option<&QueryOptions>,
    ) -> Result<QueryResult, BridgeError> {
        let context = positional_context(sql, params)?;
        self.run(Statement::Sql { text: sql, params }, options, context)
            .await
            .map(Outcome::into_result)
    }

    async fn execute_copy_from(
        &self,
        sql: &str,
        data: Bytes,
        options: Option<&QueryOptions>,
    ) -> Result<u64, BridgeError> {
        let context = QueryContext::new(sql, format!("{} bytes", data.len()));
        self.run(Statement::Copy { text: sql, data }, options, context)
            .await
            .map(Outcome::into_count)
    }
}

#[async_trait]
impl<C: Connector> CypherExecutor for Transaction<C> {
    async fn execute_cypher(
        &self,
        cypher: &str,
        params: &Params,
        graph: &str,
        options: Option<&QueryOptions>,
    ) -> Result<QueryResult, BridgeError> {
        let call = compile(cypher, params, graph)?;
        let context = cypher_context(cypher, params, graph);
        let stmt = Statement::Cypher {
            call: &call,
            setup: self.scope.shared.executor.setup(),
        };
        self.run(stmt, options, context).await.map(Outcome::into_result)
    }

    fn default_graph(&self) -> Option<&str> {
        self.scope.shared.executor.default_graph()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, ErrorKind};
    use crate::pool::{ConnectionPool, PoolSettings};
    use crate::session::mock::MockConnector;

    fn executor(mock: &MockConnector) -> QueryExecutor<MockConnector> {
        let pool = ConnectionPool::new("tx", mock.clone(), PoolSettings::default(), vec![]).unwrap();
        QueryExecutor::new(pool)
    }

    #[test]
    fn test_begin_sql() {
        assert_eq!(TransactionOptions::default().begin_sql(), "BEGIN");
        let options = TransactionOptions::default()
            .isolation(IsolationLevel::Serializable)
            .read_only(true)
            .deferrable(true);
        assert_eq!(
            options.begin_sql(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE, READ ONLY, DEFERRABLE"
        );
        let options = TransactionOptions::default().read_only(false).deferrable(false);
        assert_eq!(options.begin_sql(), "BEGIN READ WRITE, NOT DEFERRABLE");
    }

    #[tokio::test]
    async fn test_commit_releases_connection() {
        let mock = MockConnector::new();
        let exec = executor(&mock);

        let tx = exec.begin_transaction(TransactionOptions::default()).await.unwrap();
        assert_eq!(exec.pool().stats().active, 1);
        tx.execute_sql("INSERT INTO t VALUES (1)", &[], None).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(tx.status(), TransactionStatus::Committed);
        assert_eq!(exec.pool().stats().active, 0);
        assert_eq!(exec.pool().stats().idle, 1);
        assert_eq!(
            mock.statements(),
            vec!["BEGIN", "INSERT INTO t VALUES (1)", "COMMIT"]
        );
    }

    #[tokio::test]
    async fn test_nested_scopes_use_savepoints_on_one_connection() {
        let mock = MockConnector::new();
        let exec = executor(&mock);

        let outer = exec.begin_transaction(TransactionOptions::default()).await.unwrap();
        let first = outer.begin_nested().await.unwrap();
        assert_eq!(first.level(), 1);
        first.commit().await.unwrap();

        let second = outer.begin_nested().await.unwrap();
        let third = second.begin_nested().await.unwrap();
        assert_eq!(third.savepoint(), Some("sp_3"));
        third.rollback().await.unwrap();
        second.commit().await.unwrap();
        outer.commit().await.unwrap();

        assert_eq!(
            mock.statements(),
            vec![
                "BEGIN",
                "SAVEPOINT sp_1",
                "RELEASE SAVEPOINT sp_1",
                "SAVEPOINT sp_2",
                "SAVEPOINT sp_3",
                "ROLLBACK TO SAVEPOINT sp_3",
                "RELEASE SAVEPOINT sp_2",
                "COMMIT",
            ]
        );
        assert_eq!(mock.sessions_running("SAVEPOINT"), vec![1]);
    }

    #[tokio::test]
    async fn test_only_innermost_may_commit() {
        let mock = MockConnector::new();
        let exec = executor(&mock);

        let outer = exec.begin_transaction(TransactionOptions::default()).await.unwrap();
        let inner = outer.begin_nested().await.unwrap();

        let err = outer.commit().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transaction);
        assert!(outer.begin_nested().await.is_err());

        inner.rollback().await.unwrap();
        outer.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_nested_scope_is_rolled_back() {
        let mock = MockConnector::new();
        let exec = executor(&mock);

        let outer = exec.begin_transaction(TransactionOptions::default()).await.unwrap();
        let inner = outer.begin_nested().await.unwrap();
        inner.execute_sql("INSERT INTO t VALUES (2)", &[], None).await.unwrap();
        drop(inner);

        outer.execute_sql("INSERT INTO t VALUES (1)", &[], None).await.unwrap();
        outer.commit().await.unwrap();

        assert_eq!(
            mock.statements(),
            vec![
                "BEGIN",
                "SAVEPOINT sp_1",
                "INSERT INTO t VALUES (2)",
                "ROLLBACK TO SAVEPOINT sp_1",
                "RELEASE SAVEPOINT sp_1",
                "INSERT INTO t VALUES (1)",
                "COMMIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_nested_scopes_unwind_to_outermost() {
        let mock = MockConnector::new();
        let exec = executor(&mock);

        let outer = exec.begin_transaction(TransactionOptions::default()).await.unwrap();
        let first = outer.begin_nested().await.unwrap();
        let second = first.begin_nested().await.unwrap();
        drop(second);
        drop(first);

        outer.commit().await.unwrap();
        assert_eq!(outer.status(), TransactionStatus::Committed);
        let statements = mock.statements();
        assert_eq!(
            statements[3..],
            ["ROLLBACK TO SAVEPOINT sp_1", "RELEASE SAVEPOINT sp_1", "COMMIT"]
        );
    }

    #[tokio::test]
    async fn test_top_level_rollback_absorbs_dropped_nested_scope() {
        let mock = MockConnector::new();
        let exec = executor(&mock);

        let outer = exec.begin_transaction(TransactionOptions::default()).await.unwrap();
        drop(outer.begin_nested().await.unwrap());
        outer.rollback().await.unwrap();
        assert_eq!(mock.statements(), vec!["BEGIN", "SAVEPOINT sp_1", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_with_transaction_rolls_back_and_returns_original_error() {
        let mock = MockConnector::new();
        mock.fail_on("INSERT", EngineError::with_code("23505", "duplicate key value"), 1);
        let exec = executor(&mock);

        let err = exec
            .with_transaction(TransactionOptions::default(), |tx| async move {
                tx.execute_sql("INSERT INTO t VALUES (1)", &[], None).await?;
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Query);
        assert_eq!(err.engine().and_then(|e| e.code.as_deref()), Some("23505"));
        assert_eq!(mock.statements().last().map(String::as_str), Some("ROLLBACK"));
        assert_eq!(exec.pool().stats().active, 0);
    }

    #[tokio::test]
    async fn test_with_nested_isolates_failure() {
        let mock = MockConnector::new();
        mock.fail_on("INSERT INTO b", EngineError::with_code("23505", "duplicate key value"), 1);
        let exec = executor(&mock);

        let value = exec
            .with_transaction(TransactionOptions::default(), |tx| async move {
                tx.execute_sql("INSERT INTO a VALUES (1)", &[], None).await?;
                let nested = tx
                    .with_nested(|inner| async move {
                        inner.execute_sql("INSERT INTO b VALUES (1)", &[], None).await
                    })
                    .await;
                assert!(nested.is_err());
                Ok(7)
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(
            mock.statements(),
            vec![
                "BEGIN",
                "INSERT INTO a VALUES (1)",
                "SAVEPOINT sp_1",
                "INSERT INTO b VALUES (1)",
                "ROLLBACK TO SAVEPOINT sp_1",
                "COMMIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_statements_are_not_retried_inside_transaction() {
        let mock = MockConnector::new();
        mock.fail_on("SELECT 1", EngineError::with_code("57P01", "terminating connection"), 1);
        let exec = executor(&mock);

        let tx = exec.begin_transaction(TransactionOptions::default()).await.unwrap();
        assert!(tx.execute_sql("SELECT 1", &[], None).await.is_err());
        tx.rollback().await.unwrap();
        let runs = mock.statements().iter().filter(|s| *s == "SELECT 1").count();
        assert_eq!(runs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rolls_back() {
        let mock = MockConnector::new();
        let exec = executor(&mock);

        let tx = exec
            .begin_transaction(TransactionOptions::default().timeout(Duration::from_secs(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(tx.status(), TransactionStatus::Error);
        assert_eq!(mock.statements(), vec!["BEGIN", "ROLLBACK"]);
        assert_eq!(exec.pool().stats().active, 0);
        assert!(tx.execute_sql("SELECT 1", &[], None).await.is_err());

        tx.rollback().await.unwrap();
        assert_eq!(tx.status(), TransactionStatus::RolledBack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_cancels_timer() {
        let mock = MockConnector::new();
        let exec = executor(&mock);

        let tx = exec
            .begin_transaction(TransactionOptions::default().timeout(Duration::from_secs(1)))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(tx.status(), TransactionStatus::Committed);
        assert_eq!(mock.statements(), vec!["BEGIN", "COMMIT"]);
    }

    #[tokio::test]
    async fn test_failed_begin_is_transaction_error() {
        let mock = MockConnector::new();
        mock.fail_on("BEGIN", EngineError::with_code("25001", "already in transaction"), 1);
        let exec = executor(&mock);

        let err = exec.begin_transaction(TransactionOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transaction);
        assert_eq!(exec.pool().stats().active, 0);
    }

    #[tokio::test]
    async fn test_failed_commit_allows_rollback() {
        let mock = MockConnector::new();
        mock.fail_on("COMMIT", EngineError::with_code("40001", "could not serialize access"), 1);
        let exec = executor(&mock);

        let tx = exec.begin_transaction(TransactionOptions::default()).await.unwrap();
        assert!(tx.commit().await.is_err());
        assert_eq!(tx.status(), TransactionStatus::Error);
        tx.rollback().await.unwrap();
        assert_eq!(tx.status(), TransactionStatus::RolledBack);
        assert_eq!(exec.pool().stats().active, 0);
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_connection() {
        let mock = MockConnector::new();
        let exec = executor(&mock);

        let tx = exec.begin_transaction(TransactionOptions::default()).await.unwrap();
        drop(tx);
        let stats = exec.pool().stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total, 0);
    }
}
