//! Executor traits shared by the pooled executor and transactions.
//!
//! - [`SqlExecutor`] - parameterized SQL and COPY
//! - [`CypherExecutor`] - Cypher through AGE's `cypher()` function
//!
//! Code written against these traits runs unchanged in auto-commit mode
//! ([`QueryExecutor`](crate::executor::QueryExecutor)) or inside a
//! [`Transaction`](crate::transaction::Transaction).

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BridgeError;
use crate::executor::QueryOptions;
use crate::row::QueryResult;
use crate::value::{Params, Value};

/// Executes SQL statements.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Executes one parameterized statement (`$1`, `$2`, ...) and collects its rows.
    ///
    /// `options` overrides the executor defaults for timeout and retries.
    async fn execute_sql(
        &self,
        sql: &str,
        params: &[Value],
        options: Option<&QueryOptions>,
    ) -> Result<QueryResult, BridgeError>;

    /// Streams COPY text into a `COPY ... FROM STDIN` statement.
    ///
    /// Returns the number of rows copied.
    async fn execute_copy_from(
        &self,
        sql: &str,
        data: Bytes,
        options: Option<&QueryOptions>,
    ) -> Result<u64, BridgeError>;
}

/// Executes Cypher queries against an AGE graph.
#[async_trait]
pub trait CypherExecutor: Send + Sync {
    /// Compiles `cypher` into a `cypher()` call on `graph` and executes it.
    ///
    /// Result columns are named after the final RETURN clause and hold agtype
    /// values decoded into [`Value`].
    async fn execute_cypher(
        &self,
        cypher: &str,
        params: &Params,
        graph: &str,
        options: Option<&QueryOptions>,
    ) -> Result<QueryResult, BridgeError>;

    /// Graph used when a caller does not name one.
    fn default_graph(&self) -> Option<&str>;
}
