//! The physical connection seam.
//!
//! - [`Session`] - one physical connection: batch execute, parameterized query,
//!   COPY-in, closed check
//! - [`Connector`] - opens sessions; the pool owns one
//!
//! The production implementation is [`postgres::PgConnector`]. Unit tests use the
//! scripted connector in `mock`.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::EngineError;
use crate::row::QueryResult;
use crate::value::Value;

#[cfg(test)]
pub(crate) mod mock;
pub mod postgres;

pub use postgres::PgConnector;

/// One physical database connection.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Executes one or more statements separated by `;`, discarding results.
    async fn batch_execute(&self, sql: &str) -> Result<(), EngineError>;

    /// Executes a single parameterized statement and collects its rows.
    ///
    /// Parameters are bound positionally (`$1`, `$2`, ...).
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult, EngineError>;

    /// Streams pre-formatted COPY text into a `COPY ... FROM STDIN` statement.
    ///
    /// Returns the number of rows copied.
    async fn copy_in(&self, sql: &str, data: Bytes) -> Result<u64, EngineError>;

    /// True once the connection is known to be unusable.
    fn is_closed(&self) -> bool;
}

/// Opens physical connections for a pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Session;

    /// Opens a new physical connection.
    async fn connect(&self) -> Result<Self::Conn, EngineError>;

    /// Cheap liveness check run before a pooled connection is handed out again.
    async fn check(&self, conn: &Self::Conn) -> Result<(), EngineError> {
        if conn.is_closed() {
            Err(EngineError::closed("connection is closed"))
        } else {
            Ok(())
        }
    }

    /// Target description for logs; never includes credentials.
    fn describe(&self) -> String;
}
