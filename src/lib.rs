//! age-bridge - SQL and Cypher execution for PostgreSQL + Apache AGE.
//!
//! Runs relational and graph queries against one PostgreSQL instance with
//! the AGE extension, handling the session setup AGE needs, the column list
//! its `cypher()` function must be given up front, and recovery from
//! transient connection failures.
//!
//! ```ignore
//! use age_bridge::{Config, ConnectionPool, QueryExecutor, QueryExt};
//!
//! let config = Config::load()?;
//! let pool = ConnectionPool::from_config("main", &config)?;
//! let executor = QueryExecutor::from_config(pool, &config);
//!
//! let rows = executor
//!     .query("MATCH (p:Person) WHERE p.age > $min RETURN p.name AS name")
//!     .param("min", 30)
//!     .fetch_all()
//!     .await?;
//! ```

pub mod batch;
pub mod config;
pub mod cypher;
pub mod error;
pub mod executor;
pub mod pool;
pub mod query;
pub mod row;
pub mod session;
pub mod traits;
pub mod transaction;
pub mod value;

pub use batch::{BatchLoader, BatchOptions, BatchOutcome, RecordValidator};
pub use config::Config;
pub use error::{BridgeError, EngineError, ErrorKind};
pub use executor::{QueryExecutor, QueryOptions};
pub use pool::{ConnectionPool, PoolScope, PoolStats, PooledConnection};
pub use query::{Query, QueryExt};
pub use row::{QueryResult, Row};
pub use session::PgConnector;
pub use traits::{CypherExecutor, SqlExecutor};
pub use transaction::{IsolationLevel, Transaction, TransactionOptions, TransactionStatus};
pub use value::{Params, Value};
