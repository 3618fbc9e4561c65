//! Error taxonomy for the bridge.
//!
//! Every failure surfaced to callers is a [`BridgeError`]. Variants map onto the
//! stable discriminators returned by [`BridgeError::kind`], and carry the engine
//! failure (if any) as their `source` so the root cause is never dropped.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::executor::classify::{self, CypherFailure};

/// Maximum statement length kept in error context and log lines.
const STATEMENT_PREVIEW: usize = 240;

/// A failure reported by PostgreSQL (or the transport beneath it).
///
/// Carries the SQLSTATE when the server produced one, so classification can key
/// on stable codes before falling back to message matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    /// Five-character SQLSTATE, e.g. `42703`.
    pub code: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// True when the underlying connection is gone.
    pub closed: bool,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            detail: None,
            hint: None,
            closed: false,
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Self::new(message)
        }
    }

    /// A failure caused by the connection being closed underneath us.
    pub fn closed(message: impl Into<String>) -> Self {
        Self {
            closed: true,
            ..Self::new(message)
        }
    }

    /// True for connection-level failures after which the session is unusable.
    pub fn is_connection_failure(&self) -> bool {
        self.closed || self.code.as_deref().is_some_and(|c| c.starts_with("08"))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " ({})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " detail: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {}

/// Statement, parameter summary and graph name attached to query failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryContext {
    pub statement: String,
    pub params: String,
    pub graph: Option<String>,
}

impl QueryContext {
    pub fn new(statement: &str, params: impl Into<String>) -> Self {
        Self {
            statement: preview(statement),
            params: params.into(),
            graph: None,
        }
    }

    pub fn with_graph(mut self, graph: &str) -> Self {
        self.graph = Some(graph.to_string());
        self
    }
}

impl fmt::Display for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.statement.is_empty() {
            return Ok(());
        }
        write!(f, " [statement: {}", self.statement)?;
        if !self.params.is_empty() {
            write!(f, "; params: {}", self.params)?;
        }
        if let Some(graph) = &self.graph {
            write!(f, "; graph: {}", graph)?;
        }
        write!(f, "]")
    }
}

/// Truncates statement text for error context and logs.
pub fn preview(statement: &str) -> String {
    let compact: String = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.chars().count() <= STATEMENT_PREVIEW {
        compact
    } else {
        let cut: String = compact.chars().take(STATEMENT_PREVIEW).collect();
        format!("{}…", cut)
    }
}

/// Stable error discriminator exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Query,
    Transaction,
    Pool,
    Timeout,
    Config,
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Query => "QueryError",
            ErrorKind::Transaction => "TransactionError",
            ErrorKind::Pool => "PoolError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Validation => "ValidationError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the pool, executor, transaction manager and batch loader.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Connection error: {message} (after {attempts} attempt(s))")]
    Connection {
        message: String,
        attempts: u32,
        #[source]
        source: Option<EngineError>,
    },

    #[error("Query error: {message}{context}")]
    Query {
        message: String,
        /// Engine-specific failure class, when the Cypher classifier recognised it.
        failure: Option<CypherFailure>,
        context: QueryContext,
        #[source]
        source: Option<EngineError>,
    },

    #[error("Transaction error: {message} (level {level})")]
    Transaction {
        message: String,
        level: u32,
        #[source]
        source: Option<EngineError>,
    },

    #[error("Pool error: {message}")]
    Pool { message: String },

    #[error("Timeout: {operation} exceeded {limit:?}{context}")]
    Timeout {
        operation: String,
        limit: Duration,
        context: QueryContext,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl BridgeError {
    /// Returns the stable discriminator for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Connection { .. } => ErrorKind::Connection,
            BridgeError::Query { .. } => ErrorKind::Query,
            BridgeError::Transaction { .. } => ErrorKind::Transaction,
            BridgeError::Pool { .. } => ErrorKind::Pool,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::Config(_) | BridgeError::InvalidConfig(_) => ErrorKind::Config,
            BridgeError::Validation(_) => ErrorKind::Validation,
        }
    }

    /// True when re-issuing the same statement may succeed.
    ///
    /// Only timeouts and transient engine failures qualify; acquisition failures
    /// have already been retried by the pool.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Timeout { .. } => true,
            BridgeError::Query {
                source: Some(engine),
                ..
            } => classify::is_transient(engine),
            _ => false,
        }
    }

    /// The engine failure underneath this error, if any.
    pub fn engine(&self) -> Option<&EngineError> {
        match self {
            BridgeError::Connection { source, .. }
            | BridgeError::Query { source, .. }
            | BridgeError::Transaction { source, .. } => source.as_ref(),
            _ => None,
        }
    }

    pub fn pool(message: impl Into<String>) -> Self {
        BridgeError::Pool {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        BridgeError::Validation(message.into())
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        BridgeError::InvalidConfig(message.into())
    }

    pub fn transaction(message: impl Into<String>, level: u32, source: Option<EngineError>) -> Self {
        BridgeError::Transaction {
            message: message.into(),
            level,
            source,
        }
    }

    /// A query failure with no engine-specific classification.
    pub fn query(message: impl Into<String>, context: QueryContext, source: Option<EngineError>) -> Self {
        BridgeError::Query {
            message: message.into(),
            failure: None,
            context,
            source,
        }
    }

    pub fn timeout(operation: impl Into<String>, limit: Duration, context: QueryContext) -> Self {
        BridgeError::Timeout {
            operation: operation.into(),
            limit,
            context,
        }
    }
}
