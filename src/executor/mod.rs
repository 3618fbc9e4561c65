//! Query execution: SQL, Cypher and COPY through one retry-aware path.
//!
//! Every statement leases a connection from the pool, runs under an optional
//! timeout, and is retried on transient failures. Cypher is compiled into a
//! call of AGE's `cypher()` function before it reaches the same path.

pub mod classify;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{Config, QueryConfig, SessionConfig};
use crate::cypher::{compile, AgeCall};
use crate::error::{preview, BridgeError, EngineError, QueryContext};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::row::QueryResult;
use crate::session::{Connector, Session};
use crate::traits::{CypherExecutor, SqlExecutor};
use crate::value::{summarize_params, summarize_positional, Params, Value};

/// Per-call execution options.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// `None` runs without a client-side limit.
    pub timeout: Option<Duration>,
    /// Retries after the first attempt, for retryable failures only.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl QueryOptions {
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            timeout: (config.timeout_ms > 0).then(|| Duration::from_millis(config.timeout_ms)),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = delay;
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.max_retries = 0;
        self
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::from_config(&QueryConfig::default())
    }
}

/// One unit of work for a session.
pub(crate) enum Statement<'a> {
    Sql { text: &'a str, params: &'a [Value] },
    /// Transaction control and other statements without results.
    Control { text: &'a str },
    /// `setup` re-establishes the AGE session state before the call.
    Cypher { call: &'a AgeCall, setup: &'a str },
    Copy { text: &'a str, data: Bytes },
}

impl Statement<'_> {
    fn text(&self) -> &str {
        match self {
            Statement::Sql { text, .. }
            | Statement::Control { text }
            | Statement::Copy { text, .. } => text,
            Statement::Cypher { call, .. } => &call.sql,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Statement::Sql { .. } => "sql",
            Statement::Control { .. } => "control",
            Statement::Cypher { .. } => "cypher",
            Statement::Copy { .. } => "copy",
        }
    }
}

pub(crate) enum Outcome {
    Rows(QueryResult),
    Copied(u64),
}

impl Outcome {
    pub fn into_result(self) -> QueryResult {
        match self {
            Outcome::Rows(result) => result,
            Outcome::Copied(n) => QueryResult::affected(n),
        }
    }

    pub fn into_count(self) -> u64 {
        match self {
            Outcome::Rows(result) => result.rows_affected,
            Outcome::Copied(n) => n,
        }
    }

    fn count(&self) -> u64 {
        match self {
            Outcome::Rows(result) => result.row_count(),
            Outcome::Copied(n) => *n,
        }
    }
}

async fn dispatch<S: Session>(session: &S, stmt: &Statement<'_>) -> Result<Outcome, EngineError> {
    match stmt {
        Statement::Sql { text, params } => session.query(text, params).await.map(Outcome::Rows),
        Statement::Control { text } => session
            .batch_execute(text)
            .await
            .map(|()| Outcome::Rows(QueryResult::default())),
        Statement::Cypher { call, setup } => {
            session.batch_execute(setup).await?;
            session.query(&call.sql, &call.args).await.map(Outcome::Rows)
        }
        Statement::Copy { text, data } => session.copy_in(text, data.clone()).await.map(Outcome::Copied),
    }
}

/// Maps an engine failure to the public taxonomy, classifying Cypher failures.
fn engine_failure(stmt: &Statement<'_>, err: EngineError, context: &QueryContext) -> BridgeError {
    let failure = match stmt {
        Statement::Cypher { .. } => classify::classify(&err),
        _ => None,
    };
    match failure {
        Some(failure) => BridgeError::Query {
            message: format!("{} (hint: {})", err.message, failure.hint()),
            failure: Some(failure),
            context: context.clone(),
            source: Some(err),
        },
        None => BridgeError::query(err.message.clone(), context.clone(), Some(err)),
    }
}

/// Runs one statement once on `conn`.
///
/// A timeout or connection-level failure marks the connection `Error` so that
/// it is discarded rather than reused.
pub(crate) async fn attempt<C: Connector>(
    conn: &mut PooledConnection<C>,
    stmt: &Statement<'_>,
    timeout: Option<Duration>,
    context: &QueryContext,
) -> Result<Outcome, BridgeError> {
    conn.record_statement(stmt.text());
    let started = Instant::now();

    let result = {
        let run = dispatch(conn.session()?, stmt);
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result.map_err(Some),
                Err(_) => Err(None),
            },
            None => run.await.map_err(Some),
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(outcome) => {
            tracing::debug!(
                kind = stmt.kind(),
                statement = %preview(stmt.text()),
                params = %context.params,
                rows = outcome.count(),
                duration_ms,
                "Statement executed"
            );
            Ok(outcome)
        }
        Err(Some(err)) => {
            if err.is_connection_failure() {
                conn.mark_error();
            }
            tracing::warn!(
                kind = stmt.kind(),
                statement = %preview(stmt.text()),
                params = %context.params,
                duration_ms,
                error = %err,
                "Statement failed"
            );
            Err(engine_failure(stmt, err, context))
        }
        Err(None) => {
            conn.mark_error();
            let limit = timeout.unwrap_or_default();
            tracing::warn!(
                kind = stmt.kind(),
                statement = %preview(stmt.text()),
                params = %context.params,
                limit_ms = limit.as_millis() as u64,
                "Statement timed out"
            );
            Err(BridgeError::timeout(stmt.kind(), limit, context.clone()))
        }
    }
}

pub(crate) fn positional_context(sql: &str, params: &[Value]) -> Result<QueryContext, BridgeError> {
    for (i, value) in params.iter().enumerate() {
        value.validate(&format!("${}", i + 1))?;
    }
    Ok(QueryContext::new(sql, summarize_positional(params)))
}

pub(crate) fn cypher_context(cypher: &str, params: &Params, graph: &str) -> QueryContext {
    QueryContext::new(cypher, summarize_params(params)).with_graph(graph)
}

/// Statements run before every Cypher call.
pub(crate) fn session_setup(search_path: &str) -> String {
    format!("LOAD 'age'; SET search_path = {}", search_path)
}

/// Auto-commit executor: one pooled connection per attempt.
///
/// Cheap to clone; clones share the pool.
pub struct QueryExecutor<C: Connector> {
    pool: ConnectionPool<C>,
    defaults: QueryOptions,
    setup: String,
    default_graph: Option<String>,
}

impl<C: Connector> Clone for QueryExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            defaults: self.defaults.clone(),
            setup: self.setup.clone(),
            default_graph: self.default_graph.clone(),
        }
    }
}

impl<C: Connector> QueryExecutor<C> {
    pub fn new(pool: ConnectionPool<C>) -> Self {
        Self {
            pool,
            defaults: QueryOptions::default(),
            setup: session_setup(&SessionConfig::default().search_path),
            default_graph: None,
        }
    }

    pub fn from_config(pool: ConnectionPool<C>, config: &Config) -> Self {
        Self {
            pool,
            defaults: QueryOptions::from_config(&config.query),
            setup: session_setup(&config.session.search_path),
            default_graph: config.session.graph.clone(),
        }
    }

    pub fn with_options(mut self, defaults: QueryOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_graph(mut self, graph: impl Into<String>) -> Self {
        self.default_graph = Some(graph.into());
        self
    }

    pub fn with_search_path(mut self, search_path: &str) -> Self {
        self.setup = session_setup(search_path);
        self
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn defaults(&self) -> &QueryOptions {
        &self.defaults
    }

    pub(crate) fn setup(&self) -> &str {
        &self.setup
    }

    async fn run(
        &self,
        stmt: Statement<'_>,
        options: Option<&QueryOptions>,
        context: QueryContext,
    ) -> Result<Outcome, BridgeError> {
        let options = options.unwrap_or(&self.defaults);
        let mut retries = 0;
        loop {
            let mut conn = self.pool.acquire().await?;
            let result = attempt(&mut conn, &stmt, options.timeout, &context).await;
            if let Err(err) = self.pool.release(conn).await {
                tracing::warn!(error = %err, "Failed to release connection");
            }

            match result {
                Err(err) if err.is_retryable() && retries < options.max_retries => {
                    retries += 1;
                    tracing::warn!(
                        kind = stmt.kind(),
                        retry = retries,
                        max_retries = options.max_retries,
                        error = %err,
                        "Retrying statement"
                    );
                    tokio::time::sleep(options.retry_delay).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<C: Connector> SqlExecutor for QueryExecutor<C> {
    async fn execute_sql(
        &self,
        sql: &str,
        params: &[Value],
        options: Option<&QueryOptions>,
    ) -> Result<QueryResult, BridgeError> {
        let context = positional_context(sql, params)?;
        let stmt = Statement::Sql { text: sql, params };
        self.run(stmt, options, context).await.map(Outcome::into_result)
    }

    async fn execute_copy_from(
        &self,
        sql: &str,
        data: Bytes,
        options: Option<&QueryOptions>,
    ) -> Result<u64, BridgeError> {
        let context = QueryContext::new(sql, format!("{} bytes", data.len()));
        let stmt = Statement::Copy { text: sql, data };
        self.run(stmt, options, context).await.map(Outcome::into_count)
    }
}

#[async_trait]
impl<C: Connector> CypherExecutor for QueryExecutor<C> {
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
            setup: &self.setup,
        };
        self.run(stmt, options, context).await.map(Outcome::into_result)
    }

    fn default_graph(&self) -> Option<&str> {
        self.default_graph.as_deref()
    }
}
