//! Scripted in-memory connector for unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{Connector, Session};
use crate::error::EngineError;
use crate::row::QueryResult;
use crate::value::Value;

type Responder = Arc<dyn Fn(&str, &[Value]) -> Option<QueryResult> + Send + Sync>;

struct ScriptedFailure {
    needle: String,
    error: EngineError,
    remaining: u32,
}

#[derive(Default)]
struct State {
    next_session: AtomicU64,
    connects: AtomicU32,
    failing_connects: AtomicU32,
    connect_error: Mutex<Option<EngineError>>,
    connect_delay: Mutex<Option<Duration>>,
    statements: Mutex<Vec<(u64, String)>>,
    copies: Mutex<Vec<(String, Bytes)>>,
    failures: Mutex<Vec<ScriptedFailure>>,
    delays: Mutex<Vec<(String, Duration)>>,
    responder: Mutex<Option<Responder>>,
    closed: Mutex<Vec<u64>>,
}

/// Connector whose sessions log every statement and follow a script.
///
/// Cloning shares the script and the log, so a test can keep a handle after
/// moving the connector into a pool.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<State>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` connects fail with `error`.
    pub fn fail_connects(&self, n: u32, error: EngineError) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
        *self.state.connect_error.lock() = Some(error);
    }

    pub fn delay_connects(&self, delay: Duration) {
        *self.state.connect_delay.lock() = Some(delay);
    }

    /// Statements containing `needle` fail `times` times with `error`.
    pub fn fail_on(&self, needle: &str, error: EngineError, times: u32) {
        self.state.failures.lock().push(ScriptedFailure {
            needle: needle.to_string(),
            error,
            remaining: times,
        });
    }

    /// Statements containing `needle` take `delay` to complete.
    pub fn delay_on(&self, needle: &str, delay: Duration) {
        self.state.delays.lock().push((needle.to_string(), delay));
    }

    /// Produces results for `query` calls; unanswered queries return no rows.
    pub fn respond<F>(&self, f: F)
    where
        F: Fn(&str, &[Value]) -> Option<QueryResult> + Send + Sync + 'static,
    {
        *self.state.responder.lock() = Some(Arc::new(f));
    }

    /// Marks a session as closed, as if the server dropped it.
    pub fn close_session(&self, id: u64) {
        self.state.closed.lock().push(id);
    }

    pub fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.state
            .statements
            .lock()
            .iter()
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    pub fn statements_on(&self, session: u64) -> Vec<String> {
        self.state
            .statements
            .lock()
            .iter()
            .filter(|(id, _)| *id == session)
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    /// Sessions that ran a statement containing `needle`.
    pub fn sessions_running(&self, needle: &str) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .state
            .statements
            .lock()
            .iter()
            .filter(|(_, sql)| sql.contains(needle))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn copies(&self) -> Vec<(String, Bytes)> {
        self.state.copies.lock().clone()
    }

    pub fn clear_log(&self) {
        self.state.statements.lock().clear();
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Conn = MockSession;

    async fn connect(&self) -> Result<MockSession, EngineError> {
        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.state.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_connects.store(failing - 1, Ordering::SeqCst);
            let error = self
                .state
                .connect_error
                .lock()
                .clone()
                .unwrap_or_else(|| EngineError::with_code("08001", "connection refused"));
            return Err(error);
        }
        let id = self.state.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockSession {
            id,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

pub(crate) struct MockSession {
    pub id: u64,
    state: Arc<State>,
    closed: AtomicBool,
}

impl MockSession {
    /// Logs the statement, then applies scripted delays and failures.
    async fn run(&self, sql: &str) -> Result<(), EngineError> {
        self.state.statements.lock().push((self.id, sql.to_string()));

        let delay = self
            .state
            .delays
            .lock()
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = {
            let mut failures = self.state.failures.lock();
            failures
                .iter_mut()
                .find(|f| f.remaining > 0 && sql.contains(f.needle.as_str()))
                .map(|f| {
                    f.remaining -= 1;
                    f.error.clone()
                })
        };
        match failure {
            Some(error) => {
                if error.is_connection_failure() {
                    self.closed.store(true, Ordering::SeqCst);
                }
                Err(error)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Session for MockSession {
    async fn batch_execute(&self, sql: &str) -> Result<(), EngineError> {
        self.run(sql).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult, EngineError> {
        self.run(sql).await?;
        let responder = self.state.responder.lock().clone();
        Ok(responder
            .and_then(|f| f(sql, params))
            .unwrap_or_default())
    }

    async fn copy_in(&self, sql: &str, data: Bytes) -> Result<u64, EngineError> {
        self.run(sql).await?;
        let rows = data.iter().filter(|b| **b == b'\n').count() as u64;
        self.state.copies.lock().push((sql.to_string(), data));
        Ok(rows)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.state.closed.lock().contains(&self.id)
    }
}
