//! deadpool manager that opens sessions and runs extension initializers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use deadpool::managed::{Manager, Metrics, RecycleError, RecycleResult};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use ulid::Ulid;

use super::hooks::{HookEvent, PoolHooks};
use super::initializer::ExtensionInitializer;
use super::PoolSettings;
use crate::error::EngineError;
use crate::session::{Connector, Session};

/// Failure while creating or recycling a physical session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect failed: {0}")]
    Connect(EngineError),

    #[error("critical initializer '{name}' failed: {source}")]
    Initializer { name: String, source: EngineError },

    #[error("stale connection: {0}")]
    Stale(String),
}

/// State shared by the pool handle, its manager and every leased connection.
pub(crate) struct Shared<C: Connector> {
    pub name: String,
    pub id: Ulid,
    pub connector: C,
    pub settings: PoolSettings,
    pub initializers: Vec<Arc<dyn ExtensionInitializer>>,
    pub hooks: RwLock<Vec<Arc<dyn PoolHooks>>>,
    pub leases: Mutex<HashSet<Ulid>>,
}

impl<C: Connector> Shared<C> {
    /// Runs every registered hook for `event`. Hook failures are logged only.
    pub async fn fire(&self, event: HookEvent<'_>) {
        let hooks: Vec<Arc<dyn PoolHooks>> = self.hooks.read().clone();
        for hook in hooks {
            if let Err(err) = event.dispatch(hook.as_ref(), &self.name).await {
                tracing::warn!(
                    pool = %self.name,
                    hook = event.name(),
                    error = %err,
                    "Pool hook failed"
                );
            }
        }
    }

    /// Runs every initializer's release cleanup, stopping at the first failure.
    pub async fn cleanup(&self, session: &dyn Session) -> Result<(), (String, EngineError)> {
        for init in &self.initializers {
            init.cleanup(session)
                .await
                .map_err(|e| (init.name().to_string(), e))?;
        }
        Ok(())
    }
}

/// A pooled session plus what the pool tracks between leases.
pub struct TrackedSession<S> {
    session: S,
    /// When the last lease ended, or when the session was opened.
    returned: Instant,
    /// Set when a lease ended without running initializer cleanup.
    needs_cleanup: bool,
}

impl<S> TrackedSession<S> {
    fn new(session: S) -> Self {
        Self {
            session,
            returned: Instant::now(),
            needs_cleanup: false,
        }
    }

    pub(crate) fn session(&self) -> &S {
        &self.session
    }

    /// Records the end of a lease; `cleaned` tells whether cleanup already ran.
    pub(crate) fn mark_returned(&mut self, cleaned: bool) {
        self.returned = Instant::now();
        self.needs_cleanup = !cleaned;
    }
}

pub struct SessionManager<C: Connector> {
    pub(crate) shared: Arc<Shared<C>>,
}

impl<C: Connector> Manager for SessionManager<C> {
    type Type = TrackedSession<C::Conn>;
    type Error = SessionError;

    async fn create(&self) -> Result<TrackedSession<C::Conn>, SessionError> {
        let shared = &self.shared;
        shared.fire(HookEvent::BeforeConnect).await;

        let session = shared
            .connector
            .connect()
            .await
            .map_err(SessionError::Connect)?;

        for init in &shared.initializers {
            match init.initialize(&session).await {
                Ok(()) => {
                    tracing::debug!(pool = %shared.name, initializer = init.name(), "Initializer applied");
                }
                Err(source) if init.is_critical() => {
                    tracing::error!(
                        pool = %shared.name,
                        initializer = init.name(),
                        error = %source,
                        "Critical initializer failed"
                    );
                    return Err(SessionError::Initializer {
                        name: init.name().to_string(),
                        source,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        pool = %shared.name,
                        initializer = init.name(),
                        error = %err,
                        "Initializer failed, continuing"
                    );
                }
            }
        }

        shared.fire(HookEvent::AfterConnect).await;
        tracing::debug!(pool = %shared.name, target = %shared.connector.describe(), "Opened connection");
        Ok(TrackedSession::new(session))
    }

    async fn recycle(
        &self,
        conn: &mut TrackedSession<C::Conn>,
        _metrics: &Metrics,
    ) -> RecycleResult<SessionError> {
        let shared = &self.shared;
        // Idle time counts from the end of the last lease, not its checkout.
        let idle = conn.returned.elapsed();
        let mut verdict = if idle > shared.settings.idle_timeout {
            Err(SessionError::Stale(format!("idle for {:?}", idle)))
        } else {
            shared
                .connector
                .check(&conn.session)
                .await
                .map_err(|e| SessionError::Stale(e.to_string()))
        };
        if verdict.is_ok() && conn.needs_cleanup {
            verdict = shared.cleanup(&conn.session).await.map_err(|(initializer, err)| {
                SessionError::Stale(format!("cleanup by '{}' failed: {}", initializer, err))
            });
            conn.needs_cleanup = verdict.is_err();
        }

        if let Err(err) = verdict {
            tracing::debug!(pool = %shared.name, reason = %err, "Discarding pooled connection");
            shared.fire(HookEvent::BeforeDisconnect).await;
            shared.fire(HookEvent::AfterDisconnect).await;
            return Err(RecycleError::Backend(err));
        }
        Ok(())
    }
}
