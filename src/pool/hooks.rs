//! Pool lifecycle hooks.
//!
//! Hooks observe the pool; they can never affect it. Every hook error is
//! logged and dropped.

use async_trait::async_trait;

use crate::error::BridgeError;

pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Observer for connection lifecycle events. All methods default to no-ops.
#[async_trait]
pub trait PoolHooks: Send + Sync {
    async fn before_connect(&self, _pool: &str) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_connect(&self, _pool: &str) -> Result<(), HookError> {
        Ok(())
    }

    async fn before_disconnect(&self, _pool: &str) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_disconnect(&self, _pool: &str) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_error(&self, _pool: &str, _error: &BridgeError) -> Result<(), HookError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum HookEvent<'a> {
    BeforeConnect,
    AfterConnect,
    BeforeDisconnect,
    AfterDisconnect,
    Error(&'a BridgeError),
}

impl HookEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::BeforeConnect => "before_connect",
            HookEvent::AfterConnect => "after_connect",
            HookEvent::BeforeDisconnect => "before_disconnect",
            HookEvent::AfterDisconnect => "after_disconnect",
            HookEvent::Error(_) => "on_error",
        }
    }

    pub async fn dispatch(self, hook: &dyn PoolHooks, pool: &str) -> Result<(), HookError> {
        match self {
            HookEvent::BeforeConnect => hook.before_connect(pool).await,
            HookEvent::AfterConnect => hook.after_connect(pool).await,
            HookEvent::BeforeDisconnect => hook.before_disconnect(pool).await,
            HookEvent::AfterDisconnect => hook.after_disconnect(pool).await,
            HookEvent::Error(error) => hook.on_error(pool, error).await,
        }
    }
}
