//! Per-connection extension initializers.
//!
//! Each fresh physical connection runs the pool's initializers once, in
//! registration order, before it is handed out. Statements are idempotent
//! (`IF NOT EXISTS`) so reconnects are safe.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SessionConfig;
use crate::cypher::quote_ident;
use crate::error::EngineError;
use crate::session::Session;
use crate::value::Value;

/// Session-scoped key/value table created on every connection.
pub const SCRATCH_TABLE: &str = "_age_bridge_scratch";

/// A named unit of per-connection setup with optional per-release cleanup.
#[async_trait]
pub trait ExtensionInitializer: Send + Sync {
    fn name(&self) -> &str;

    /// Critical failures abort acquisition; others are logged and skipped.
    fn is_critical(&self) -> bool {
        false
    }

    async fn initialize(&self, session: &dyn Session) -> Result<(), EngineError>;

    /// Runs when a connection is released back to the pool.
    async fn cleanup(&self, _session: &dyn Session) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Loads Apache AGE, optionally creating the extension first.
#[derive(Debug, Clone)]
pub struct AgeExtension {
    pub create: bool,
    pub load: bool,
}

#[async_trait]
impl ExtensionInitializer for AgeExtension {
    fn name(&self) -> &str {
        "age"
    }

    fn is_critical(&self) -> bool {
        true
    }

    async fn initialize(&self, session: &dyn Session) -> Result<(), EngineError> {
        if self.create {
            session
                .batch_execute("CREATE EXTENSION IF NOT EXISTS age")
                .await?;
        }
        if self.load {
            session.batch_execute("LOAD 'age'").await?;
        }
        Ok(())
    }
}

/// Sets the session search path so AGE's catalog functions resolve.
#[derive(Debug, Clone)]
pub struct SearchPath(pub String);

#[async_trait]
impl ExtensionInitializer for SearchPath {
    fn name(&self) -> &str {
        "search_path"
    }

    async fn initialize(&self, session: &dyn Session) -> Result<(), EngineError> {
        session
            .batch_execute(&format!("SET search_path = {}", self.0))
            .await
    }
}

/// Creates the per-session scratch table and empties it on release.
#[derive(Debug, Clone, Default)]
pub struct ScratchTable;

#[async_trait]
impl ExtensionInitializer for ScratchTable {
    fn name(&self) -> &str {
        "scratch_table"
    }

    async fn initialize(&self, session: &dyn Session) -> Result<(), EngineError> {
        session
            .batch_execute(&format!(
                "CREATE TEMP TABLE IF NOT EXISTS {} (key text PRIMARY KEY, value text)",
                SCRATCH_TABLE
            ))
            .await
    }

    async fn cleanup(&self, session: &dyn Session) -> Result<(), EngineError> {
        session
            .batch_execute(&format!("TRUNCATE {}", SCRATCH_TABLE))
            .await
    }
}

/// Best-effort `CREATE EXTENSION` for auxiliary extensions such as `pg_trgm`.
#[derive(Debug, Clone)]
pub struct SecondaryExtension(pub String);

#[async_trait]
impl ExtensionInitializer for SecondaryExtension {
    fn name(&self) -> &str {
        &self.0
    }

    async fn initialize(&self, session: &dyn Session) -> Result<(), EngineError> {
        session
            .batch_execute(&format!(
                "CREATE EXTENSION IF NOT EXISTS {}",
                quote_ident(&self.0)
            ))
            .await
    }
}

/// Builds the initializer list described by the `session` config section.
pub fn default_initializers(config: &SessionConfig) -> Vec<Arc<dyn ExtensionInitializer>> {
    let mut initializers: Vec<Arc<dyn ExtensionInitializer>> = Vec::new();
    if config.create_extension || config.load_age {
        initializers.push(Arc::new(AgeExtension {
            create: config.create_extension,
            load: config.load_age,
        }));
    }
    if !config.search_path.trim().is_empty() {
        initializers.push(Arc::new(SearchPath(config.search_path.clone())));
    }
    if config.scratch_table {
        initializers.push(Arc::new(ScratchTable));
    }
    for name in &config.secondary_extensions {
        initializers.push(Arc::new(SecondaryExtension(name.clone())));
    }
    initializers
}

/// Stores `value` under `key` in the session scratch table.
pub async fn stash(session: &dyn Session, key: &str, value: &str) -> Result<(), EngineError> {
    let sql = format!(
        "INSERT INTO {} (key, value) VALUES ($1, $2) \
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        SCRATCH_TABLE
    );
    session
        .query(&sql, &[Value::from(key), Value::from(value)])
        .await
        .map(|_| ())
}

/// Reads a value previously stored with [`stash`] on the same session.
pub async fn stashed(session: &dyn Session, key: &str) -> Result<Option<String>, EngineError> {
    let sql = format!("SELECT value FROM {} WHERE key = $1", SCRATCH_TABLE);
    let result = session.query(&sql, &[Value::from(key)]).await?;
    Ok(result
        .first()
        .and_then(|row| row.get_raw("value"))
        .and_then(|v| v.as_str().map(str::to_string)))
}
