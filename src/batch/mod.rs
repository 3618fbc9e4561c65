//! Bulk vertex creation.
//!
//! Records are validated up front, then written to the label's vertex table
//! in one of three ways:
//!
//! - one multi-row `INSERT` when the batch fits in `batch_size`
//! - chunked multi-row inserts inside one transaction
//! - a staging temp table filled with `COPY`, then one `INSERT ... SELECT`
//!
//! All paths return the created rows (`id`, `properties`) in record order.

mod copy;
mod metrics;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use ulid::Ulid;

pub use copy::{escape, CopyText};
pub use metrics::BatchMetrics;

use crate::config::BatchConfig;
use crate::cypher::{quote_ident, validate_graph_name};
use crate::error::BridgeError;
use crate::executor::QueryExecutor;
use crate::row::Row;
use crate::session::Connector;
use crate::traits::{CypherExecutor, SqlExecutor};
use crate::transaction::{Transaction, TransactionOptions};
use crate::value::{validate_params, Params, Value};

/// PostgreSQL's limit on bind parameters in one statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Checks one record before anything is written.
pub trait RecordValidator: Send + Sync {
    fn validate(&self, index: usize, record: &Params) -> Result<(), BridgeError>;
}

/// Rejects empty property names and non-finite floats.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralValidator;

impl RecordValidator for StructuralValidator {
    fn validate(&self, index: usize, record: &Params) -> Result<(), BridgeError> {
        validate_params(record).map_err(|err| match err {
            BridgeError::Validation(message) => {
                BridgeError::validation(format!("record {}: {}", index, message))
            }
            other => other,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    /// Falls back to the executor's default graph.
    pub graph: Option<String>,
    /// Largest load written with a single `INSERT`, capped at [`MAX_BIND_PARAMS`].
    pub batch_size: usize,
    /// Rows per `INSERT` on the chunked path, capped at [`MAX_BIND_PARAMS`].
    pub chunk_size: usize,
    pub use_staging: bool,
    pub collect_metrics: bool,
}

impl BatchOptions {
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            graph: None,
            batch_size: config.batch_size,
            chunk_size: config.batch_size,
            use_staging: config.use_staging,
            collect_metrics: config.collect_metrics,
        }
    }

    pub fn graph(mut self, graph: impl Into<String>) -> Self {
        self.graph = Some(graph.into());
        self
    }

    fn effective_chunk(&self) -> usize {
        self.chunk_size.clamp(1, MAX_BIND_PARAMS)
    }

    fn plan(&self, items: usize) -> Plan {
        if items <= self.batch_size.clamp(1, MAX_BIND_PARAMS) {
            Plan::Single
        } else if self.use_staging {
            Plan::Staging
        } else {
            Plan::Chunked
        }
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from_config(&BatchConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub rows: Vec<Row>,
    pub metrics: Option<BatchMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Single,
    Chunked,
    Staging,
}

struct Insert {
    sql: String,
    params: Vec<Value>,
}

struct StagingLoad {
    create: String,
    copy: String,
    data: bytes::Bytes,
    insert: String,
    drop: String,
}

/// Checks that a vertex label is a plain identifier.
pub fn validate_label(label: &str) -> Result<(), BridgeError> {
    let mut chars = label.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BridgeError::validation(format!(
            "invalid label '{}': expected letters, digits and underscores",
            label
        )));
    }
    Ok(())
}

fn insert_statement(target: &str, records: Vec<Params>) -> Insert {
    let placeholders: Vec<String> = (1..=records.len()).map(|i| format!("(${})", i)).collect();
    Insert {
        sql: format!(
            "INSERT INTO {} (properties) VALUES {} RETURNING id, properties",
            target,
            placeholders.join(", ")
        ),
        params: records.into_iter().map(Value::Map).collect(),
    }
}

fn staging_load(target: &str, records: &[Params]) -> Result<StagingLoad, BridgeError> {
    let staging = quote_ident(&format!(
        "_age_bridge_staging_{}",
        Ulid::new().to_string().to_lowercase()
    ));
    let mut copy = CopyText::with_capacity(records.len() * 64);
    for (ord, record) in records.iter().enumerate() {
        let properties = Value::Map(record.clone()).to_json_text(&format!("record {}", ord))?;
        copy.push_row([Some(ord.to_string()), Some(properties)]);
    }
    Ok(StagingLoad {
        create: format!(
            "CREATE TEMP TABLE {} AS SELECT 0::bigint AS ord, properties FROM {} WITH NO DATA",
            staging, target
        ),
        copy: format!("COPY {} (ord, properties) FROM STDIN", staging),
        data: copy.finish(),
        insert: format!(
            "INSERT INTO {} (properties) SELECT properties FROM {} ORDER BY ord RETURNING id, properties",
            target, staging
        ),
        drop: format!("DROP TABLE IF EXISTS {}", staging),
    })
}

/// Loads record sets into AGE vertex tables.
pub struct BatchLoader<C: Connector> {
    executor: QueryExecutor<C>,
    validator: Arc<dyn RecordValidator>,
    defaults: BatchOptions,
}

impl<C: Connector> BatchLoader<C> {
    pub fn new(executor: QueryExecutor<C>) -> Self {
        Self {
            executor,
            validator: Arc::new(StructuralValidator),
            defaults: BatchOptions::default(),
        }
    }

    pub fn from_config(executor: QueryExecutor<C>, config: &BatchConfig) -> Self {
        Self {
            defaults: BatchOptions::from_config(config),
            ..Self::new(executor)
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn RecordValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn defaults(&self) -> &BatchOptions {
        &self.defaults
    }

    /// Creates one vertex per record under `label`.
    pub async fn create_many(
        &self,
        label: &str,
        records: Vec<Params>,
        options: Option<&BatchOptions>,
    ) -> Result<BatchOutcome, BridgeError> {
        self.load(label, records, options.unwrap_or(&self.defaults), None)
            .await
    }

    /// Like [`create_many`](Self::create_many), inside the caller's transaction.
    ///
    /// Multi-statement paths run in a nested scope so a failure leaves the
    /// caller's transaction usable.
    pub async fn create_many_in(
        &self,
        tx: &Transaction<C>,
        label: &str,
        records: Vec<Params>,
        options: Option<&BatchOptions>,
    ) -> Result<BatchOutcome, BridgeError> {
        self.load(label, records, options.unwrap_or(&self.defaults), Some(tx))
            .await
    }

    async fn load(
        &self,
        label: &str,
        records: Vec<Params>,
        options: &BatchOptions,
        tx: Option<&Transaction<C>>,
    ) -> Result<BatchOutcome, BridgeError> {
        let started = Instant::now();
        let graph = options
            .graph
            .as_deref()
            .or_else(|| self.executor.default_graph())
            .ok_or_else(|| BridgeError::invalid_config("graph name is required for batch loads"))?
            .to_string();
        validate_graph_name(&graph)?;
        validate_label(label)?;
        for (index, record) in records.iter().enumerate() {
            self.validator.validate(index, record)?;
        }
        let mut metrics = BatchMetrics {
            items: records.len(),
            validation: started.elapsed(),
            ..BatchMetrics::default()
        };

        if records.is_empty() {
            return Ok(BatchOutcome {
                rows: Vec::new(),
                metrics: options.collect_metrics.then_some(metrics),
            });
        }

        let target = format!("{}.{}", quote_ident(&graph), quote_ident(label));
        let plan = options.plan(records.len());
        tracing::debug!(
            label,
            graph = %graph,
            items = records.len(),
            plan = ?plan,
            "Starting batch load"
        );

        let (rows, generation, execution) = match plan {
            Plan::Single => {
                let t = Instant::now();
                let insert = insert_statement(&target, records);
                let generation = t.elapsed();
                let t = Instant::now();
                let result = match tx {
                    Some(tx) => tx.execute_sql(&insert.sql, &insert.params, None).await?,
                    None => self.executor.execute_sql(&insert.sql, &insert.params, None).await?,
                };
                (result.rows, generation, t.elapsed())
            }
            Plan::Chunked => {
                let t = Instant::now();
                let chunk = options.effective_chunk();
                let mut inserts = Vec::with_capacity(records.len().div_ceil(chunk));
                let mut remaining = records.into_iter();
                loop {
                    let slice: Vec<Params> = remaining.by_ref().take(chunk).collect();
                    if slice.is_empty() {
                        break;
                    }
                    inserts.push(insert_statement(&target, slice));
                }
                let generation = t.elapsed();
                let t = Instant::now();
                let rows = self
                    .in_scope(tx, |scope| async move {
                        let mut rows = Vec::new();
                        for insert in &inserts {
                            let result = scope.execute_sql(&insert.sql, &insert.params, None).await?;
                            rows.extend(result.rows);
                        }
                        Ok(rows)
                    })
                    .await?;
                (rows, generation, t.elapsed())
            }
            Plan::Staging => {
                let t = Instant::now();
                let load = staging_load(&target, &records)?;
                let generation = t.elapsed();
                let t = Instant::now();
                let rows = self
                    .in_scope(tx, |scope| async move {
                        scope.execute_sql(&load.create, &[], None).await?;
                        let loaded = async {
                            scope.execute_copy_from(&load.copy, load.data.clone(), None).await?;
                            scope.execute_sql(&load.insert, &[], None).await
                        }
                        .await;
                        if let Err(err) = scope.execute_sql(&load.drop, &[], None).await {
                            tracing::warn!(error = %err, "Failed to drop staging table");
                        }
                        loaded.map(|result| result.rows)
                    })
                    .await?;
                (rows, generation, t.elapsed())
            }
        };

        metrics.sql_generation = generation;
        metrics.execution = execution;
        metrics.total = started.elapsed();
        tracing::info!(
            label,
            graph = %graph,
            items = metrics.items,
            plan = ?plan,
            duration_ms = metrics.total.as_millis() as u64,
            "Batch load complete"
        );
        Ok(BatchOutcome {
            rows,
            metrics: options.collect_metrics.then_some(metrics),
        })
    }

    /// Runs `f` in a nested scope of `tx`, or in a new transaction.
    async fn in_scope<F, Fut, T>(&self, tx: Option<&Transaction<C>>, f: F) -> Result<T, BridgeError>
    where
        F: FnOnce(Transaction<C>) -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        match tx {
            Some(tx) => tx.with_nested(f).await,
            None => {
                self.executor
                    .with_transaction(TransactionOptions::default(), f)
                    .await
            }
        }
    }
}
