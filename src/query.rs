//! Query builder for fluent Cypher query construction.

use serde::Serialize;

use crate::error::BridgeError;
use crate::executor::QueryOptions;
use crate::row::{QueryResult, Row};
use crate::traits::CypherExecutor;
use crate::value::{Params, Value};

/// A builder for constructing and executing Cypher queries.
///
/// `Query` provides a fluent API for adding parameters and executing
/// queries against any [`CypherExecutor`].
///
/// # Example
///
/// ```ignore
/// let rows = executor
///     .query("MATCH (n:Entity) WHERE n.id = $id RETURN n")
///     .param("id", "entity-123")
///     .on_graph("knowledge")
///     .fetch_all()
///     .await?;
/// ```
pub struct Query<'a, E: CypherExecutor + ?Sized> {
    executor: &'a E,
    cypher: String,
    params: Params,
    graph: Option<String>,
    options: Option<QueryOptions>,
    error: Option<BridgeError>,
}

impl<'a, E: CypherExecutor + ?Sized> Query<'a, E> {
    pub fn new(executor: &'a E, cypher: &str) -> Self {
        Self {
            executor,
            cypher: cypher.to_string(),
            params: Params::new(),
            graph: None,
            options: None,
            error: None,
        }
    }

    /// Adds a parameter to the query.
    ///
    /// Parameters are referenced in Cypher using `$name` syntax. A value that
    /// cannot be serialized is reported when the query executes.
    pub fn param<T: Serialize>(mut self, name: &str, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(json) => {
                self.params.insert(name.to_string(), Value::from(json));
            }
            Err(e) => {
                self.error.get_or_insert_with(|| {
                    BridgeError::validation(format!("failed to serialize parameter '{}': {}", name, e))
                });
            }
        }
        self
    }

    /// Adds a parameter that's already a [`Value`].
    pub fn param_value(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    /// Targets `graph` instead of the executor's default graph.
    pub fn on_graph(mut self, graph: &str) -> Self {
        self.graph = Some(graph.to_string());
        self
    }

    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Executes the query and returns the full result.
    pub async fn execute(self) -> Result<QueryResult, BridgeError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let graph = match self.graph.as_deref().or_else(|| self.executor.default_graph()) {
            Some(graph) => graph.to_string(),
            None => {
                return Err(BridgeError::invalid_config(
                    "graph name is required for Cypher queries",
                ))
            }
        };
        self.executor
            .execute_cypher(&self.cypher, &self.params, &graph, self.options.as_ref())
            .await
    }

    /// Executes the query and collects all rows into a vector.
    pub async fn fetch_all(self) -> Result<Vec<Row>, BridgeError> {
        Ok(self.execute().await?.rows)
    }

    /// Executes the query and returns the first row, if any.
    pub async fn fetch_one(self) -> Result<Option<Row>, BridgeError> {
        Ok(self.execute().await?.rows.into_iter().next())
    }

    /// Executes the query without returning results.
    ///
    /// Use this for mutations (CREATE, MERGE, DELETE, SET).
    pub async fn run(self) -> Result<(), BridgeError> {
        self.execute().await.map(|_| ())
    }
}

/// Extension trait providing a convenient `query()` method.
///
/// This trait is automatically implemented for all [`CypherExecutor`]
/// types, allowing you to write `executor.query("...")` instead of
/// `Query::new(&executor, "...")`.
pub trait QueryExt: CypherExecutor {
    fn query(&self, cypher: &str) -> Query<'_, Self>
    where
        Self: Sized,
    {
        Query::new(self, cypher)
    }
}

impl<E: CypherExecutor> QueryExt for E {}
