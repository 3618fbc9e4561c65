//! Row and result types for query results.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::BridgeError;
use crate::value::Value;

/// A single row from a query result.
///
/// Keeps the column order reported by the engine, with typed extraction via
/// [`Row::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a row from column names and values in matching order.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Builds a row from `(column, value)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let (columns, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self::new(columns.into(), values)
    }

    fn index_of(&self, key: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == key)
    }

    /// Gets a value from the row by column name, deserializing to the requested type.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not found or if deserialization fails.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let id: String = row.get("id")?;
    /// let count: i64 = row.get("count")?;
    /// ```
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, BridgeError> {
        let value = self
            .get_raw(key)
            .ok_or_else(|| BridgeError::validation(format!("column not found: {}", key)))?;
        serde_json::from_value(value.to_json()).map_err(|e| {
            BridgeError::validation(format!("failed to deserialize '{}': {}", key, e))
        })
    }

    /// Gets a value from the row, returning `None` if the key doesn't exist.
    ///
    /// Still returns an error if the key exists but deserialization fails.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BridgeError> {
        match self.get_raw(key) {
            Some(v) if v.is_null() => Ok(None),
            Some(_) => self.get(key).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the raw value for a column, if it exists.
    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.index_of(key).map(|i| &self.values[i])
    }

    /// Returns all column names in this row, in engine order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|s| s.as_str())
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Consumes the row and returns a name-keyed map.
    pub fn into_map(self) -> HashMap<String, Value> {
        self.columns.iter().cloned().zip(self.values).collect()
    }
}

/// The outcome of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Rows affected as reported by the engine's command tag.
    pub rows_affected: u64,
}

impl QueryResult {
    /// Result for a statement that reported only an affected-row count.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let rows_affected = rows.len() as u64;
        Self {
            columns,
            rows,
            rows_affected,
        }
    }

    /// Number of rows returned, or the affected count for commands without rows.
    pub fn row_count(&self) -> u64 {
        if self.rows.is_empty() {
            self.rows_affected
        } else {
            self.rows.len() as u64
        }
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: Vec<(&str, Value)>) -> Row {
        Row::from_pairs(pairs)
    }

    #[test]
    fn test_row_get_string() {
        let row = row(vec![("name", Value::from("test"))]);
        let name: String = row.get("name").unwrap();
        assert_eq!(name, "test");
    }

    #[test]
    fn test_row_get_number() {
        let row = row(vec![("count", Value::from(42))]);
        let count: i64 = row.get("count").unwrap();
        assert_eq!(count, 42);
    }

    #[test]
    fn test_row_get_missing_key() {
        let row = row(vec![]);
        let result: Result<String, _> = row.get("missing");
        assert!(result.is_err());
    }

    #[test]
    fn test_row_get_opt_null() {
        let row = row(vec![("name", Value::Null)]);
        let name: Option<String> = row.get_opt("name").unwrap();
        assert_eq!(name, None);
    }

    #[test]
    fn test_row_preserves_column_order() {
        let row = row(vec![("b", Value::from(1)), ("a", Value::from(2))]);
        assert_eq!(row.columns().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(row.into_map()["a"], Value::from(2));
    }

    #[test]
    fn test_row_count_prefers_rows() {
        let result = QueryResult::from_rows(
            vec!["n".into()],
            vec![row(vec![("n", Value::from(1))])],
        );
        assert_eq!(result.row_count(), 1);
        assert_eq!(QueryResult::affected(7).row_count(), 7);
    }
}
