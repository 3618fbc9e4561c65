//! Output column inference for AGE's `cypher()` call.
//!
//! AGE needs the column list declared in the SQL `AS (...)` clause, matching
//! the final RETURN in count. Names are derived from the projection:
//!
//! | Item                  | Column          |
//! |-----------------------|-----------------|
//! | `expr AS alias`       | `alias`         |
//! | `n.a.b`               | `b`             |
//! | `collect(x)`          | `collect`       |
//! | `count(*)`            | `count`         |
//! | `n`                   | `n`             |
//! | `n.age::int`          | `age`           |
//! | anything else         | `col<position>` |
//!
//! Repeated names get `_2`, `_3`, ... appended.

use std::collections::HashSet;

use super::ast::{Expr, ProjectionItem};
use super::{parse, ParseError};

/// PostgreSQL truncates identifiers beyond this many bytes (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_BYTES: usize = 63;

const AGTYPE: &str = "agtype";

/// One declared output column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub sql_type: &'static str,
}

/// Ordered output columns of a Cypher call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSchema {
    columns: Vec<Column>,
}

impl ResultSchema {
    /// Single `result` column used for queries without a RETURN clause.
    pub fn placeholder() -> Self {
        Self::from_names(vec!["result".to_string()])
    }

    fn from_names(names: Vec<String>) -> Self {
        Self {
            columns: names
                .into_iter()
                .map(|name| Column {
                    name,
                    sql_type: AGTYPE,
                })
                .collect(),
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column definitions for the `AS (...)` clause, e.g. `"n" agtype, "c" agtype`.
    ///
    /// Always quoted so reserved words such as `count` or `order` are safe.
    pub fn to_sql(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Infers the output columns from the final RETURN clause of `query`.
///
/// Returns [`ParseError::NoReturnClause`] for write-only queries and
/// [`ParseError::ReturnStarNotSupported`] for `RETURN *`.
pub fn infer_columns(query: &str) -> Result<ResultSchema, ParseError> {
    let parsed = parse(query)?;
    let projection = parsed.final_return().ok_or(ParseError::NoReturnClause)?;
    if projection.star {
        return Err(ParseError::ReturnStarNotSupported);
    }

    let raw: Vec<String> = projection
        .items
        .iter()
        .enumerate()
        .map(|(i, item)| column_name(item, i + 1))
        .collect();
    Ok(ResultSchema::from_names(disambiguate(raw)))
}

fn column_name(item: &ProjectionItem, position: usize) -> String {
    if let Some(alias) = &item.alias {
        return truncate(alias);
    }
    let name = match &item.expr {
        Expr::Property { key, .. } => key.clone(),
        Expr::Function { name, .. } => name.clone(),
        Expr::CountStar => "count".to_string(),
        Expr::Variable(name) => name.clone(),
        _ => String::new(),
    };
    if name.is_empty() {
        format!("col{}", position)
    } else {
        truncate(&name)
    }
}

fn disambiguate(names: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::with_capacity(names.len());
    names
        .into_iter()
        .map(|name| {
            if seen.insert(name.clone()) {
                return name;
            }
            let mut k = 2;
            loop {
                let suffix = format!("_{}", k);
                let candidate = format!(
                    "{}{}",
                    truncate_to(&name, MAX_IDENTIFIER_BYTES - suffix.len()),
                    suffix
                );
                if seen.insert(candidate.clone()) {
                    return candidate;
                }
                k += 1;
            }
        })
        .collect()
}

fn truncate(name: &str) -> String {
    truncate_to(name, MAX_IDENTIFIER_BYTES).to_string()
}

fn truncate_to(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Double-quotes an identifier, doubling embedded quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
