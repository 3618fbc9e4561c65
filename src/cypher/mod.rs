//! Cypher front-end: parsing, RETURN column inference and the AGE call.
//!
//! The grammar in `cypher.pest` covers projections in detail and treats every
//! other clause as a balanced token run. That is enough to find the final
//! RETURN clause and derive the column list AGE needs declared up front.
//!
//! # Example
//!
//! ```
//! use age_bridge::cypher::infer_columns;
//!
//! let schema = infer_columns("MATCH (a)-[:KNOWS]->(b) RETURN a.name AS n, count(b) AS c").unwrap();
//! assert_eq!(schema.names(), vec!["n", "c"]);
//! ```

pub mod ast;
mod bridge;
mod columns;

use pest::Parser;
use pest_derive::Parser;

pub use ast::{Clause, Expr, Projection, ProjectionItem, Query};
pub use bridge::{compile, validate_graph_name, AgeCall, CYPHER_DELIMITER};
pub use columns::{infer_columns, Column, ResultSchema, MAX_IDENTIFIER_BYTES};
pub(crate) use columns::quote_ident;

#[derive(Parser)]
#[grammar = "cypher/cypher.pest"]
struct CypherParser;

/// Parses a Cypher query into its typed AST.
pub fn parse(query: &str) -> Result<Query, ParseError> {
    let mut pairs = CypherParser::parse(Rule::Cypher, query)
        .map_err(|e| ParseError::InvalidSyntax(e.to_string()))?;
    let root = pairs
        .next()
        .ok_or_else(|| ParseError::InvalidSyntax("empty query".to_string()))?;
    Ok(ast::build_query(root))
}

/// Errors that can occur during Cypher parsing and column inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// No RETURN clause found in the query
    NoReturnClause,
    /// RETURN * requires variable tracking (not supported)
    ReturnStarNotSupported,
    /// Syntax error in the query
    InvalidSyntax(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::NoReturnClause => write!(f, "No RETURN clause found in query"),
            ParseError::ReturnStarNotSupported => {
                write!(
                    f,
                    "RETURN * is not supported, list the returned columns explicitly"
                )
            }
            ParseError::InvalidSyntax(msg) => write!(f, "Invalid syntax: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}
