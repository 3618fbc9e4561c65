//! Compiles Cypher text into a call of AGE's `cypher()` table function.

use super::columns::{infer_columns, ResultSchema};
use super::ParseError;
use crate::error::{BridgeError, QueryContext};
use crate::value::{summarize_params, validate_params, Params, Value};

/// Dollar-quote tag wrapping the query text inside the SQL call.
pub const CYPHER_DELIMITER: &str = "$cypher$";

/// A compiled Cypher call, ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct AgeCall {
    pub sql: String,
    /// Positional arguments: empty, or the parameter map bound as `$1` (agtype).
    pub args: Vec<Value>,
    pub schema: ResultSchema,
}

/// Checks that `graph` is a plain identifier that can be embedded in the call.
pub fn validate_graph_name(graph: &str) -> Result<(), BridgeError> {
    if graph.is_empty() {
        return Err(BridgeError::invalid_config(
            "graph name is required for Cypher queries",
        ));
    }
    let mut chars = graph.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BridgeError::invalid_config(format!(
            "invalid graph name '{}': expected letters, digits and underscores",
            graph
        )));
    }
    Ok(())
}

/// Builds the AGE SQL for a Cypher statement.
///
/// For `MATCH (n) RETURN n.name, count(*)` against graph `g` with parameters:
///
/// ```text
/// SELECT * FROM cypher('g', $cypher$MATCH (n) RETURN n.name, count(*)$cypher$, $1)
///     AS ("name" agtype, "count" agtype)
/// ```
///
/// Write-only queries declare a single `result` column. The `$1` argument is
/// omitted when there are no parameters.
pub fn compile(cypher: &str, params: &Params, graph: &str) -> Result<AgeCall, BridgeError> {
    validate_graph_name(graph)?;

    let context = || QueryContext::new(cypher, summarize_params(params)).with_graph(graph);

    let text = cypher.trim().trim_end_matches(';').trim_end();
    if text.is_empty() {
        return Err(BridgeError::query("Cypher query is empty", context(), None));
    }
    if text.contains(CYPHER_DELIMITER) {
        return Err(BridgeError::query(
            format!(
                "Cypher query must not contain the {} delimiter",
                CYPHER_DELIMITER
            ),
            context(),
            None,
        ));
    }

    let schema = match infer_columns(text) {
        Ok(schema) => schema,
        Err(ParseError::NoReturnClause) => ResultSchema::placeholder(),
        Err(ParseError::ReturnStarNotSupported) => {
            return Err(BridgeError::query(
                ParseError::ReturnStarNotSupported.to_string(),
                context(),
                None,
            ));
        }
        Err(ParseError::InvalidSyntax(msg)) => {
            return Err(BridgeError::query(
                format!("Cypher syntax error: {}", msg),
                context(),
                None,
            ));
        }
    };

    let args = if params.is_empty() {
        Vec::new()
    } else {
        validate_params(params)?;
        vec![Value::Map(params.clone())]
    };

    let sql = format!(
        "SELECT * FROM cypher('{graph}', {delim}{text}{delim}{arg}) AS ({columns})",
        delim = CYPHER_DELIMITER,
        arg = if args.is_empty() { "" } else { ", $1" },
        columns = schema.to_sql(),
    );

    Ok(AgeCall {
        sql,
        args,
        schema,
    })
}
