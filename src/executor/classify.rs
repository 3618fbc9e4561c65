//! Engine failure classification.
//!
//! Failures are keyed on SQLSTATE first and on the lowercase message second,
//! since message text varies across PostgreSQL and AGE versions.

use std::fmt;

use once_cell::sync::Lazy;

use crate::error::EngineError;

/// AGE-specific failure classes with an actionable hint each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CypherFailure {
    /// Declared `AS (...)` columns do not match what the query returns.
    ReturnColumnMismatch,
    /// A variable or column referenced by the query is not in scope.
    UnresolvedColumn,
    /// A parameter or literal is not valid agtype.
    InvalidAgtype,
    /// `LOAD 'age'` has not run on the session, or AGE is not installed.
    ExtensionNotLoaded,
    /// An agtype value was used where a boolean is required.
    InvalidBooleanCast,
    GraphNotFound,
}

impl CypherFailure {
    pub fn hint(&self) -> &'static str {
        match self {
            CypherFailure::ReturnColumnMismatch => {
                "the RETURN clause and the declared result columns differ; alias every \
                 returned expression explicitly"
            }
            CypherFailure::UnresolvedColumn => {
                "a referenced variable is not in scope; check that it is carried through \
                 WITH clauses and spelled consistently"
            }
            CypherFailure::InvalidAgtype => {
                "a parameter or literal is not valid agtype; pass plain JSON-compatible values"
            }
            CypherFailure::ExtensionNotLoaded => {
                "the AGE extension is not loaded on this session; run CREATE EXTENSION age \
                 and LOAD 'age', and include ag_catalog in search_path"
            }
            CypherFailure::InvalidBooleanCast => {
                "an agtype value was used as a boolean; compare it explicitly, e.g. \
                 `n.flag = true`"
            }
            CypherFailure::GraphNotFound => {
                "the graph does not exist; create it with SELECT create_graph('<name>')"
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CypherFailure::ReturnColumnMismatch => "return_column_mismatch",
            CypherFailure::UnresolvedColumn => "unresolved_column",
            CypherFailure::InvalidAgtype => "invalid_agtype",
            CypherFailure::ExtensionNotLoaded => "extension_not_loaded",
            CypherFailure::InvalidBooleanCast => "invalid_boolean_cast",
            CypherFailure::GraphNotFound => "graph_not_found",
        }
    }
}

impl fmt::Display for CypherFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SQLSTATE entries; a needle, when present, must also appear in the message.
struct CodeRule {
    code: &'static str,
    needle: Option<&'static str>,
    failure: CypherFailure,
}

static CODE_TABLE: Lazy<Vec<CodeRule>> = Lazy::new(|| {
    vec![
        CodeRule {
            code: "42804",
            needle: Some("column definition list"),
            failure: CypherFailure::ReturnColumnMismatch,
        },
        CodeRule {
            code: "42703",
            needle: None,
            failure: CypherFailure::UnresolvedColumn,
        },
        CodeRule {
            code: "22P02",
            needle: Some("agtype"),
            failure: CypherFailure::InvalidAgtype,
        },
        CodeRule {
            code: "42883",
            needle: Some("cypher"),
            failure: CypherFailure::ExtensionNotLoaded,
        },
        CodeRule {
            code: "42704",
            needle: Some("agtype"),
            failure: CypherFailure::ExtensionNotLoaded,
        },
        CodeRule {
            code: "58P01",
            needle: Some("age"),
            failure: CypherFailure::ExtensionNotLoaded,
        },
        CodeRule {
            code: "22023",
            needle: Some("boolean"),
            failure: CypherFailure::InvalidBooleanCast,
        },
        CodeRule {
            code: "3F000",
            needle: Some("graph"),
            failure: CypherFailure::GraphNotFound,
        },
    ]
});

/// Message fragments checked in order when no SQLSTATE rule matched.
const MESSAGE_PATTERNS: &[(&[&str], CypherFailure)] = &[
    (
        &["return row and column definition list do not match"],
        CypherFailure::ReturnColumnMismatch,
    ),
    (&["column definition list"], CypherFailure::ReturnColumnMismatch),
    (&["could not find rte for"], CypherFailure::UnresolvedColumn),
    (&["variable", "does not exist"], CypherFailure::UnresolvedColumn),
    (&["invalid input syntax for type agtype"], CypherFailure::InvalidAgtype),
    (&["function cypher", "does not exist"], CypherFailure::ExtensionNotLoaded),
    (&["type \"agtype\" does not exist"], CypherFailure::ExtensionNotLoaded),
    (&["cannot cast agtype", "boolean"], CypherFailure::InvalidBooleanCast),
    (&["graph", "does not exist"], CypherFailure::GraphNotFound),
];

/// SQLSTATE codes after which re-issuing the statement may succeed.
const TRANSIENT_CODES: &[&str] = &["57P01", "57P02", "57P03", "57014", "25P03"];

const TRANSIENT_MESSAGES: &[&str] = &[
    "connection reset",
    "connection closed",
    "timeout",
    "timed out",
    "idle",
    "terminat",
];

/// Classifies an engine failure raised by a Cypher call.
pub fn classify(error: &EngineError) -> Option<CypherFailure> {
    let message = error.message.to_lowercase();

    if let Some(code) = error.code.as_deref() {
        let by_code = CODE_TABLE.iter().find(|rule| {
            rule.code == code && rule.needle.map_or(true, |n| message.contains(n))
        });
        if let Some(rule) = by_code {
            return Some(rule.failure);
        }
    }

    MESSAGE_PATTERNS
        .iter()
        .find(|(needles, _)| needles.iter().all(|n| message.contains(n)))
        .map(|(_, failure)| *failure)
}

/// True for failures worth retrying: lost connections, cancellations, idle
/// session kills and similar.
pub fn is_transient(error: &EngineError) -> bool {
    if error.closed {
        return true;
    }
    if let Some(code) = error.code.as_deref() {
        if code.starts_with("08") || TRANSIENT_CODES.contains(&code) {
            return true;
        }
    }
    let message = error.message.to_lowercase();
    TRANSIENT_MESSAGES.iter().any(|p| message.contains(p))
}
