//! Typed AST for the parts of a Cypher query that matter to the bridge.
//!
//! Only projections (RETURN / WITH) are modelled structurally. Every other
//! clause is kept as source text, since the engine parses those itself.

use pest::iterators::Pair;

use super::Rule;

/// A parsed query: one or more single queries joined by `UNION`.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub parts: Vec<SingleQuery>,
}

impl Query {
    /// The projection of the last RETURN clause, if the query ends in one.
    pub fn final_return(&self) -> Option<&Projection> {
        match self.parts.last()?.clauses.last()? {
            Clause::Return(projection) => Some(projection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SingleQuery {
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Return(Projection),
    With(Projection),
    /// Reading or updating clauses, as written.
    Other(String),
}

/// Items of a RETURN or WITH clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub distinct: bool,
    /// `RETURN *` (possibly followed by more items).
    pub star: bool,
    pub items: Vec<ProjectionItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionItem {
    pub expr: Expr,
    pub alias: Option<String>,
    /// Source text of the expression.
    pub text: String,
}

/// Projection expression, reduced to the shapes that determine a column name.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `n`
    Variable(String),
    /// `n.a.b`; `key` is the last segment.
    Property { base: String, key: String },
    /// `f(...)` or `ns.f(...)`; `name` is the last segment.
    Function { name: String, distinct: bool },
    /// `count(*)`
    CountStar,
    /// `$name`
    Parameter(String),
    Literal(String),
    /// Anything else: operators, subscripts, comprehensions, CASE, patterns.
    Other,
}

pub(super) fn build_query(pair: Pair<'_, Rule>) -> Query {
    let parts = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::SingleQuery)
        .map(build_single_query)
        .collect();
    Query { parts }
}

fn build_single_query(pair: Pair<'_, Rule>) -> SingleQuery {
    let clauses = pair
        .into_inner()
        .filter_map(|clause| match clause.as_rule() {
            Rule::Return => Some(Clause::Return(build_projection(clause))),
            Rule::With => Some(Clause::With(build_projection(clause))),
            Rule::OtherClause => Some(Clause::Other(clause.as_str().trim().to_string())),
            _ => None,
        })
        .collect();
    SingleQuery { clauses }
}

fn build_projection(pair: Pair<'_, Rule>) -> Projection {
    let mut projection = Projection {
        distinct: false,
        star: false,
        items: Vec::new(),
    };
    let Some(body) = pair.into_inner().find(|p| p.as_rule() == Rule::ProjectionBody) else {
        return projection;
    };
    for part in body.into_inner() {
        match part.as_rule() {
            Rule::DISTINCT => projection.distinct = true,
            Rule::ProjectionItems => {
                for item in part.into_inner() {
                    match item.as_rule() {
                        Rule::Star => projection.star = true,
                        Rule::ProjectionItem => projection.items.push(build_item(item)),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    projection
}

fn build_item(pair: Pair<'_, Rule>) -> ProjectionItem {
    let mut expr = Expr::Other;
    let mut text = String::new();
    let mut alias = None;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::Expression => {
                text = inner.as_str().trim().to_string();
                expr = build_expr(inner);
            }
            Rule::Variable => alias = Some(variable_name(inner)),
            _ => {}
        }
    }
    ProjectionItem { expr, alias, text }
}

/// Reduces an expression to a single chain without operators, or `Other`.
fn build_expr(pair: Pair<'_, Rule>) -> Expr {
    let mut inner = pair.into_inner();
    let (Some(chain), None) = (inner.next(), inner.next()) else {
        return Expr::Other;
    };
    if chain.as_rule() != Rule::Chain {
        return Expr::Other;
    }

    let mut parts = chain.into_inner();
    let Some(atom) = parts.next() else {
        return Expr::Other;
    };
    let mut accessors: Vec<Pair<'_, Rule>> = parts.collect();
    // A trailing `::type` cast keeps the name of the expression it converts.
    while accessors.last().is_some_and(|a| a.as_rule() == Rule::TypeCast) {
        accessors.pop();
    }

    if accessors.is_empty() {
        return build_atom(atom);
    }

    // Only a plain property path keeps a name: `n.a.b`, `f(x).key`.
    if accessors.iter().all(|a| a.as_rule() == Rule::PropertyLookup) {
        let key = accessors
            .last()
            .and_then(|last| last.clone().into_inner().next())
            .map(symbolic_name);
        if let Some(key) = key {
            return Expr::Property {
                base: atom.as_str().trim().to_string(),
                key,
            };
        }
    }
    Expr::Other
}

fn build_atom(atom: Pair<'_, Rule>) -> Expr {
    match atom.as_rule() {
        Rule::Variable => Expr::Variable(variable_name(atom)),
        Rule::CountStar => Expr::CountStar,
        Rule::Parameter => Expr::Parameter(atom.as_str().trim_start_matches('$').to_string()),
        Rule::Literal => Expr::Literal(atom.as_str().to_string()),
        Rule::FunctionInvocation => {
            let mut name = String::new();
            let mut distinct = false;
            for part in atom.into_inner() {
                match part.as_rule() {
                    Rule::FunctionName => {
                        if let Some(last) = part.into_inner().last() {
                            name = symbolic_name(last);
                        }
                    }
                    Rule::DISTINCT => distinct = true,
                    _ => {}
                }
            }
            Expr::Function { name, distinct }
        }
        _ => Expr::Other,
    }
}

fn variable_name(pair: Pair<'_, Rule>) -> String {
    let fallback = pair.as_str().trim().to_string();
    pair.into_inner()
        .find(|p| p.as_rule() == Rule::SymbolicName)
        .map(symbolic_name)
        .unwrap_or(fallback)
}

/// Unescapes a backtick-quoted name; plain names are returned as written.
fn symbolic_name(pair: Pair<'_, Rule>) -> String {
    let text = pair.as_str();
    match pair.into_inner().next() {
        Some(inner) if inner.as_rule() == Rule::EscapedName => {
            let quoted = inner.as_str();
            quoted[1..quoted.len() - 1].replace("``", "`")
        }
        _ => text.to_string(),
    }
}
