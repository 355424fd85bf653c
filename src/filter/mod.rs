//! Subscription filters.
//!
//! A subscription decides which events reach an action. Filters are written
//! in a small boolean language and compiled into an [`Expression`] tree:
//!
//! ```text
//! type = "track" and event in ["Order Completed", "Order Refunded"]
//! context.traits.email exists and not match(context.page.path, "/admin/*")
//! ```
//!
//! Evaluation is total: a field that is absent from the event makes every
//! comparison on it false (including `!=`), and never raises an error.

mod parser;

pub use parser::parse;

use crate::event::{Event, FieldPath};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::cmp::Ordering;
use thiserror::Error;

/// A subscription expression that could not be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message} at position {position} near '{fragment}'")]
pub struct ParseError {
    pub message: String,
    pub fragment: String,
    pub position: usize,
}

impl ParseError {
    pub(crate) fn new(message: impl Into<String>, fragment: &str, position: usize) -> Self {
        Self {
            message: message.into(),
            fragment: fragment.to_string(),
            position,
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

/// A parsed subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Expression {
    /// Matches every event.
    All,
    And {
        children: Vec<Expression>,
    },
    Or {
        children: Vec<Expression>,
    },
    Not {
        child: Box<Expression>,
    },
    Compare {
        field: FieldPath,
        operator: Operator,
        value: Value,
    },
    Exists {
        field: FieldPath,
    },
    In {
        field: FieldPath,
        values: Vec<Value>,
    },
    /// Substring match on strings, membership on arrays.
    Contains {
        field: FieldPath,
        value: String,
    },
    /// Glob match (`*` and `?`) on string fields.
    Match {
        field: FieldPath,
        pattern: String,
    },
}

impl Expression {
    /// Evaluate against an event.
    pub fn evaluate(&self, event: &Event) -> bool {
        match self {
            Expression::All => true,
            Expression::And { children } => children.iter().all(|c| c.evaluate(event)),
            Expression::Or { children } => children.iter().any(|c| c.evaluate(event)),
            Expression::Not { child } => !child.evaluate(event),
            Expression::Compare {
                field,
                operator,
                value,
            } => match field.get(event) {
                Some(actual) => compare(actual, *operator, value),
                None => false,
            },
            Expression::Exists { field } => field.get(event).is_some_and(|v| !v.is_null()),
            Expression::In { field, values } => field
                .get(event)
                .is_some_and(|actual| values.iter().any(|v| json_eq(actual, v))),
            Expression::Contains { field, value } => match field.get(event) {
                Some(Value::String(s)) => s.contains(value.as_str()),
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| item.as_str() == Some(value.as_str())),
                _ => false,
            },
            Expression::Match { field, pattern } => match field.get(event) {
                Some(Value::String(s)) => glob_match(pattern, s),
                _ => false,
            },
        }
    }
}

fn compare(actual: &Value, operator: Operator, expected: &Value) -> bool {
    match operator {
        Operator::Eq => json_eq(actual, expected),
        Operator::Ne => !json_eq(actual, expected),
        Operator::Lt => ordering(actual, expected) == Some(Ordering::Less),
        Operator::Le => matches!(
            ordering(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::Gt => ordering(actual, expected) == Some(Ordering::Greater),
        Operator::Ge => matches!(
            ordering(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
    }
}

/// Equality that treats `1` and `1.0` as the same number.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Numbers order numerically, strings lexically; anything else is unordered.
fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

/// A subscription as it appears in configuration: either source text or
/// an already-parsed tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Source(String),
    Parsed(Expression),
}

impl Filter {
    /// The parsed expression, parsing source text on demand.
    pub fn expression(&self) -> Result<Cow<'_, Expression>, ParseError> {
        match self {
            Filter::Source(source) => parse(source).map(Cow::Owned),
            Filter::Parsed(expr) => Ok(Cow::Borrowed(expr)),
        }
    }

    /// Parse once, so later evaluations reuse the tree.
    pub fn compile(self) -> Result<Filter, ParseError> {
        match self {
            Filter::Source(source) => parse(&source).map(Filter::Parsed),
            parsed => Ok(parsed),
        }
    }

    pub fn matches(&self, event: &Event) -> Result<bool, ParseError> {
        Ok(self.expression()?.evaluate(event))
    }
}

impl From<&str> for Filter {
    fn from(source: &str) -> Self {
        Filter::Source(source.to_string())
    }
}

impl From<Expression> for Filter {
    fn from(expr: Expression) -> Self {
        Filter::Parsed(expr)
    }
}
