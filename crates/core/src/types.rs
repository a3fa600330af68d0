//! Core types shared across the engine: tokens, directive arguments, variable
//! bindings, result maps, logit biases and backend scores.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// Integer id in a tokenizer's fixed vocabulary.
pub type Token = u32;

/// Bias applied to every branch child when asking the backend to disambiguate.
pub const SELECT_BIAS: f32 = 100.0;

/// Request-time override favoring specific token ids. Serializes with string
/// keys, which is the OpenAI `logit_bias` wire shape.
pub type LogitBias = BTreeMap<Token, f32>;

/// Score per candidate token text, as returned by a logprob query.
pub type TokenScores = BTreeMap<String, f64>;

/// Build a bias that favors exactly `children` with [`SELECT_BIAS`].
pub fn favoring(children: &[Token]) -> LogitBias {
    children.iter().map(|&t| (t, SELECT_BIAS)).collect()
}

// ---------------------------------------------------------------------------
// Directive arguments
// ---------------------------------------------------------------------------

/// Literal value of a directive argument. The engine only distinguishes the
/// literal type; semantics belong to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(serde_json::Number),
    Text(String),
    List(Vec<String>),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Number(n) => write!(f, "{n}"),
            ParamValue::Text(s) => f.write_str(s),
            ParamValue::List(items) => f.write_str(&items.join(",")),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<i64> for ParamValue {
    fn from(n: i64) -> Self {
        ParamValue::Number(n.into())
    }
}

impl From<Vec<&str>> for ParamValue {
    fn from(items: Vec<&str>) -> Self {
        ParamValue::List(items.into_iter().map(String::from).collect())
    }
}

/// Directive arguments keyed by name, forwarded verbatim to the backend.
pub type DirectiveArgs = BTreeMap<String, ParamValue>;

// ---------------------------------------------------------------------------
// Variable bindings and results
// ---------------------------------------------------------------------------

/// A caller-supplied binding: plain text for `{{name}}` substitution, or a
/// list of options referenced by `SEL ... options=name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variable {
    Text(String),
    List(Vec<String>),
}

impl Variable {
    /// Text spliced into the template by plain substitution. Lists join with
    /// commas.
    pub fn substitution(&self) -> String {
        match self {
            Variable::Text(s) => s.clone(),
            Variable::List(items) => items.join(","),
        }
    }
}

impl From<&str> for Variable {
    fn from(s: &str) -> Self {
        Variable::Text(s.to_string())
    }
}

impl From<String> for Variable {
    fn from(s: String) -> Self {
        Variable::Text(s)
    }
}

impl From<Vec<&str>> for Variable {
    fn from(items: Vec<&str>) -> Self {
        Variable::List(items.into_iter().map(String::from).collect())
    }
}

impl From<Vec<String>> for Variable {
    fn from(items: Vec<String>) -> Self {
        Variable::List(items)
    }
}

/// Variable bindings for one call. Immutable while the call runs.
pub type Variables = BTreeMap<String, Variable>;

/// Resolved directive values keyed by variable name.
pub type ResultMap = BTreeMap<String, String>;
