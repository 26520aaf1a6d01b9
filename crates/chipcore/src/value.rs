use serde::{Deserialize, Serialize};
use std::fmt;

/// Value stored at a manifest keypath: a scalar or an ordered list of scalars
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Scalars held by this value, rendered as strings. A scalar yields one
    /// item, a list yields every scalar element; nulls and nested lists are
    /// left out.
    pub fn as_strings(&self) -> Vec<String> {
        match self {
            Value::Null => Vec::new(),
            Value::Array(items) => items
                .iter()
                .filter(|v| !v.is_null() && v.as_array().is_none())
                .map(|v| v.to_string())
                .collect(),
            scalar => vec![scalar.to_string()],
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Parse a command-line literal: booleans and numbers are typed, a
    /// comma-separated literal becomes a list, anything else is a string.
    pub fn parse_literal(raw: &str) -> Value {
        if raw.contains(',') {
            return Value::Array(raw.split(',').map(|s| Value::parse_literal(s.trim())).collect());
        }
        match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "" => Value::Null,
            _ => raw
                .parse::<f64>()
                .map(Value::Number)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::Array(items.into_iter().map(Value::String).collect())
    }
}

impl From<Vec<&str>> for Value {
    fn from(items: Vec<&str>) -> Self {
        Value::Array(items.into_iter().map(Value::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_are_typed() {
        assert_eq!(Value::parse_literal("true"), Value::Bool(true));
        assert_eq!(Value::parse_literal("4"), Value::Number(4.0));
        assert_eq!(Value::parse_literal("sta"), Value::String("sta".into()));
        assert_eq!(
            Value::parse_literal("a,b"),
            Value::Array(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn untagged_json_shape() {
        let v: Value = serde_json::from_str(r#"["-exit", 3, true]"#).unwrap();
        assert_eq!(
            v,
            Value::Array(vec![Value::from("-exit"), Value::Number(3.0), Value::Bool(true)])
        );
        assert_eq!(v.as_strings(), vec!["-exit", "3", "true"]);
    }

    #[test]
    fn numeric_literals_keep_their_text() {
        assert_eq!(Value::parse_literal("-j,4").as_strings(), vec!["-j", "4"]);
        assert_eq!(Value::parse_literal("2.1").as_strings(), vec!["2.1"]);
        assert_eq!(Value::parse_literal("0.5").as_strings(), vec!["0.5"]);
        assert!(Value::Null.as_strings().is_empty());
    }
}
