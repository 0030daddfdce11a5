use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Structured value flowing through routine programs, caches and frame state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    /// Absent value (`null`).
    #[default]
    Null,
    /// Boolean literal.
    Boolean(bool),
    /// Signed integer literal.
    Integer(i64),
    /// Floating-point literal.
    Float(f64),
    /// UTF-8 string literal.
    String(String),
    /// Heterogeneous list.
    List(Vec<Value>),
    /// String-keyed map. Keys are ordered so encodings stay canonical.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Truthiness used by `if`, `and`, `or` and `not`.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(flag) => *flag,
            Value::Integer(num) => *num != 0,
            Value::Float(num) => *num != 0.0,
            Value::String(text) => !text.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(entries) => !entries.is_empty(),
        }
    }

    /// Short type name used in evaluation errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "bool",
            Value::Integer(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Convenience accessor for string references.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    /// Convenience accessor for integers.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(num) => Some(*num),
            _ => None,
        }
    }

    /// Look up a field when the value is a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    /// Convert into a JSON value for hosts and the CLI.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(flag) => serde_json::Value::Bool(*flag),
            Value::Integer(num) => serde_json::Value::from(*num),
            Value::Float(num) => serde_json::Number::from_f64(*num)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(text) => serde_json::Value::String(text.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(flag) => Value::Boolean(flag),
            serde_json::Value::Number(num) => match num.as_i64() {
                Some(int) => Value::Integer(int),
                None => Value::Float(num.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(text) => Value::String(text),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::String(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::String(text)
    }
}

impl From<i64> for Value {
    fn from(num: i64) -> Self {
        Value::Integer(num)
    }
}

impl From<i32> for Value {
    fn from(num: i32) -> Self {
        Value::Integer(i64::from(num))
    }
}

impl From<f64> for Value {
    fn from(num: f64) -> Self {
        Value::Float(num)
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Boolean(flag)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(text) => write!(f, "{}", text),
            Value::Null => write!(f, "null"),
            Value::Boolean(flag) => write!(f, "{}", flag),
            Value::Integer(num) => write!(f, "{}", num),
            Value::Float(num) => write!(f, "{}", num),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// Arguments supplied to one call: positional values followed by keyword values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CallArgs {
    /// Positional arguments in call order.
    pub positional: Vec<Value>,
    /// Keyword arguments, ordered by name.
    pub keyword: BTreeMap<String, Value>,
}

impl CallArgs {
    /// Empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arguments made only of positional values.
    pub fn positional(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            keyword: BTreeMap::new(),
        }
    }

    /// Builder-style keyword argument.
    pub fn with_keyword(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    /// Total number of arguments.
    pub fn len(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }

    /// Whether no arguments were supplied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into a variable map (`arg0`, `arg1`, … then keywords).
    pub fn to_variables(&self) -> BTreeMap<String, Value> {
        let mut vars: BTreeMap<String, Value> = self
            .positional
            .iter()
            .enumerate()
            .map(|(idx, value)| (format!("arg{}", idx), value.clone()))
            .collect();
        for (name, value) in &self.keyword {
            vars.insert(name.clone(), value.clone());
        }
        vars
    }
}

impl fmt::Display for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        let mut first = true;
        for value in &self.positional {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}", value.to_json())?;
        }
        for (name, value) in &self.keyword {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}={}", name, value.to_json())?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness_follows_emptiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::from("").truthy());
        assert!(Value::from("x").truthy());
        assert!(!Value::Integer(0).truthy());
        assert!(Value::List(vec![Value::Null]).truthy());
    }

    #[test]
    fn json_conversion_preserves_structure() {
        let value = Value::from(json!({"a": [1, 2.5, "x"], "b": null}));
        assert_eq!(value.get("b"), Some(&Value::Null));
        assert_eq!(value.to_json(), json!({"a": [1, 2.5, "x"], "b": null}));
    }

    #[test]
    fn call_args_display_and_variables() {
        let args = CallArgs::positional([Value::Integer(1), Value::Integer(2)]).with_keyword("k", "v");
        assert_eq!(args.to_string(), "(1, 2, k=\"v\")");
        let vars = args.to_variables();
        assert_eq!(vars.get("arg1"), Some(&Value::Integer(2)));
        assert_eq!(vars.get("k"), Some(&Value::from("v")));
    }
}
