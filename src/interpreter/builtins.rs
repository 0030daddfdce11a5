//! Pure builtin functions known to the interpreter.
//!
//! Builtins run in-process on a cache miss and their results are cached like
//! any other call, so a replayed pass never re-runs them.

use std::collections::BTreeMap;

use super::runtime::EvalOptions;
use super::value::{CallArgs, Value};
use super::EvalError;

/// Run a builtin. Returns `None` when `name` is not a builtin.
pub fn call_builtin(
    name: &str,
    args: &CallArgs,
    options: &EvalOptions,
) -> Option<Result<Value, EvalError>> {
    let result = match name {
        "echo" => Ok(echo(args)),
        "len" => single(name, args).and_then(|value| length(name, value)),
        "str" => single(name, args).map(|value| Value::String(value.to_string())),
        "int" => single(name, args).and_then(|value| to_int(name, value)),
        "float" => single(name, args).and_then(|value| to_float(name, value)),
        "keys" => single(name, args).and_then(|value| match value {
            Value::Map(entries) => Ok(Value::List(
                entries.keys().cloned().map(Value::String).collect(),
            )),
            other => Err(invalid(name, format!("expected map, found {}", other.type_name()))),
        }),
        "range" => range(args, options.max_range_len),
        "concat" => Ok(Value::String(
            args.positional.iter().map(|value| value.to_string()).collect(),
        )),
        "join" => join(args),
        _ => return None,
    };
    Some(result)
}

fn echo(args: &CallArgs) -> Value {
    if !args.keyword.is_empty() {
        let mut map: BTreeMap<String, Value> = args.keyword.clone();
        if !args.positional.is_empty() {
            map.insert("args".to_string(), Value::List(args.positional.clone()));
        }
        return Value::Map(map);
    }
    match args.positional.as_slice() {
        [] => Value::Null,
        [only] => only.clone(),
        many => Value::List(many.to_vec()),
    }
}

fn single<'a>(name: &str, args: &'a CallArgs) -> Result<&'a Value, EvalError> {
    match (args.positional.as_slice(), args.keyword.is_empty()) {
        ([value], true) => Ok(value),
        _ => Err(invalid(name, format!("expected 1 argument, found {}", args.len()))),
    }
}

fn length(name: &str, value: &Value) -> Result<Value, EvalError> {
    let len = match value {
        Value::String(text) => text.chars().count(),
        Value::List(items) => items.len(),
        Value::Map(entries) => entries.len(),
        other => {
            return Err(invalid(name, format!("{} has no length", other.type_name())));
        }
    };
    Ok(Value::Integer(len as i64))
}

fn to_int(name: &str, value: &Value) -> Result<Value, EvalError> {
    match value {
        Value::Integer(num) => Ok(Value::Integer(*num)),
        Value::Float(num) => Ok(Value::Integer(num.trunc() as i64)),
        Value::Boolean(flag) => Ok(Value::Integer(*flag as i64)),
        Value::String(text) => text
            .trim()
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid(name, format!("cannot convert {:?} to int", text))),
        other => Err(invalid(name, format!("cannot convert {} to int", other.type_name()))),
    }
}

fn to_float(name: &str, value: &Value) -> Result<Value, EvalError> {
    match value {
        Value::Integer(num) => Ok(Value::Float(*num as f64)),
        Value::Float(num) => Ok(Value::Float(*num)),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid(name, format!("cannot convert {:?} to float", text))),
        other => Err(invalid(name, format!("cannot convert {} to float", other.type_name()))),
    }
}

fn range(args: &CallArgs, limit: usize) -> Result<Value, EvalError> {
    let bounds: Vec<i64> = args
        .positional
        .iter()
        .map(|value| {
            value
                .as_integer()
                .ok_or_else(|| invalid("range", "bounds must be integers".to_string()))
        })
        .collect::<Result<_, _>>()?;
    let (start, end) = match bounds.as_slice() {
        [end] => (0, *end),
        [start, end] => (*start, *end),
        _ => return Err(invalid("range", "expected 1 or 2 arguments".to_string())),
    };
    if end <= start {
        return Ok(Value::List(Vec::new()));
    }
    let span = end
        .checked_sub(start)
        .and_then(|span| usize::try_from(span).ok())
        .filter(|span| *span <= limit)
        .ok_or_else(|| invalid("range", format!("range longer than {} items", limit)))?;
    let mut items = Vec::with_capacity(span);
    items.extend((start..end).map(Value::Integer));
    Ok(Value::List(items))
}

fn join(args: &CallArgs) -> Result<Value, EvalError> {
    let (items, separator) = match args.positional.as_slice() {
        [Value::List(items)] => (items, ""),
        [Value::List(items), Value::String(sep)] => (items, sep.as_str()),
        _ => return Err(invalid("join", "expected a list and optional separator".to_string())),
    };
    let parts: Vec<String> = items.iter().map(|item| item.to_string()).collect();
    Ok(Value::String(parts.join(separator)))
}

fn invalid(name: &str, message: String) -> EvalError {
    EvalError::Builtin {
        name: name.to_string(),
        message,
    }
}
