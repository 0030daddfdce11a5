//! Instruction template rendering.
//!
//! Placeholders are written `{{ path }}` where `path` is a dotted lookup
//! (`user.name`, `items.0`) into the variable map. Strings render bare,
//! everything else renders through [`Value`]'s `Display`.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::interpreter::Value;

/// Template rendering failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    /// `{{` without a matching `}}`.
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),
    /// `{{ }}` with nothing inside.
    #[error("empty placeholder at byte {0}")]
    Empty(usize),
    /// Placeholder path does not resolve to a value.
    #[error("unresolved placeholder '{0}'")]
    Unresolved(String),
}

/// Render a template against a variable map.
pub fn render(template: &str, vars: &BTreeMap<String, Value>) -> Result<String, TemplateError> {
    let mut output = String::with_capacity(template.len());
    let mut remainder = template;
    let mut offset = 0;

    while let Some(start) = remainder.find("{{") {
        output.push_str(&remainder[..start]);
        let after_start = &remainder[start + 2..];
        let end = after_start
            .find("}}")
            .ok_or(TemplateError::Unterminated(offset + start))?;
        let path = after_start[..end].trim();
        if path.is_empty() {
            return Err(TemplateError::Empty(offset + start));
        }
        let value = lookup(vars, path).ok_or_else(|| TemplateError::Unresolved(path.to_string()))?;
        match value {
            Value::String(text) => output.push_str(text),
            other => output.push_str(&other.to_string()),
        }
        let consumed = start + 2 + end + 2;
        offset += consumed;
        remainder = &remainder[consumed..];
    }

    output.push_str(remainder);
    Ok(output)
}

fn lookup<'a>(vars: &'a BTreeMap<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = vars.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Map(entries) => entries.get(segment)?,
            Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
