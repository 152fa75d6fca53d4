//! Task quality gates

use serde_json::Value;

use crate::plan::QualityCheck;
use crate::registry::ToolOutput;
use crate::resolver::is_empty;

/// Look up `a.b.c` inside the output values
fn field<'a>(output: &'a ToolOutput, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = output.values.get(first)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Evaluate every check; the first failing one is described in the error
pub fn evaluate(checks: &[QualityCheck], output: &ToolOutput) -> Result<(), String> {
    for check in checks {
        match check {
            QualityCheck::RequiredField { field: name } => {
                if field(output, name).is_none() {
                    return Err(format!("required field '{}' is missing", name));
                }
            }
            QualityCheck::NonEmpty { field: name } => match field(output, name) {
                Some(v) if !is_empty(v) => {}
                _ => return Err(format!("field '{}' is empty", name)),
            },
            QualityCheck::MinEvidence { count } => {
                if output.evidence_uris.len() < *count {
                    return Err(format!(
                        "expected at least {} evidence items, got {}",
                        count,
                        output.evidence_uris.len()
                    ));
                }
            }
            QualityCheck::MinItems { field: name, count } => {
                let len = field(output, name).and_then(Value::as_array).map(Vec::len);
                match len {
                    Some(n) if n >= *count => {}
                    Some(n) => {
                        return Err(format!(
                            "field '{}' has {} items, expected at least {}",
                            name, n, count
                        ))
                    }
                    None => return Err(format!("field '{}' is not a list", name)),
                }
            }
        }
    }
    Ok(())
}
