use serde_json::Value;
use std::collections::HashMap;

/// Substitute `${var}` references from the workflow variables map
/// throughout a JSON value. Unknown variables are left untouched so a
/// later `${task.output}` pass can claim them.
pub fn expand_variables(value: &Value, variables: &HashMap<String, Value>) -> Value {
    transform(value, &mut |text| {
        if let Some(name) = reference_name(text) {
            if !name.contains('.') {
                if let Some(replacement) = variables.get(name) {
                    return Some(replacement.clone());
                }
            }
        }
        let mut out = text.to_string();
        for (name, replacement) in variables {
            let needle = format!("${{{name}}}");
            if out.contains(&needle) {
                out = out.replace(&needle, &stringify(replacement));
            }
        }
        if out != text {
            Some(Value::String(out))
        } else {
            None
        }
    })
}

/// Bind `${taskId.output}` references against completed-task outputs.
/// A referenced task with no recorded output (possible under the ignore
/// failure policy) resolves to null.
pub fn bind_outputs(value: &Value, outputs: &HashMap<String, Value>) -> Value {
    transform(value, &mut |text| {
        let name = reference_name(text)?;
        let task_id = name.strip_suffix(".output")?;
        Some(outputs.get(task_id).cloned().unwrap_or(Value::Null))
    })
}

/// Whether a task input still references an output that has not been
/// produced yet.
pub fn has_unbound_outputs(value: &Value, outputs: &HashMap<String, Value>) -> bool {
    match value {
        Value::String(text) => reference_name(text)
            .and_then(|name| name.strip_suffix(".output"))
            .map(|task_id| !outputs.contains_key(task_id))
            .unwrap_or(false),
        Value::Array(items) => items.iter().any(|v| has_unbound_outputs(v, outputs)),
        Value::Object(map) => map.values().any(|v| has_unbound_outputs(v, outputs)),
        _ => false,
    }
}

/// The `name` of a string that is exactly one `${name}` reference.
fn reference_name(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("${")?.strip_suffix('}')?;
    if inner.is_empty() || inner.contains("${") {
        None
    } else {
        Some(inner)
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn transform(value: &Value, replace: &mut dyn FnMut(&str) -> Option<Value>) -> Value {
    match value {
        Value::String(text) => replace(text).unwrap_or_else(|| value.clone()),
        Value::Array(items) => Value::Array(items.iter().map(|v| transform(v, replace)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), transform(v, replace)))
                .collect(),
        ),
        _ => value.clone(),
    }
}
