//! `${name}` placeholder substitution
//!
//! Placeholders are resolved through a caller-supplied lookup. Anything the
//! lookup cannot answer is reported back by name; nothing is ever replaced by
//! a default value.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}").expect("placeholder pattern"));

/// Names referenced by placeholders in a string, in order of appearance
pub fn placeholders(text: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Names referenced anywhere inside a JSON value (strings and object keys excluded)
pub fn value_placeholders(value: &Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect(value, &mut names);
    names
}

fn collect(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => names.extend(placeholders(s)),
        Value::Array(items) => items.iter().for_each(|v| collect(v, names)),
        Value::Object(map) => map.values().for_each(|v| collect(v, names)),
        _ => {}
    }
}

/// Render placeholders inside a string.
///
/// Returns the names that could not be resolved when any are missing.
pub fn render<F>(text: &str, mut lookup: F) -> Result<String, Vec<String>>
where
    F: FnMut(&str) -> Option<Value>,
{
    let mut missing = Vec::new();
    let rendered = PLACEHOLDER.replace_all(text, |caps: &regex::Captures<'_>| {
        match lookup(&caps[1]) {
            Some(value) => display(&value),
            None => {
                missing.push(caps[1].to_string());
                caps[0].to_string()
            }
        }
    });

    if missing.is_empty() {
        Ok(rendered.into_owned())
    } else {
        Err(missing)
    }
}

/// Render placeholders throughout a JSON value.
///
/// A string consisting of exactly one placeholder is replaced by the bound
/// value itself, keeping its JSON type.
pub fn render_value<F>(value: &Value, lookup: &mut F) -> Result<Value, Vec<String>>
where
    F: FnMut(&str) -> Option<Value>,
{
    match value {
        Value::String(s) => {
            if let Some(name) = sole_placeholder(s) {
                return lookup(&name).ok_or_else(|| vec![name]);
            }
            render(s, |n| lookup(n)).map(Value::String)
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            let mut missing = Vec::new();
            for item in items {
                match render_value(item, lookup) {
                    Ok(v) => out.push(v),
                    Err(names) => missing.extend(names),
                }
            }
            if missing.is_empty() {
                Ok(Value::Array(out))
            } else {
                Err(missing)
            }
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            let mut missing = Vec::new();
            for (key, item) in map {
                match render_value(item, lookup) {
                    Ok(v) => {
                        out.insert(key.clone(), v);
                    }
                    Err(names) => missing.extend(names),
                }
            }
            if missing.is_empty() {
                Ok(Value::Object(out))
            } else {
                Err(missing)
            }
        }
        other => Ok(other.clone()),
    }
}

fn sole_placeholder(text: &str) -> Option<String> {
    let caps = PLACEHOLDER.captures(text)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == text.len() {
        Some(caps[1].to_string())
    } else {
        None
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
