//! Utility functions and helpers for JSON values

use serde_json::{Map, Value};

/// Deep-merge `source` into `target`.
///
/// Objects merge key-wise and recursively. Arrays, primitives and nulls in
/// `source` overwrite whatever `target` holds at that key. A non-object
/// `source` leaves `target` untouched; a non-object `target` is replaced by
/// an empty object before merging.
pub fn extend(target: &mut Value, source: &Value) {
    let Value::Object(source) = source else {
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    if let Value::Object(target) = target {
        for (key, value) in source {
            match value {
                Value::Object(_) => {
                    let slot = target.entry(key.clone()).or_insert(Value::Null);
                    extend(slot, value);
                }
                _ => {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Merge a sequence of objects into a fresh object, left to right
pub fn merged<'a, I>(sources: I) -> Value
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut out = Value::Object(Map::new());
    for source in sources {
        extend(&mut out, source);
    }
    out
}

/// Resolve a dotted path such as `page.type` inside `value`
pub fn value_at_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Truthiness as page scripts see it: `null`, `false`, `0`, `NaN` and `""`
/// are falsy, everything else (including `{}` and `[]`) is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Whether the value at `path` exists and is truthy
pub fn truthy_at(value: &Value, path: &str) -> bool {
    value_at_path(value, path).map(is_truthy).unwrap_or(false)
}

/// Read a string at `path`, falling back to an empty string
pub fn str_at<'a>(value: &'a Value, path: &str) -> &'a str {
    value_at_path(value, path).and_then(Value::as_str).unwrap_or("")
}
