//! Canonical JSON serialization and hashing.
//!
//! Every hashing and signing path in the system goes through this module so
//! that two structurally equal values always produce the same bytes: object
//! keys are sorted recursively, separators are compact, and numbers use
//! serde_json's shortest representation.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Largest integer exactly representable in an IEEE-754 double.
pub const MAX_JS_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Serialize a value to its canonical form: keys sorted, compact separators.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// SHA-256 hex digest of the canonical serialization.
pub fn hash_canonical(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical hash of any serializable value.
pub fn hash_serializable<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(hash_canonical(&serde_json::to_value(value)?))
}

/// Whether every integer in the value fits the JS-safe range.
pub fn numbers_js_safe(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.unsigned_abs() <= MAX_JS_SAFE_INTEGER as u64
            } else {
                n.as_u64().map_or(true, |u| u <= MAX_JS_SAFE_INTEGER as u64)
            }
        }
        Value::Array(items) => items.iter().all(numbers_js_safe),
        Value::Object(map) => map.values().all(numbers_js_safe),
        _ => true,
    }
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                // key came from the map, entry is present
                if let Some(v) = map.get(*key) {
                    write_value(v, out);
                }
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_recursively() {
        let v = json!({"b": 1, "a": {"z": true, "m": [1, {"y": 2, "x": 3}]}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"m":[1,{"x":3,"y":2}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn key_order_does_not_change_hash() {
        let a = json!({"x": 1, "y": [true, null], "z": {"k": "v", "j": 2}});
        let b = json!({"z": {"j": 2, "k": "v"}, "y": [true, null], "x": 1});
        assert_eq!(hash_canonical(&a), hash_canonical(&b));
    }

    #[test]
    fn hash_is_stable_across_calls() {
        let v = json!({"a": 1});
        assert_eq!(hash_canonical(&v), hash_canonical(&v));
    }

    #[test]
    fn escapes_control_characters() {
        let v = json!({"s": "line\nbreak\ttab \u{01} quote\""});
        let canon = canonical_json(&v);
        assert_eq!(canon, "{\"s\":\"line\\nbreak\\ttab \\u0001 quote\\\"\"}");
        // the canonical form still parses back to the same value
        let parsed: Value = serde_json::from_str(&canon).expect("canonical output parses");
        assert_eq!(parsed, v);
    }

    #[test]
    fn js_safe_detects_large_integers() {
        assert!(numbers_js_safe(&json!({"n": MAX_JS_SAFE_INTEGER})));
        assert!(!numbers_js_safe(&json!({"n": MAX_JS_SAFE_INTEGER + 1})));
        assert!(!numbers_js_safe(&json!([1, 2, {"deep": i64::MIN}])));
    }

    #[test]
    fn arrays_preserve_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(canonical_json(&v), "[3,1,2]");
    }
}
