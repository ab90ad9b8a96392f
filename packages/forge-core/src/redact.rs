//! Secret redaction for evidence packets and logs.
//!
//! Two passes: a structural pass that replaces the value of any field whose
//! key looks secret-bearing, and a terminal scrub that removes raw secret
//! values wherever they appear as substrings.

use serde_json::Value;

/// Replacement marker for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Key markers treated as secret-bearing (case-insensitive substring match).
const SECRET_KEY_MARKERS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "auth_token",
    "access_token",
    "refresh_token",
    "bearer",
    "credential",
    "private_key",
    "client_secret",
    "cookie",
    "authorization",
    "jwt",
    "session_id",
];

/// Whether a field name indicates a secret value.
pub fn is_secret_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SECRET_KEY_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Deep copy with every secret-keyed value replaced by [`REDACTED`].
pub fn redact_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if is_secret_key(k) {
                        (k.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (k.clone(), redact_keys(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_keys).collect()),
        other => other.clone(),
    }
}

/// Collect raw string values stored under secret-bearing keys.
pub fn collect_secret_values(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_into(value, &mut out);
    out
}

fn collect_into(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if is_secret_key(k) {
                    if let Value::String(s) = v {
                        if !s.is_empty() {
                            out.push(s.clone());
                        }
                    }
                } else {
                    collect_into(v, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_into(item, out);
            }
        }
        _ => {}
    }
}

/// Replace raw occurrences of any secret inside string values.
///
/// Returns true if anything was scrubbed.
pub fn scrub_secret_values(value: &mut Value, secrets: &[String]) -> bool {
    match value {
        Value::String(s) => scrub_str(s, secrets),
        Value::Array(items) => {
            let mut scrubbed = false;
            for item in items {
                scrubbed |= scrub_secret_values(item, secrets);
            }
            scrubbed
        }
        Value::Object(map) => {
            let mut scrubbed = false;
            for (_, v) in map.iter_mut() {
                scrubbed |= scrub_secret_values(v, secrets);
            }
            scrubbed
        }
        _ => false,
    }
}

/// Scrub raw secret occurrences from a single string.
pub fn scrub_str(s: &mut String, secrets: &[String]) -> bool {
    let mut scrubbed = false;
    for secret in secrets {
        if !secret.is_empty() && s.contains(secret.as_str()) {
            *s = s.replace(secret.as_str(), REDACTED);
            scrubbed = true;
        }
    }
    scrubbed
}
