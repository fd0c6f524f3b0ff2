//! JCS (RFC 8785) canonicalization and content addressing.
//!
//! All JSON serialization for signing and hashing follows RFC 8785 so that
//! identical content always maps to the same identifier on every peer.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Canonicalize a JSON value per RFC 8785 (JCS).
///
/// - Object keys sorted lexicographically by Unicode code point
/// - No whitespace between tokens
/// - Null values included (not omitted)
/// - Recursively applied to nested objects
pub fn canonicalize(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        Value::Number(n) => {
            // Protocol messages carry integers only; floats are tolerated
            // for debugging but never signed.
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.to_string()
            }
        }
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s)),
        Value::Array(arr) => {
            let elements: Vec<String> = arr.iter().map(canonicalize).collect();
            format!("[{}]", elements.join(","))
        }
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let pairs: Vec<String> = keys
                .iter()
                .map(|k| {
                    let key_str =
                        serde_json::to_string(*k).unwrap_or_else(|_| format!("\"{}\"", k));
                    let val_str = canonicalize(obj.get(*k).unwrap());
                    format!("{}:{}", key_str, val_str)
                })
                .collect();
            format!("{{{}}}", pairs.join(","))
        }
    }
}

/// SHA-256 hex digest of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the content address (message ID) from a signing body.
pub fn content_address(from: &str, msg_type: &str, timestamp: i64, payload: &Value) -> String {
    let signing_body = signing_body_json(from, msg_type, timestamp, payload);
    let canonical = canonicalize(&signing_body);
    sha256_hex(canonical.as_bytes())
}

/// Construct the signing body JSON value. Keys in lexicographic order:
/// from, payload, timestamp, type. Version is deliberately excluded.
pub fn signing_body_json(from: &str, msg_type: &str, timestamp: i64, payload: &Value) -> Value {
    serde_json::json!({
        "from": from,
        "payload": payload,
        "timestamp": timestamp,
        "type": msg_type,
    })
}

/// Compute the signing body bytes (JCS-canonicalized).
pub fn signing_body_bytes(from: &str, msg_type: &str, timestamp: i64, payload: &Value) -> Vec<u8> {
    let body = signing_body_json(from, msg_type, timestamp, payload);
    canonicalize(&body).into_bytes()
}

/// Content address of an arbitrary canonical JSON document. Used for task
/// envelopes, where the identifier must depend only on the envelope fields.
pub fn value_address(value: &Value) -> String {
    sha256_hex(canonicalize(value).as_bytes())
}
