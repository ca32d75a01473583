//! Canonical JSON hashing.
//!
//! The hash input is the entry serialized with lexicographically sorted keys
//! and absent optional fields omitted, with the `entryHash` field excluded.
//! Sorting is done here rather than trusting the serializer's map order, so
//! the digest is stable regardless of serde_json feature flags.

use meridian_protocol::AuditEntry;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value with all object keys sorted.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys are plain strings; serde_json escapes them correctly.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 of the canonical form of an entry without its own hash.
pub fn entry_hash(entry: &AuditEntry) -> String {
    let mut value = serde_json::to_value(entry).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.remove("entryHash");
    }
    let canonical = canonical_json(&value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
