//! Cache key derivation.
//!
//! A composed key has the shape `<Type>.<Field>~<derived>`. The default derived part is the canonical JSON of the
//! arguments, followed by the sorted, de-duplicated requested output field names, followed by `~<extension>` when the
//! policy extends the key from the call context.

use std::fmt::Write;

use serde_json::Value;

use crate::types::FieldIdentity;

const FIELDS_SEPARATOR: char = '|';
const EXTENSION_SEPARATOR: char = '~';

/// Serialize a JSON value with object keys in lexicographic order regardless of how the map was built.
///
/// `serde_json::to_string` sorts keys only while `serde_json::Map` is a `BTreeMap`. The `preserve_order` feature turns
/// it into an insertion-ordered map for the whole dependency graph, and then equal arguments would produce different
/// keys.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        // Scalars have a single JSON rendering.
        other => {
            let _ = write!(out, "{other}");
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // Serializing a plain string can't fail.
    let _ = write!(out, "{}", Value::String(s.to_string()));
}

/// The selection-aware default key. When `requested_fields` is empty the field segment is omitted altogether.
pub fn default_key(args: &Value, requested_fields: &[String], extension: Option<&str>) -> String {
    let mut key = canonical_json(args);

    let mut fields = requested_fields.iter().map(String::as_str).collect::<Vec<_>>();
    fields.sort_unstable();
    fields.dedup();
    if !fields.is_empty() {
        key.push(FIELDS_SEPARATOR);
        key.push_str(&fields.join(","));
    }

    if let Some(extension) = extension {
        key.push(EXTENSION_SEPARATOR);
        key.push_str(extension);
    }

    key
}

/// Prefix a derived key with the field identity.
pub fn compose(identity: &FieldIdentity, derived: &str) -> String {
    format!("{identity}{EXTENSION_SEPARATOR}{derived}")
}
