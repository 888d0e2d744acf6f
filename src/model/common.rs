use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub type Id = String;

/// A stored document: a JSON object keyed by field name.
pub type Document = Map<String, Value>;

/// Physical key of every stored document.
pub const PHYSICAL_KEY: &str = "_id";
/// Soft-delete marker injected into every schema.
pub const DELETED_AT: &str = "deletedAt";
/// Snapshot of relationship values taken at soft deletion.
pub const LINKS_BAG: &str = "_links";
/// Field that turns on tenant scoping for a resource.
pub const TENANT_FIELD: &str = "_tenantId";

const OBJECT_ID_LEN: usize = 24;

/// Generate a fresh 24-hex physical key.
pub fn generate_id() -> Id {
    Uuid::new_v4().simple().to_string()[..OBJECT_ID_LEN].to_string()
}

pub fn is_object_id(raw: &str) -> bool {
    raw.len() == OBJECT_ID_LEN && raw.chars().all(|c| c.is_ascii_hexdigit())
}

/// Stable physical key derived from arbitrary client input.
pub fn derive_object_id(raw: &str) -> Id {
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(digest)[..OBJECT_ID_LEN].to_string()
}

/// Cast a client-supplied id to a physical key, falling back to a derived key
/// when the input is not a well-formed 24-hex identifier.
pub fn cast_object_id(raw: &str) -> Id {
    if is_object_id(raw) {
        raw.to_ascii_lowercase()
    } else {
        derive_object_id(raw)
    }
}

pub fn canonical_date(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    canonical_date(Utc::now())
}

/// Parse RFC 3339 timestamps, naive date-times and plain `YYYY-MM-DD` dates.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Some(date.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// JSON truthiness: null, false, 0, "" and missing values are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Resolve a dot-separated path inside a document.
pub fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = document.get(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a value at a dot-separated path, creating intermediate objects.
pub fn set_path(document: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            document.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = document
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                set_path(child, rest, value);
            }
        }
    }
}

/// Remove the value at a dot-separated path, returning it if present.
pub fn remove_path(document: &mut Document, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => document.remove(path),
        Some((head, rest)) => match document.get_mut(head) {
            Some(Value::Object(child)) => remove_path(child, rest),
            _ => None,
        },
    }
}

/// Mutable access to the value at a dot-separated path.
pub fn get_path_mut<'a>(document: &'a mut Document, path: &str) -> Option<&'a mut Value> {
    match path.split_once('.') {
        None => document.get_mut(path),
        Some((head, rest)) => match document.get_mut(head) {
            Some(Value::Object(child)) => get_path_mut(child, rest),
            _ => None,
        },
    }
}

/// Values held by a relationship field, flattening sets and dropping nulls.
pub fn id_values(value: Option<&Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).cloned().collect(),
        Some(other) => vec![other.clone()],
    }
}
