use serde_json::{Map, Value};

/// Fold decoded `key=value` pairs written in bracket notation into nested JSON.
///
/// `filter[name][regex]=x` becomes `{"filter": {"name": {"regex": "x"}}}`.
/// Repeated keys and `key[]` collect into arrays; numeric segments stay
/// object keys so `or[0][...]` arrives as an index map.
pub fn parse_query_pairs<I, K, V>(pairs: I) -> Value
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let mut root = Map::new();
    for (key, value) in pairs {
        let segments = key_segments(key.as_ref());
        if segments.first().map_or(true, |head| head.is_empty()) {
            continue;
        }
        insert(&mut root, &segments, Value::String(value.into()));
    }
    Value::Object(root)
}

fn key_segments(key: &str) -> Vec<&str> {
    let mut parts = key.split('[');
    let head = parts.next().unwrap_or_default();
    std::iter::once(head)
        .chain(parts.map(|part| part.trim_end_matches(']')))
        .collect()
}

fn insert(map: &mut Map<String, Value>, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    match rest {
        [] | [""] => append(map, head, value),
        _ => {
            let entry = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(nested) = entry {
                insert(nested, rest, value);
            }
        }
    }
}

fn append(map: &mut Map<String, Value>, key: &str, value: Value) {
    match map.get_mut(key) {
        None => {
            map.insert(key.to_string(), value);
        }
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let previous = existing.take();
            *existing = Value::Array(vec![previous, value]);
        }
    }
}
