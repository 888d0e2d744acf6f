use chrono::{TimeZone, Utc};
use log::{debug, warn};
use serde_json::{Map, Value};

use crate::error::{ResourceError, ResourceResult};
use crate::model::{
    canonical_date, cast_object_id, get_path, parse_date, set_path, Cardinality, Document, FieldSpec,
    KeyType, PrimitiveType, ResourceDef, UpdateCommand, LINKS_BAG, PHYSICAL_KEY,
};

/// Convert a logical (wire) document into its stored form.
pub fn to_storage(def: &ResourceDef, input: &Value, id: Option<&Value>) -> ResourceResult<Document> {
    let Value::Object(input) = input else {
        return Err(ResourceError::BadRequest(format!(
            "{} must be an object",
            def.name
        )));
    };

    let mut fields = input.clone();
    if let Some(Value::Object(links)) = fields.remove("links") {
        fields.extend(links);
    }
    fields.remove("href");
    let logical_id = fields.remove("id");

    let mut document = Document::new();
    for (key, value) in fields {
        match def.field(&key) {
            Some(field) => {
                let cast = cast_value(def, &key, &field.spec, value)?;
                document.insert(key, cast);
            }
            None => debug!("Dropping undeclared field '{}' on {}", key, def.name),
        }
    }

    if let Some(id) = id.or(logical_id.as_ref()).filter(|id| !id.is_null()) {
        document.insert(def.pk_field().to_string(), cast_id(def, id)?);
    }
    Ok(document)
}

/// Cast every `$set` value to its declared type and fold `links`.
pub fn cast_update(def: &ResourceDef, command: &mut UpdateCommand) -> ResourceResult<()> {
    let set = std::mem::take(&mut command.set);
    for (path, value) in set {
        if path == "id" || path == PHYSICAL_KEY || path == "href" {
            continue;
        }
        if path == "links" {
            if let Value::Object(links) = value {
                for (field, value) in links {
                    insert_cast(def, &mut command.set, field, value)?;
                }
            }
            continue;
        }
        let path = path.strip_prefix("links.").map(str::to_string).unwrap_or(path);
        insert_cast(def, &mut command.set, path, value)?;
    }

    for path in command.unset.iter_mut() {
        if let Some(stripped) = path.strip_prefix("links.") {
            *path = stripped.to_string();
        }
    }
    for entries in [&mut command.push, &mut command.add_to_set, &mut command.pull] {
        for (path, values) in entries.iter_mut() {
            if let Some(stripped) = path.strip_prefix("links.") {
                *path = stripped.to_string();
            }
            let path = path.as_str();
            if let Some(FieldSpec::List { item }) = def.field_at_path(path) {
                let cast: ResourceResult<Vec<Value>> = values
                    .drain(..)
                    .map(|v| cast_value(def, path, item, v))
                    .collect();
                *values = cast?;
            }
        }
    }
    Ok(())
}

fn insert_cast(def: &ResourceDef, set: &mut Document, path: String, value: Value) -> ResourceResult<()> {
    match def.field_at_path(&path) {
        Some(spec) => {
            let cast = cast_value(def, &path, spec, value)?;
            set.insert(path, cast);
        }
        None => debug!("Dropping undeclared update path '{}' on {}", path, def.name),
    }
    Ok(())
}

/// Cast a logical id to the stored primary-key value.
pub fn cast_id(def: &ResourceDef, raw: &Value) -> ResourceResult<Value> {
    match def.key_type {
        KeyType::ObjectId => match raw {
            Value::String(s) => Ok(Value::String(cast_object_id(s))),
            Value::Number(n) => Ok(Value::String(cast_object_id(&n.to_string()))),
            other => Err(ResourceError::cast(&def.name, "id", "ObjectId", other)),
        },
        KeyType::Field(ty) => {
            let cast = cast_primitive(def, def.pk_field(), ty, raw.clone())?;
            if cast.is_null() {
                return Err(ResourceError::cast(&def.name, def.pk_field(), "id", raw));
            }
            Ok(cast)
        }
    }
}

pub fn cast_value(def: &ResourceDef, path: &str, spec: &FieldSpec, value: Value) -> ResourceResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match spec {
        FieldSpec::Primitive { ty, .. } => cast_primitive(def, path, *ty, value),
        FieldSpec::Reference(reference) => match (reference.cardinality, value) {
            (Cardinality::One, other @ (Value::Array(_) | Value::Object(_))) => Err(
                ResourceError::cast(&def.name, path, format!("{} id", reference.target), &other),
            ),
            (Cardinality::One, scalar) => Ok(scalar),
            (Cardinality::Many, Value::Array(items)) => {
                let mut ids: Vec<Value> = Vec::with_capacity(items.len());
                for item in items.into_iter().filter(|v| !v.is_null()) {
                    if item.is_object() || item.is_array() {
                        return Err(ResourceError::cast(&def.name, path, format!("{} id", reference.target), &item));
                    }
                    if !ids.contains(&item) {
                        ids.push(item);
                    }
                }
                Ok(Value::Array(ids))
            }
            (Cardinality::Many, other @ Value::Object(_)) => Err(ResourceError::cast(
                &def.name,
                path,
                format!("{} ids", reference.target),
                &other,
            )),
            (Cardinality::Many, scalar) => Ok(Value::Array(vec![scalar])),
        },
        FieldSpec::CustomType { fields, .. } => {
            let Value::Object(map) = value else {
                return Err(ResourceError::cast(&def.name, path, "object", &value));
            };
            let mut out = Map::new();
            for (key, inner) in map {
                match fields.iter().find(|f| f.name == key) {
                    Some(field) => {
                        let nested_path = format!("{}.{}", path, key);
                        out.insert(key, cast_value(def, &nested_path, &field.spec, inner)?);
                    }
                    None => debug!("Dropping undeclared nested field '{}.{}'", path, key),
                }
            }
            Ok(Value::Object(out))
        }
        FieldSpec::List { item } => match value {
            Value::Array(items) => items
                .into_iter()
                .map(|v| cast_value(def, path, item, v))
                .collect::<ResourceResult<Vec<_>>>()
                .map(Value::Array),
            scalar => Ok(Value::Array(vec![cast_value(def, path, item, scalar)?])),
        },
    }
}

pub fn cast_primitive(def: &ResourceDef, path: &str, ty: PrimitiveType, value: Value) -> ResourceResult<Value> {
    let fail = |value: &Value| ResourceError::cast(&def.name, path, format!("{:?}", ty).to_lowercase(), value);
    match (ty, value) {
        (_, Value::Null) => Ok(Value::Null),
        (PrimitiveType::String, Value::String(s)) => Ok(Value::String(s)),
        (PrimitiveType::String, v @ (Value::Number(_) | Value::Bool(_))) => Ok(Value::String(v.to_string())),
        (PrimitiveType::Number, v @ Value::Number(_)) => Ok(v),
        (PrimitiveType::Number, Value::String(s)) => parse_number(&s).ok_or_else(|| fail(&Value::String(s))),
        (PrimitiveType::Boolean, v @ Value::Bool(_)) => Ok(v),
        (PrimitiveType::Boolean, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(fail(&Value::String(s))),
        },
        (PrimitiveType::Boolean, Value::Number(n)) => match n.as_i64() {
            Some(0) => Ok(Value::Bool(false)),
            Some(1) => Ok(Value::Bool(true)),
            _ => Err(fail(&Value::Number(n))),
        },
        (PrimitiveType::Date, Value::String(s)) => parse_date(&s)
            .map(|d| Value::String(canonical_date(d)))
            .ok_or_else(|| fail(&Value::String(s))),
        (PrimitiveType::Date, Value::Number(n)) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .map(|d| Value::String(canonical_date(d)))
            .ok_or_else(|| fail(&Value::Number(n))),
        (PrimitiveType::Binary, v @ Value::String(_)) => Ok(v),
        (PrimitiveType::Object, v) => Ok(v),
        (_, other) => Err(fail(&other)),
    }
}

pub fn parse_number(raw: &str) -> Option<Value> {
    let raw = raw.trim();
    if let Ok(int) = raw.parse::<i64>() {
        return Some(Value::from(int));
    }
    raw.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

fn has_links(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

/// Convert a stored document into its wire representation.
pub fn to_wire(def: &ResourceDef, document: &Document) -> Value {
    let mut out = Map::new();
    if let Some(id) = document.get(def.pk_field()) {
        out.insert("id".to_string(), id.clone());
    }

    let mut current_links = Map::new();
    for (key, value) in document {
        if key == PHYSICAL_KEY || key == LINKS_BAG || key == "__v" {
            continue;
        }
        if def.is_reference(key) {
            if has_links(value) {
                current_links.insert(key.clone(), value.clone());
            }
            continue;
        }
        out.insert(key.clone(), value.clone());
    }

    let links = if !current_links.is_empty() {
        current_links
    } else {
        match document.get(LINKS_BAG) {
            Some(Value::Object(snapshot)) => snapshot.clone(),
            _ => Map::new(),
        }
    };
    if !links.is_empty() {
        out.insert("links".to_string(), Value::Object(links));
    }
    Value::Object(out)
}

/// Drop a top-level selection that a nested selection already covers.
pub fn prune_select(select: Vec<String>) -> Vec<String> {
    select
        .iter()
        .filter(|key| {
            let nested_prefix = format!("{}.", key);
            let covered = !key.contains('.') && select.iter().any(|other| other.starts_with(&nested_prefix));
            if covered {
                warn!("Projection selects both '{}' and a nested path of it; dropping '{}'", key, key);
            }
            !covered
        })
        .cloned()
        .collect()
}

/// Keep only selected paths plus the keys needed to identify the document.
pub fn project(def: &ResourceDef, document: &Document, select: &[String]) -> Document {
    let mut out = Document::new();
    for key in [PHYSICAL_KEY, def.pk_field()] {
        if let Some(value) = document.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    for path in select {
        if path == "id" {
            continue;
        }
        let stored_path = path.strip_prefix("links.").unwrap_or(path);
        if let Some(value) = get_path(document, stored_path) {
            set_path(&mut out, stored_path, value.clone());
        }
    }
    out
}

/// Wire output for a projection; the forced primary key is removed again
/// when it was not requested.
pub fn to_wire_projected(def: &ResourceDef, document: &Document, select: &[String]) -> Value {
    let projected = project(def, document, select);
    let mut wire = to_wire(def, &projected);
    let pk_requested = select.iter().any(|s| s == "id" || s == def.pk_field());
    if !pk_requested {
        if let Value::Object(map) = &mut wire {
            map.remove("id");
            map.remove(def.pk_field());
        }
    }
    wire
}
