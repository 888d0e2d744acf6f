use futures_util::future::{try_join_all, BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{ResourceError, ResourceResult};
use crate::model::{ResourceDef, SchemaRegistry};

const SPECIAL_KEYS: [&str; 11] = [
    "in", "nin", "exists", "regex", "options", "gt", "gte", "lt", "lte", "ne", "eq",
];

/// Reads the ids of the documents of a resource matching a filter, through
/// the same path ordinary client reads take.
#[async_trait::async_trait]
pub trait ResourceReader: Send + Sync {
    async fn read_ids(&self, def: &Arc<ResourceDef>, filter: Value) -> ResourceResult<Vec<Value>>;
}

/// Whether every key of a filter value is an operator rather than a nested filter.
pub fn is_special(map: &Map<String, Value>) -> bool {
    map.keys()
        .all(|key| key.starts_with('$') || SPECIAL_KEYS.contains(&key.as_str()))
}

/// Normalize a membership operand into a list.
pub fn ensure_query_array(def: &ResourceDef, path: &str, value: &Value) -> ResourceResult<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::String(s) => Ok(s.split(',').map(|part| Value::String(part.to_string())).collect()),
        Value::Object(map) => Ok(map.values().cloned().collect()),
        other => Err(ResourceError::cast(&def.name, path, "array", other)),
    }
}

/// Rewrites filters that traverse relationships into id-membership filters.
pub struct QueryTree<'a, R: ResourceReader + ?Sized> {
    schemas: &'a SchemaRegistry,
    reader: &'a R,
}

impl<'a, R: ResourceReader + ?Sized> QueryTree<'a, R> {
    pub fn new(schemas: &'a SchemaRegistry, reader: &'a R) -> Self {
        Self { schemas, reader }
    }

    /// Resolve every relationship sub-filter of `filter` against `def`.
    /// Sibling keys resolve concurrently.
    pub fn resolve(&'a self, def: Arc<ResourceDef>, filter: Value) -> BoxFuture<'a, ResourceResult<Value>> {
        async move {
            let Value::Object(map) = filter else {
                return Ok(filter);
            };
            let entries = try_join_all(
                map.into_iter()
                    .map(|(key, value)| self.resolve_entry(def.clone(), key, value)),
            )
            .await?;
            Ok(Value::Object(entries.into_iter().collect()))
        }
        .boxed()
    }

    async fn resolve_entry(&'a self, def: Arc<ResourceDef>, key: String, value: Value) -> ResourceResult<(String, Value)> {
        if matches!(key.as_str(), "or" | "and" | "$or" | "$and") {
            let branches: Vec<Value> = match value {
                Value::Array(items) => items,
                Value::Object(indexed) => indexed.into_iter().map(|(_, branch)| branch).collect(),
                other => return Ok((key, other)),
            };
            let resolved = try_join_all(
                branches
                    .into_iter()
                    .map(|branch| self.resolve(def.clone(), branch)),
            )
            .await?;
            return Ok((key, Value::Array(resolved)));
        }

        let Some(reference) = def.reference(&key).filter(|r| !r.external) else {
            return Ok((key, value));
        };
        let Value::Object(map) = value else {
            return Ok((key, value));
        };

        if is_special(&map) {
            let mut normalized = Map::new();
            for (operator, operand) in map {
                match operator.as_str() {
                    "in" | "$in" => {
                        let ids = ensure_query_array(&def, &key, &operand)?;
                        normalized.insert("$in".to_string(), Value::Array(ids));
                    }
                    "nin" | "$nin" => {
                        let ids = ensure_query_array(&def, &key, &operand)?;
                        normalized.insert("$nin".to_string(), Value::Array(ids));
                    }
                    _ => {
                        normalized.insert(operator, operand);
                    }
                }
            }
            return Ok((key, Value::Object(normalized)));
        }

        let target = self.schemas.resolve(reference.target.as_str())?;
        let ids = self.reader.read_ids(&target, Value::Object(map)).await?;
        let mut membership = Map::new();
        membership.insert("$in".to_string(), Value::Array(ids));
        Ok((key, Value::Object(membership)))
    }
}
