//! Translation of the external filter grammar into store predicates.
//!
//! Per field the grammar accepts equality, range bounds (`gt`, `gte`, `lt`,
//! `lte`), `regex` with `options`, membership (`in`, `nin`), presence
//! (`exists`) and `ne`, each either bare or `$`-prefixed. `or`/`and` compose
//! recursively. The literal strings `"null"` and `"undefined"` stand for a
//! null value and an absent field.

use chrono::Duration;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{ResourceError, ResourceResult};
use crate::model::{canonical_date, parse_date, Condition, FieldSpec, KeyType, Predicate, PrimitiveType, ResourceDef};
use crate::store::codec::{cast_id, parse_number};

const OPERATORS: [&str; 12] = [
    "gt", "gte", "lt", "lte", "in", "nin", "ne", "eq", "exists", "regex", "options", "all",
];

/// Whether `key` is a filter operator, bare or `$`-prefixed.
pub fn is_operator(key: &str) -> bool {
    OPERATORS.contains(&key.trim_start_matches('$'))
}

/// Normalize a filter against a resource schema.
pub fn parse_query(def: &ResourceDef, filter: &Value) -> ResourceResult<Predicate> {
    match filter {
        Value::Null => Ok(Predicate::All),
        Value::Object(map) => parse_object(def, map),
        Value::Array(ids) => {
            let mut ids = ids
                .iter()
                .map(|id| cast_id(def, id))
                .collect::<ResourceResult<Vec<_>>>()?;
            Ok(if ids.len() == 1 {
                Predicate::eq(def.pk_field(), ids.remove(0))
            } else {
                Predicate::is_in(def.pk_field(), ids)
            })
        }
        scalar => parse_field(def, "id", scalar),
    }
}

fn parse_object(def: &ResourceDef, map: &Map<String, Value>) -> ResourceResult<Predicate> {
    let mut parts = Vec::with_capacity(map.len());
    for (key, value) in map {
        match key.as_str() {
            "or" | "$or" => {
                let branches = branches(def, value)?;
                if !branches.is_empty() {
                    parts.push(Predicate::Or(branches));
                }
            }
            "and" | "$and" => parts.push(Predicate::and(branches(def, value)?)),
            _ if key.starts_with('$') => {
                if !value.is_null() {
                    return Err(ResourceError::BadRequest(format!(
                        "unsupported top-level operator '{}'",
                        key
                    )));
                }
            }
            _ => parts.push(parse_field(def, key, value)?),
        }
    }
    Ok(Predicate::and(parts))
}

/// Branches arrive as an array, or as an index-keyed map from bracket notation.
fn branches(def: &ResourceDef, value: &Value) -> ResourceResult<Vec<Predicate>> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(indexed) => {
            let mut entries: Vec<(&String, &Value)> = indexed.iter().collect();
            entries.sort_by_key(|(index, _)| index.parse::<usize>().unwrap_or(usize::MAX));
            entries.into_iter().map(|(_, v)| v).collect()
        }
        other => {
            return Err(ResourceError::BadRequest(format!(
                "boolean composition expects a list of filters, got {}",
                other
            )))
        }
    };
    items.into_iter().map(|branch| parse_query_branch(def, branch)).collect()
}

fn parse_query_branch(def: &ResourceDef, branch: &Value) -> ResourceResult<Predicate> {
    match branch {
        Value::Object(map) => parse_object(def, map),
        other => Err(ResourceError::BadRequest(format!(
            "boolean composition branch must be an object, got {}",
            other
        ))),
    }
}

/// The type a filter value is cast to.
#[derive(Clone, Copy)]
enum Target {
    Id,
    Primitive(PrimitiveType),
    Untyped,
}

struct FieldFilter<'a> {
    def: &'a ResourceDef,
    path: String,
    target: Target,
}

fn parse_field(def: &ResourceDef, key: &str, value: &Value) -> ResourceResult<Predicate> {
    let (path, target) = if key == "id" {
        (def.pk_field().to_string(), Target::Id)
    } else {
        let target = match def.primitive_type_at(key) {
            Some(ty) => Target::Primitive(ty),
            None => Target::Untyped,
        };
        (key.to_string(), target)
    };

    if let Value::Object(map) = value {
        let has_operator = map.keys().any(|k| is_operator(k));
        if !has_operator {
            // Nested documents match field by field
            if let Some(FieldSpec::CustomType { .. }) = def.field_at_path(key) {
                let prefixed: Map<String, Value> = map
                    .iter()
                    .map(|(nested, v)| (format!("{}.{}", key, nested), v.clone()))
                    .collect();
                return parse_object(def, &prefixed);
            }
        }
        let filter = FieldFilter { def, path, target };
        let conditions = if has_operator {
            filter.operators(map)?
        } else {
            vec![Condition::Eq(value.clone())]
        };
        return Ok(Predicate::Field {
            path: filter.path,
            conditions,
        });
    }

    let filter = FieldFilter { def, path, target };
    let conditions = filter.exact(value)?;
    Ok(Predicate::Field {
        path: filter.path,
        conditions,
    })
}

impl FieldFilter<'_> {
    fn exact(&self, value: &Value) -> ResourceResult<Vec<Condition>> {
        match legacy(value) {
            Legacy::Null => return Ok(vec![Condition::Eq(Value::Null)]),
            Legacy::Undefined => return Ok(vec![Condition::Exists(false)]),
            Legacy::Value => {}
        }
        match (self.target, value) {
            (_, Value::Array(items)) => Ok(vec![Condition::In(self.list(items)?)]),
            (Target::Primitive(PrimitiveType::Date), Value::String(raw)) => {
                let day = parse_date(raw)
                    .ok_or_else(|| self.cast_error("date", value))?
                    .date_naive();
                let start = day
                    .and_hms_opt(0, 0, 0)
                    .map(|t| t.and_utc())
                    .ok_or_else(|| self.cast_error("date", value))?;
                Ok(vec![
                    Condition::Gte(Value::String(canonical_date(start))),
                    Condition::Lt(Value::String(canonical_date(start + Duration::days(1)))),
                ])
            }
            _ => Ok(vec![Condition::Eq(self.cast(value)?)]),
        }
    }

    fn operators(&self, map: &Map<String, Value>) -> ResourceResult<Vec<Condition>> {
        let mut conditions = Vec::with_capacity(map.len());
        for (key, operand) in map {
            let op = key.trim_start_matches('$');
            if key.starts_with('$') && operand.is_null() {
                continue;
            }
            let condition = match op {
                "exists" => Condition::Exists(match operand {
                    Value::Bool(b) => *b,
                    Value::String(s) => s.eq_ignore_ascii_case("true"),
                    other => crate::model::is_truthy(other),
                }),
                "regex" => {
                    let pattern = operand
                        .as_str()
                        .ok_or_else(|| self.cast_error("regular expression", operand))?;
                    Regex::new(pattern).map_err(|e| {
                        ResourceError::BadRequest(format!("invalid pattern for '{}': {}", self.path, e))
                    })?;
                    let options = map
                        .get("options")
                        .or_else(|| map.get("$options"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    Condition::Regex {
                        pattern: pattern.to_string(),
                        options: options.to_string(),
                    }
                }
                "options" => continue,
                "gt" => Condition::Gt(self.cast(operand)?),
                "gte" => Condition::Gte(self.cast(operand)?),
                "lt" => Condition::Lt(self.cast(operand)?),
                "lte" => Condition::Lte(self.cast(operand)?),
                "in" | "all" => Condition::In(self.list_operand(operand)?),
                "nin" => Condition::Nin(self.list_operand(operand)?),
                "ne" => Condition::Ne(self.coerced(operand)?),
                "eq" => Condition::Eq(self.coerced(operand)?),
                _ => {
                    return Err(ResourceError::BadRequest(format!(
                        "unsupported filter operator '{}' on '{}'",
                        key, self.path
                    )))
                }
            };
            conditions.push(condition);
        }
        Ok(conditions)
    }

    fn list_operand(&self, operand: &Value) -> ResourceResult<Vec<Value>> {
        match operand {
            Value::String(s) => self.list(
                &s.split(',')
                    .map(|part| Value::String(part.trim().to_string()))
                    .collect::<Vec<_>>(),
            ),
            Value::Array(items) => self.list(items),
            Value::Object(map) => self.list(&map.values().cloned().collect::<Vec<_>>()),
            scalar => self.list(std::slice::from_ref(scalar)),
        }
    }

    fn list(&self, items: &[Value]) -> ResourceResult<Vec<Value>> {
        items.iter().map(|item| self.coerced(item)).collect()
    }

    /// Cast after applying the `"null"` legacy rule.
    fn coerced(&self, value: &Value) -> ResourceResult<Value> {
        match legacy(value) {
            Legacy::Null | Legacy::Undefined => Ok(Value::Null),
            Legacy::Value => self.cast(value),
        }
    }

    fn cast(&self, value: &Value) -> ResourceResult<Value> {
        match (self.target, value) {
            (Target::Id, v) => match self.def.key_type {
                KeyType::ObjectId if !v.is_string() && !v.is_number() => Ok(v.clone()),
                _ => cast_id(self.def, v),
            },
            (Target::Primitive(PrimitiveType::Number), Value::String(s)) => {
                parse_number(s).ok_or_else(|| self.cast_error("number", value))
            }
            (Target::Primitive(PrimitiveType::Date), Value::String(s)) => parse_date(s)
                .map(|d| Value::String(canonical_date(d)))
                .ok_or_else(|| self.cast_error("date", value)),
            (Target::Primitive(PrimitiveType::Boolean), Value::String(s)) => {
                match s.to_ascii_lowercase().as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Err(self.cast_error("boolean", value)),
                }
            }
            (Target::Primitive(PrimitiveType::String), Value::Number(n)) => Ok(Value::String(n.to_string())),
            _ => Ok(value.clone()),
        }
    }

    fn cast_error(&self, expected: &str, value: &Value) -> ResourceError {
        ResourceError::cast(&self.def.name, &self.path, expected, value)
    }
}

enum Legacy {
    Null,
    Undefined,
    Value,
}

fn legacy(value: &Value) -> Legacy {
    match value {
        Value::Null => Legacy::Null,
        Value::String(s) if s == "null" => Legacy::Null,
        Value::String(s) if s == "undefined" => Legacy::Undefined,
        _ => Legacy::Value,
    }
}
