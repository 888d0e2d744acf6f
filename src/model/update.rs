use serde_json::{Map, Value};

use crate::error::{ResourceError, ResourceResult};
use crate::model::common::Document;

/// A normalized, operator-keyed update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateCommand {
    pub set: Document,
    pub unset: Vec<String>,
    pub push: Vec<(String, Vec<Value>)>,
    pub add_to_set: Vec<(String, Vec<Value>)>,
    pub pull: Vec<(String, Vec<Value>)>,
    pub inc: Vec<(String, Value)>,
}

impl UpdateCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: Value) -> Self {
        self.set.insert(path.into(), value);
        self
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.unset.push(path.into());
        self
    }

    pub fn add_to_set(mut self, path: impl Into<String>, values: Vec<Value>) -> Self {
        self.add_to_set.push((path.into(), values));
        self
    }

    pub fn pull(mut self, path: impl Into<String>, values: Vec<Value>) -> Self {
        self.pull.push((path.into(), values));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.unset.is_empty()
            && self.push.is_empty()
            && self.add_to_set.is_empty()
            && self.pull.is_empty()
            && self.inc.is_empty()
    }

    /// Parse a raw update. Keys outside an operator are treated as `$set`;
    /// explicit `$set` entries win over them.
    pub fn from_value(raw: &Value) -> ResourceResult<Self> {
        let Value::Object(map) = raw else {
            return Err(ResourceError::BadRequest("update must be an object".to_string()));
        };

        let mut command = UpdateCommand::new();
        let mut explicit_set = Map::new();
        for (key, value) in map {
            if !key.starts_with('$') {
                command.set.insert(key.clone(), value.clone());
                continue;
            }
            match key.as_str() {
                "$set" => explicit_set.extend(operand(key, value)?.clone()),
                "$unset" => match value {
                    Value::Array(paths) => command
                        .unset
                        .extend(paths.iter().filter_map(Value::as_str).map(str::to_string)),
                    _ => command.unset.extend(operand(key, value)?.keys().cloned()),
                },
                "$push" => command.push.extend(list_operands(key, value)?),
                "$addToSet" => command.add_to_set.extend(list_operands(key, value)?),
                "$pull" | "$pullAll" => command.pull.extend(list_operands(key, value)?),
                "$inc" => command
                    .inc
                    .extend(operand(key, value)?.iter().map(|(k, v)| (k.clone(), v.clone()))),
                other => {
                    return Err(ResourceError::BadRequest(format!(
                        "unsupported update operator '{}'",
                        other
                    )))
                }
            }
        }
        command.set.extend(explicit_set);
        Ok(command)
    }

    /// Render back into operator form, e.g. for hooks.
    pub fn to_value(&self) -> Value {
        let mut out = Map::new();
        if !self.set.is_empty() {
            out.insert("$set".to_string(), Value::Object(self.set.clone()));
        }
        if !self.unset.is_empty() {
            let unset = self.unset.iter().map(|p| (p.clone(), Value::from(""))).collect();
            out.insert("$unset".to_string(), Value::Object(unset));
        }
        for (operator, entries) in [
            ("$push", &self.push),
            ("$addToSet", &self.add_to_set),
            ("$pull", &self.pull),
        ] {
            if entries.is_empty() {
                continue;
            }
            let mut body = Map::new();
            for (path, values) in entries {
                let mut each = Map::new();
                each.insert("$each".to_string(), Value::Array(values.clone()));
                body.insert(path.clone(), Value::Object(each));
            }
            out.insert(operator.to_string(), Value::Object(body));
        }
        if !self.inc.is_empty() {
            out.insert("$inc".to_string(), Value::Object(self.inc.iter().cloned().collect()));
        }
        Value::Object(out)
    }

    /// Field paths touched by this update, operator names stripped.
    pub fn modified_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.set.keys().cloned().collect();
        paths.extend(self.unset.iter().cloned());
        for (path, _) in self.push.iter().chain(&self.add_to_set).chain(&self.pull) {
            paths.push(path.clone());
        }
        paths.extend(self.inc.iter().map(|(path, _)| path.clone()));
        paths.sort();
        paths.dedup();
        paths
    }

    /// Whether this update touches the top-level field `field`.
    pub fn touches(&self, field: &str) -> bool {
        self.modified_paths()
            .iter()
            .any(|path| path.split('.').next() == Some(field))
    }
}

fn operand<'a>(operator: &str, value: &'a Value) -> ResourceResult<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| {
        ResourceError::BadRequest(format!("operator '{}' expects an object operand", operator))
    })
}

/// `{path: value}` or `{path: {"$each": [..]}}`; `$pullAll` and `$in` take arrays.
fn list_operands(operator: &str, value: &Value) -> ResourceResult<Vec<(String, Vec<Value>)>> {
    Ok(operand(operator, value)?
        .iter()
        .map(|(path, operand)| {
            let values = match operand {
                Value::Object(inner) if inner.contains_key("$each") || inner.contains_key("$in") => inner
                    .get("$each")
                    .or_else(|| inner.get("$in"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                Value::Array(items) if operator == "$pullAll" => items.clone(),
                other => vec![other.clone()],
            };
            (path.clone(), values)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_keys_become_set_and_explicit_set_wins() {
        let command = UpdateCommand::from_value(&json!({
            "name": "bare",
            "age": 3,
            "$set": {"name": "explicit"}
        }))
        .unwrap();
        assert_eq!(command.set.get("name"), Some(&json!("explicit")));
        assert_eq!(command.set.get("age"), Some(&json!(3)));
    }

    #[test]
    fn test_modified_paths_strip_operators() {
        let command = UpdateCommand::from_value(&json!({
            "$set": {"name": "x", "nested.field1": "y"},
            "$pull": {"pets": "p1"},
            "$push": {"lovers": {"$each": ["a", "b"]}},
            "$unset": {"soulmate": ""}
        }))
        .unwrap();
        assert_eq!(
            command.modified_paths(),
            vec!["lovers", "name", "nested.field1", "pets", "soulmate"]
        );
        assert!(command.touches("nested"));
        assert!(!command.touches("houses"));
        assert_eq!(command.push[0].1, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn test_unknown_operator_is_rejected() {
        let result = UpdateCommand::from_value(&json!({"$rename": {"a": "b"}}));
        assert!(matches!(result, Err(ResourceError::BadRequest(_))));
    }

    #[test]
    fn test_to_value_parses_back() {
        let command = UpdateCommand::new()
            .set("name", json!("Dilbert"))
            .unset("soulmate")
            .add_to_set("pets", vec![json!("p1")]);
        let reparsed = UpdateCommand::from_value(&command.to_value()).unwrap();
        assert_eq!(reparsed, command);
    }
}
