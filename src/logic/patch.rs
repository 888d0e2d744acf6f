use serde::Deserialize;
use serde_json::Value;

use crate::error::{ResourceError, ResourceResult};
use crate::model::UpdateCommand;

#[derive(Debug, Clone, Deserialize)]
pub struct PatchOperation {
    pub op: String,
    pub path: String,
    #[serde(default)]
    pub value: Value,
}

/// Build an update from a PATCH body.
///
/// The body is either a list of JSON Patch operations addressing
/// `/<route>/0/<field>` or `/<route>/0/links/<field>` (with a trailing `/-`
/// for set append and removal), `{<route>: [update]}`, or a plain update
/// object.
pub fn update_from_patch(route: &str, body: &Value) -> ResourceResult<UpdateCommand> {
    match body {
        Value::Array(operations) => {
            let mut command = UpdateCommand::new();
            for raw in operations {
                let operation: PatchOperation = serde_json::from_value(raw.clone())
                    .map_err(|e| ResourceError::BadRequest(format!("invalid patch operation: {}", e)))?;
                apply_operation(&mut command, route, operation)?;
            }
            Ok(command)
        }
        Value::Object(map) => match map.get(route) {
            Some(Value::Array(items)) if map.len() == 1 => match items.as_slice() {
                [update] => UpdateCommand::from_value(update),
                _ => Err(ResourceError::BadRequest(format!(
                    "patch body must hold exactly one {} update",
                    route
                ))),
            },
            Some(update @ Value::Object(_)) if map.len() == 1 => UpdateCommand::from_value(update),
            _ => UpdateCommand::from_value(body),
        },
        _ => Err(ResourceError::BadRequest(
            "patch body must be an object or a list of operations".to_string(),
        )),
    }
}

fn apply_operation(command: &mut UpdateCommand, route: &str, operation: PatchOperation) -> ResourceResult<()> {
    let mut segments: Vec<&str> = operation
        .path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    if segments.first() == Some(&route) {
        segments.remove(0);
    }
    if segments.first().is_some_and(|s| s.parse::<usize>().is_ok()) {
        segments.remove(0);
    }
    if segments.first() == Some(&"links") {
        segments.remove(0);
    }
    let append = segments.last() == Some(&"-");
    if append {
        segments.pop();
    }
    if segments.is_empty() {
        return Err(ResourceError::BadRequest(format!(
            "patch path '{}' does not address a field",
            operation.path
        )));
    }
    let path = segments.join(".");

    match (operation.op.as_str(), append) {
        ("replace" | "add", false) => {
            command.set.insert(path, operation.value);
        }
        ("add", true) => command.add_to_set.push((path, as_list(operation.value))),
        ("remove", true) => command.pull.push((path, as_list(operation.value))),
        ("remove", false) => command.unset.push(path),
        (other, _) => {
            return Err(ResourceError::BadRequest(format!(
                "unsupported patch operation '{}' on '{}'",
                other, operation.path
            )))
        }
    }
    Ok(())
}

fn as_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_patch_operations() {
        let command = update_from_patch(
            "people",
            &json!([
                {"op": "replace", "path": "/people/0/name", "value": "Wally"},
                {"op": "replace", "path": "/people/0/links/soulmate", "value": "b@x.com"},
                {"op": "add", "path": "/people/0/links/pets/-", "value": "spot"},
                {"op": "remove", "path": "/people/0/links/houses/-", "value": "h1"},
                {"op": "remove", "path": "/people/0/nested/field1"}
            ]),
        )
        .unwrap();

        assert_eq!(command.set.get("name"), Some(&json!("Wally")));
        assert_eq!(command.set.get("soulmate"), Some(&json!("b@x.com")));
        assert_eq!(command.add_to_set, vec![("pets".to_string(), vec![json!("spot")])]);
        assert_eq!(command.pull, vec![("houses".to_string(), vec![json!("h1")])]);
        assert_eq!(command.unset, vec!["nested.field1".to_string()]);
    }

    #[test]
    fn test_plain_and_wrapped_updates() {
        let plain = update_from_patch("people", &json!({"name": "Wally", "$unset": {"soulmate": ""}})).unwrap();
        assert_eq!(plain.set.get("name"), Some(&json!("Wally")));
        assert_eq!(plain.unset, vec!["soulmate".to_string()]);

        let wrapped = update_from_patch("people", &json!({"people": [{"links": {"soulmate": "b@x.com"}}]})).unwrap();
        assert_eq!(wrapped.set.get("links"), Some(&json!({"soulmate": "b@x.com"})));
    }

    #[test]
    fn test_rejects_unknown_operations() {
        let result = update_from_patch("people", &json!([{"op": "move", "path": "/people/0/name"}]));
        assert!(matches!(result, Err(ResourceError::BadRequest(_))));
        let result = update_from_patch("people", &json!([{"op": "replace", "path": "/people/0"}]));
        assert!(result.is_err());
    }
}
