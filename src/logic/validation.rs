use regex::Regex;
use serde_json::Value;

use crate::logic::hooks::{
    transform_fn, HookContext, HookDefinition, HookError, HookKind, HookOutcome, HookRegistry, HookStage,
};
use crate::model::{get_path, FieldDef, FieldSpec, FieldValidation, ResourceDef, SchemaRegistry};

pub const VALIDATION_HOOK: &str = "validation";

/// Register the field validation hook on every resource that declares rules.
pub fn register_validation(hooks: &mut HookRegistry, schemas: &SchemaRegistry) {
    for def in schemas.iter().filter(|def| has_rules(&def.fields)) {
        hooks.register_for(&def.name, HookStage::Before, HookKind::Write, validation_hook());
    }
}

pub fn validation_hook() -> HookDefinition {
    HookDefinition::from_transform(
        VALIDATION_HOOK,
        transform_fn(|value, context: &HookContext| {
            validate(&context.resource, &value).map_err(HookError::Validation)?;
            Ok(HookOutcome::Continue(value))
        }),
    )
    .with_priority(100)
}

fn has_rules(fields: &[FieldDef]) -> bool {
    fields.iter().any(|field| match &field.spec {
        FieldSpec::CustomType { fields, .. } => has_rules(fields),
        spec => spec.validation().is_some(),
    })
}

/// Check a document, or the `$set` part of an update command.
pub fn validate(def: &ResourceDef, value: &Value) -> Result<(), String> {
    let Value::Object(map) = value else {
        return Ok(());
    };

    if map.keys().any(|key| key.starts_with('$')) {
        if let Some(Value::Object(set)) = map.get("$set") {
            for (path, value) in set {
                if let Some(rules) = def.field_at_path(path).and_then(FieldSpec::validation) {
                    check(path, Some(value), rules)?;
                }
            }
        }
        return Ok(());
    }

    check_fields(&def.fields, map, "")
}

fn check_fields(fields: &[FieldDef], document: &serde_json::Map<String, Value>, prefix: &str) -> Result<(), String> {
    for field in fields.iter().filter(|f| !f.system) {
        let path = format!("{}{}", prefix, field.name);
        match &field.spec {
            FieldSpec::CustomType { fields, .. } => {
                if let Some(Value::Object(nested)) = get_path(document, &field.name) {
                    check_fields(fields, nested, &format!("{}.", path))?;
                }
            }
            spec => {
                if let Some(rules) = spec.validation() {
                    check(&path, document.get(&field.name), rules)?;
                }
            }
        }
    }
    Ok(())
}

fn check(path: &str, value: Option<&Value>, rules: &FieldValidation) -> Result<(), String> {
    let value = match value {
        None | Some(Value::Null) => {
            return if rules.required {
                Err(format!("Path `{}` is required.", path))
            } else {
                Ok(())
            };
        }
        Some(value) => value,
    };

    if let Some(text) = value.as_str() {
        let length = text.chars().count();
        if let Some(min) = rules.min_length.filter(|min| length < *min) {
            return Err(format!("Path `{}` is shorter than the minimum allowed length ({}).", path, min));
        }
        if let Some(max) = rules.max_length.filter(|max| length > *max) {
            return Err(format!("Path `{}` is longer than the maximum allowed length ({}).", path, max));
        }
        if let Some(pattern) = &rules.pattern {
            let regex = Regex::new(pattern).map_err(|e| format!("Path `{}` has an invalid pattern: {}", path, e))?;
            if !regex.is_match(text) {
                return Err(format!("Path `{}` is invalid ({}).", path, text));
            }
        }
    }

    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if rules.minimum.is_some() || rules.maximum.is_some() => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    if let Some(number) = number {
        if let Some(min) = rules.minimum.filter(|min| number < *min) {
            return Err(format!("Path `{}` ({}) is less than minimum allowed value ({}).", path, number, min));
        }
        if let Some(max) = rules.maximum.filter(|max| number > *max) {
            return Err(format!("Path `{}` ({}) is more than maximum allowed value ({}).", path, number, max));
        }
    }

    if let Some(allowed) = &rules.allowed {
        if !allowed.contains(value) {
            return Err(format!("`{}` is not a valid enum value for path `{}`.", value, path));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceDeclaration, ResourceOptions};
    use serde_json::json;
    use std::sync::Arc;

    fn person() -> Arc<ResourceDef> {
        SchemaRegistry::builder()
            .resource(ResourceDeclaration::new(
                "person",
                json!({
                    "name": {"type": "string", "validation": {"required": true, "minLength": 2}},
                    "email": {"type": "string", "validation": {"pattern": "^[^@]+@[^@]+$"}},
                    "appearances": {"type": "number", "validation": {"minimum": 0}},
                    "role": {"type": "string", "validation": {"enum": ["engineer", "boss"]}},
                    "address": {"city": {"type": "string", "validation": {"maxLength": 5}}}
                }),
                ResourceOptions::default(),
            ))
            .build()
            .unwrap()
            .get("person")
            .unwrap()
    }

    #[test]
    fn test_create_rules() {
        let def = person();
        assert!(validate(&def, &json!({"name": "Dilbert", "email": "d@x.com", "role": "engineer"})).is_ok());
        assert!(validate(&def, &json!({"email": "d@x.com"})).unwrap_err().contains("required"));
        assert!(validate(&def, &json!({"name": "D"})).unwrap_err().contains("shorter"));
        assert!(validate(&def, &json!({"name": "Dilbert", "email": "nope"})).is_err());
        assert!(validate(&def, &json!({"name": "Dilbert", "appearances": -1})).is_err());
        assert!(validate(&def, &json!({"name": "Dilbert", "role": "intern"})).is_err());
        assert!(validate(&def, &json!({"name": "Dilbert", "address": {"city": "Springfield"}})).is_err());
    }

    #[test]
    fn test_patch_checks_only_set_keys() {
        let def = person();
        assert!(validate(&def, &json!({"$set": {"appearances": 3}})).is_ok());
        assert!(validate(&def, &json!({"$set": {"name": "D"}})).is_err());
        assert!(validate(&def, &json!({"$set": {"address.city": "Elbonia"}})).is_err());
    }

    #[test]
    fn test_registration_only_where_rules_exist() {
        let schemas = SchemaRegistry::builder()
            .resource(ResourceDeclaration::new(
                "person",
                json!({"name": {"type": "string", "validation": {"required": true}}}),
                ResourceOptions::default(),
            ))
            .resource(ResourceDeclaration::new("pet", json!({"name": "string"}), ResourceOptions::default()))
            .build()
            .unwrap();
        let mut hooks = HookRegistry::new();
        register_validation(&mut hooks, &schemas);
        let chains = hooks.compose(&schemas);
        assert_eq!(chains.names("person", HookStage::Before, HookKind::Write), vec![VALIDATION_HOOK]);
        assert!(chains.names("pet", HookStage::Before, HookKind::Write).is_empty());
    }
}
