use log::warn;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error as ThisError;

use crate::model::common::{DELETED_AT, LINKS_BAG, PHYSICAL_KEY, TENANT_FIELD};
use crate::model::schema::{
    Cardinality, FieldDef, FieldSpec, FieldValidation, KeyType, PrimitiveType, ReferenceDescriptor,
    ReferenceSpec, ResourceDef, ResourceOptions,
};

const RESERVED_KEYS: [&str; 7] = ["id", "href", "links", "in", "or", "and", "then"];
const MAX_UPSERT_DEPTH: usize = 2;

#[derive(Debug, ThisError)]
pub enum SchemaError {
    #[error("resource '{0}' is already registered")]
    DuplicateResource(String),
    #[error("custom type '{0}' is already registered")]
    DuplicateCustomType(String),
    #[error("resource '{resource}' field '{field}': {reason}")]
    InvalidField {
        resource: String,
        field: String,
        reason: String,
    },
    #[error("resource '{resource}' field '{field}' references unknown resource '{target}'")]
    UnknownReference {
        resource: String,
        field: String,
        target: String,
    },
    #[error("resource '{resource}' declares primary key '{pk}' which is not a declared field")]
    UnknownPrimaryKey { resource: String, pk: String },
    #[error("unknown resource '{0}'")]
    UnknownResource(String),
}

/// A resource as declared by the application, before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceDeclaration {
    pub name: String,
    pub schema: Map<String, Value>,
    #[serde(default)]
    pub options: ResourceOptions,
}

impl ResourceDeclaration {
    pub fn new(name: impl Into<String>, schema: Value, options: ResourceOptions) -> Self {
        Self {
            name: name.into(),
            schema: schema.as_object().cloned().unwrap_or_default(),
            options,
        }
    }
}

/// Either a resolved resource or its name; resolved once at the boundary.
#[derive(Debug, Clone)]
pub enum ResourceRef {
    Handle(Arc<ResourceDef>),
    Name(String),
}

impl From<&str> for ResourceRef {
    fn from(name: &str) -> Self {
        ResourceRef::Name(name.to_string())
    }
}

impl From<String> for ResourceRef {
    fn from(name: String) -> Self {
        ResourceRef::Name(name)
    }
}

impl From<Arc<ResourceDef>> for ResourceRef {
    fn from(def: Arc<ResourceDef>) -> Self {
        ResourceRef::Handle(def)
    }
}

impl From<&Arc<ResourceDef>> for ResourceRef {
    fn from(def: &Arc<ResourceDef>) -> Self {
        ResourceRef::Handle(def.clone())
    }
}

/// Immutable set of registered resources.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    resources: Vec<Arc<ResourceDef>>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResourceDef>> {
        self.resources.iter().find(|r| r.name == name).cloned()
    }

    /// Look a resource up by its collection route (e.g. `people`) or name.
    pub fn by_route(&self, route: &str) -> Option<Arc<ResourceDef>> {
        self.resources
            .iter()
            .find(|r| r.route == route)
            .or_else(|| self.resources.iter().find(|r| r.name == route))
            .cloned()
    }

    pub fn resolve(&self, resource: impl Into<ResourceRef>) -> Result<Arc<ResourceDef>, SchemaError> {
        match resource.into() {
            ResourceRef::Handle(def) => Ok(def),
            ResourceRef::Name(name) => self.get(&name).ok_or(SchemaError::UnknownResource(name)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResourceDef>> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SchemaRegistryBuilder {
    custom_types: Vec<(String, Map<String, Value>)>,
    declarations: Vec<ResourceDeclaration>,
}

impl SchemaRegistryBuilder {
    /// Register a reusable nested type that schemas can reference by name.
    pub fn custom_type(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.custom_types
            .push((name.into(), schema.as_object().cloned().unwrap_or_default()));
        self
    }

    pub fn resource(mut self, declaration: ResourceDeclaration) -> Self {
        self.declarations.push(declaration);
        self
    }

    pub fn resources(mut self, declarations: impl IntoIterator<Item = ResourceDeclaration>) -> Self {
        self.declarations.extend(declarations);
        self
    }

    pub fn build(self) -> Result<SchemaRegistry, SchemaError> {
        let mut resource_names = HashSet::new();
        for declaration in &self.declarations {
            if !resource_names.insert(declaration.name.clone()) {
                return Err(SchemaError::DuplicateResource(declaration.name.clone()));
            }
        }

        let mut normalizer = Normalizer {
            resource_names: &resource_names,
            custom_types: HashMap::new(),
        };
        for (name, schema) in &self.custom_types {
            if normalizer.custom_types.contains_key(name) {
                return Err(SchemaError::DuplicateCustomType(name.clone()));
            }
            let fields = normalizer.fields(name, schema)?;
            normalizer.custom_types.insert(name.clone(), fields);
        }

        let mut defs = Vec::with_capacity(self.declarations.len());
        for declaration in &self.declarations {
            defs.push(normalizer.resource(declaration)?);
        }

        check_references(&mut defs)?;

        Ok(SchemaRegistry {
            resources: defs.into_iter().map(Arc::new).collect(),
        })
    }
}

struct Normalizer<'a> {
    resource_names: &'a HashSet<String>,
    custom_types: HashMap<String, Vec<FieldDef>>,
}

impl Normalizer<'_> {
    fn resource(&self, declaration: &ResourceDeclaration) -> Result<ResourceDef, SchemaError> {
        let name = &declaration.name;
        let options = &declaration.options;

        let mut schema = declaration.schema.clone();
        for key in RESERVED_KEYS {
            if schema.remove(key).is_some() {
                warn!("Resource '{}' uses reserved key '{}'; field dropped", name, key);
            }
        }

        let mut fields = self.fields(name, &schema)?;
        for (system_field, ty) in [(DELETED_AT, PrimitiveType::Date), (LINKS_BAG, PrimitiveType::Object)] {
            if !fields.iter().any(|f| f.name == system_field) {
                fields.push(FieldDef {
                    name: system_field.to_string(),
                    spec: FieldSpec::primitive(ty),
                    system: true,
                });
            }
        }

        let pk = options
            .pk
            .clone()
            .filter(|pk| pk != PHYSICAL_KEY && pk != "id");
        let key_type = match &pk {
            None => KeyType::ObjectId,
            Some(pk) => {
                let field = fields.iter().find(|f| &f.name == pk).ok_or_else(|| {
                    SchemaError::UnknownPrimaryKey {
                        resource: name.clone(),
                        pk: pk.clone(),
                    }
                })?;
                KeyType::Field(field.spec.primitive_type().unwrap_or(PrimitiveType::String))
            }
        };

        let references = fields
            .iter()
            .filter_map(|f| {
                f.spec.as_reference().map(|r| ReferenceDescriptor {
                    path: f.name.clone(),
                    target: r.target.clone(),
                    singular: r.cardinality == Cardinality::One,
                    inverse: r.inverse.clone(),
                    external: r.external,
                })
            })
            .collect();

        let mut def = ResourceDef {
            name: name.clone(),
            collection: options.model.clone().unwrap_or_else(|| name.clone()),
            route: options.plural.clone().unwrap_or_else(|| pluralize(name)),
            multitenant: fields.iter().any(|f| f.name == TENANT_FIELD),
            fields,
            pk,
            key_type,
            upsert_keys: Vec::new(),
            default_sort: options.default_sort.clone(),
            default_limit: options.default_limit,
            hooks_options: options.hooks.clone(),
            references,
        };

        let upsert_resolvable = options
            .upsert_keys
            .iter()
            .all(|key| key.split('.').count() <= MAX_UPSERT_DEPTH && def.has_path(key));
        if upsert_resolvable {
            def.upsert_keys = options.upsert_keys.clone();
        } else {
            warn!(
                "Resource '{}' declares upsert keys {:?} that do not resolve to schema paths; upsert disabled",
                name, options.upsert_keys
            );
        }

        Ok(def)
    }

    fn fields(&self, resource: &str, schema: &Map<String, Value>) -> Result<Vec<FieldDef>, SchemaError> {
        schema
            .iter()
            .map(|(field, raw)| {
                Ok(FieldDef {
                    name: field.clone(),
                    spec: self.spec(resource, field, raw)?,
                    system: false,
                })
            })
            .collect()
    }

    fn spec(&self, resource: &str, field: &str, raw: &Value) -> Result<FieldSpec, SchemaError> {
        let invalid = |reason: &str| SchemaError::InvalidField {
            resource: resource.to_string(),
            field: field.to_string(),
            reason: reason.to_string(),
        };

        match raw {
            Value::String(name) => Ok(self.named(name)),
            Value::Array(items) => {
                let [item] = items.as_slice() else {
                    return Err(invalid("array fields declare exactly one item spec"));
                };
                Ok(match self.spec(resource, field, item)? {
                    FieldSpec::Reference(reference) => FieldSpec::Reference(ReferenceSpec {
                        cardinality: Cardinality::Many,
                        ..reference
                    }),
                    other => FieldSpec::List {
                        item: Box::new(other),
                    },
                })
            }
            Value::Object(map) => {
                if let Some(target) = map.get("ref") {
                    let target = target.as_str().ok_or_else(|| invalid("'ref' must be a string"))?;
                    return Ok(FieldSpec::Reference(ReferenceSpec {
                        target: target.to_string(),
                        cardinality: Cardinality::One,
                        inverse: map.get("inverse").and_then(Value::as_str).map(str::to_string),
                        external: map.get("external").and_then(Value::as_bool).unwrap_or(false),
                        key_type: map
                            .get("type")
                            .and_then(Value::as_str)
                            .and_then(PrimitiveType::from_name),
                    }));
                }

                match map.get("type") {
                    Some(Value::String(type_name)) => {
                        let validation = match map.get("validation") {
                            Some(rules) => serde_json::from_value::<FieldValidation>(rules.clone())
                                .map_err(|e| invalid(&format!("invalid validation rules: {}", e)))?,
                            None => FieldValidation::default(),
                        };
                        match self.named(type_name) {
                            FieldSpec::Primitive { ty, .. } => Ok(FieldSpec::Primitive { ty, validation }),
                            FieldSpec::CustomType { .. } if !validation.is_empty() => {
                                Err(invalid("validation rules apply to primitive fields only"))
                            }
                            other => Ok(other),
                        }
                    }
                    Some(nested @ Value::Array(_)) => self.spec(resource, field, nested),
                    _ => Ok(FieldSpec::CustomType {
                        name: None,
                        fields: self.fields(resource, map)?,
                    }),
                }
            }
            _ => Err(invalid("unsupported field declaration")),
        }
    }

    /// A bare type name: primitive, then custom type, then resource reference.
    fn named(&self, name: &str) -> FieldSpec {
        if let Some(ty) = PrimitiveType::from_name(name) {
            return FieldSpec::primitive(ty);
        }
        if let Some(fields) = self.custom_types.get(name) {
            return FieldSpec::CustomType {
                name: Some(name.to_string()),
                fields: fields.clone(),
            };
        }
        if !self.resource_names.contains(name) {
            warn!("Type '{}' is neither a primitive nor a custom type; treating as a reference", name);
        }
        FieldSpec::Reference(ReferenceSpec {
            target: name.to_string(),
            cardinality: Cardinality::One,
            inverse: None,
            external: false,
            key_type: None,
        })
    }
}

/// Verify internal references and drop inverses that do not point back.
fn check_references(defs: &mut [ResourceDef]) -> Result<(), SchemaError> {
    let lookup: HashMap<String, Vec<(String, String)>> = defs
        .iter()
        .map(|def| {
            let refs = def
                .references
                .iter()
                .map(|r| (r.path.clone(), r.target.clone()))
                .collect();
            (def.name.clone(), refs)
        })
        .collect();

    for def in defs.iter_mut() {
        let resource = def.name.clone();
        for reference in def.references.iter_mut().filter(|r| !r.external) {
            let Some(target_refs) = lookup.get(&reference.target) else {
                return Err(SchemaError::UnknownReference {
                    resource,
                    field: reference.path.clone(),
                    target: reference.target.clone(),
                });
            };
            if let Some(inverse) = &reference.inverse {
                let points_back = target_refs
                    .iter()
                    .any(|(path, target)| path == inverse && target == &resource);
                if !points_back {
                    warn!(
                        "Inverse '{}.{}' of '{}.{}' does not reference '{}'; inverse maintenance disabled",
                        reference.target, inverse, resource, reference.path, resource
                    );
                    reference.inverse = None;
                }
            }
        }
    }
    Ok(())
}

/// English plural used for collection routes.
pub fn pluralize(name: &str) -> String {
    const IRREGULAR: [(&str, &str); 5] = [
        ("person", "people"),
        ("child", "children"),
        ("man", "men"),
        ("woman", "women"),
        ("mouse", "mice"),
    ];
    if let Some((_, plural)) = IRREGULAR.iter().find(|(singular, _)| *singular == name) {
        return plural.to_string();
    }
    if ["s", "x", "z", "ch", "sh"].iter().any(|suffix| name.ends_with(suffix)) {
        return format!("{}es", name);
    }
    if let Some(stem) = name.strip_suffix('y') {
        if !stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            return format!("{}ies", stem);
        }
    }
    format!("{}s", name)
}
