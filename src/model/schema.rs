use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::common::{Id, PHYSICAL_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    String,
    Number,
    Boolean,
    Date,
    Binary,
    Object,
}

impl PrimitiveType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            "date" => Some(Self::Date),
            "binary" | "buffer" => Some(Self::Binary),
            "object" | "mixed" => Some(Self::Object),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceSpec {
    pub target: String,
    pub cardinality: Cardinality,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inverse: Option<String>,
    pub external: bool,
    /// Primary-key type of the target resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_type: Option<PrimitiveType>,
}

/// Per-field validation rules checked before writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldValidation {
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
}

impl FieldValidation {
    pub fn is_empty(&self) -> bool {
        self == &FieldValidation::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FieldSpec {
    Primitive {
        #[serde(rename = "type")]
        ty: PrimitiveType,
        #[serde(skip_serializing_if = "FieldValidation::is_empty")]
        validation: FieldValidation,
    },
    Reference(ReferenceSpec),
    CustomType {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        fields: Vec<FieldDef>,
    },
    List {
        item: Box<FieldSpec>,
    },
}

impl FieldSpec {
    pub fn primitive(ty: PrimitiveType) -> Self {
        FieldSpec::Primitive {
            ty,
            validation: FieldValidation::default(),
        }
    }

    pub fn as_reference(&self) -> Option<&ReferenceSpec> {
        match self {
            FieldSpec::Reference(reference) => Some(reference),
            _ => None,
        }
    }

    pub fn primitive_type(&self) -> Option<PrimitiveType> {
        match self {
            FieldSpec::Primitive { ty, .. } => Some(*ty),
            _ => None,
        }
    }

    pub fn validation(&self) -> Option<&FieldValidation> {
        match self {
            FieldSpec::Primitive { validation, .. } if !validation.is_empty() => Some(validation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDef {
    pub name: String,
    pub spec: FieldSpec,
    /// Injected by the registry rather than declared.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub system: bool,
}

/// A relationship field, derived once from the schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceDescriptor {
    pub path: String,
    pub target: String,
    pub singular: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inverse: Option<String>,
    pub external: bool,
}

impl ReferenceDescriptor {
    /// Whether inverse maintenance applies to this reference.
    pub fn is_maintained(&self) -> bool {
        self.inverse.is_some() && !self.external
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyType {
    ObjectId,
    Field(PrimitiveType),
}

/// Declared resource options.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceOptions {
    pub pk: Option<String>,
    pub upsert_keys: Vec<String>,
    pub default_sort: Option<String>,
    pub default_limit: Option<usize>,
    pub plural: Option<String>,
    pub model: Option<String>,
    pub hooks: Map<String, Value>,
}

/// A registered, normalized resource schema.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDef {
    pub name: String,
    pub collection: String,
    pub route: String,
    pub fields: Vec<FieldDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pk: Option<String>,
    pub key_type: KeyType,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub upsert_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_sort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_limit: Option<usize>,
    #[serde(skip)]
    pub hooks_options: Map<String, Value>,
    pub multitenant: bool,
    pub references: Vec<ReferenceDescriptor>,
}

impl ResourceDef {
    /// Field holding the logical id in storage.
    pub fn pk_field(&self) -> &str {
        self.pk.as_deref().unwrap_or(PHYSICAL_KEY)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Resolve a dot path through nested custom types.
    pub fn field_at_path(&self, path: &str) -> Option<&FieldSpec> {
        let mut segments = path.split('.');
        let mut spec = &self.field(segments.next()?)?.spec;
        for segment in segments {
            spec = match spec {
                FieldSpec::CustomType { fields, .. } => {
                    &fields.iter().find(|f| f.name == segment)?.spec
                }
                FieldSpec::Primitive {
                    ty: PrimitiveType::Object,
                    ..
                } => return Some(spec),
                _ => return None,
            };
        }
        Some(spec)
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.field_at_path(path).is_some()
    }

    pub fn primitive_type_at(&self, path: &str) -> Option<PrimitiveType> {
        self.field_at_path(path).and_then(FieldSpec::primitive_type)
    }

    pub fn reference(&self, path: &str) -> Option<&ReferenceDescriptor> {
        self.references.iter().find(|r| r.path == path)
    }

    pub fn is_reference(&self, path: &str) -> bool {
        self.reference(path).is_some()
    }

    /// References whose inverse side must be kept consistent.
    pub fn maintained_references(&self) -> impl Iterator<Item = &ReferenceDescriptor> {
        self.references.iter().filter(|r| r.is_maintained())
    }

    /// Read the logical id of a stored document.
    pub fn id_of(&self, document: &crate::model::Document) -> Option<Id> {
        document.get(self.pk_field()).and_then(|value| match value {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
    }

    /// Top-level fields embedding the named custom type, directly or as a list.
    pub fn custom_type_paths(&self, type_name: &str) -> Vec<String> {
        let embeds = |spec: &FieldSpec| matches!(spec, FieldSpec::CustomType { name: Some(n), .. } if n == type_name);
        self.fields
            .iter()
            .filter(|field| match &field.spec {
                FieldSpec::List { item } => embeds(item),
                spec => embeds(spec),
            })
            .map(|field| field.name.clone())
            .collect()
    }

    /// Options for a named hook on this resource, if any.
    pub fn hook_options(&self, hook: &str) -> Option<&Map<String, Value>> {
        self.hooks_options.get(hook).and_then(Value::as_object)
    }
}
