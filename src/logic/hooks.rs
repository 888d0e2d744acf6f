//! Ordered, cancelable transform chains around reads, writes and responses.
//!
//! Hooks are registered once against a stage and kind, either for every
//! resource, for one resource, or for a custom type. `HookRegistry::compose`
//! resolves them into immutable per-resource chains: custom-type hooks of the
//! embedded fields first, then global hooks, then resource hooks, each group
//! sorted by descending priority with ties kept in registration order.
//!
//! A custom-type hook sees only the embedded value at its field (every item
//! of a list field) and its result is written back into the document.

use axum::http::{HeaderMap, Method};
use futures_util::future::join_all;
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error as ThisError;

use crate::error::ResourceError;
use crate::model::{is_truthy, ResourceDef, SchemaRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HookStage {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HookKind {
    Read,
    Write,
    Response,
    ErrorResponse,
}

/// Result of one transform: keep going with a value, or cancel the operation.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    Continue(Value),
    Abort,
}

#[derive(Debug, ThisError)]
pub enum HookError {
    /// A field-level rule rejected the value; surfaces as a client error.
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<HookError> for ResourceError {
    fn from(error: HookError) -> Self {
        match error {
            HookError::Validation(message) => ResourceError::Validation(message),
            HookError::Failed(error) => ResourceError::Hook(format!("{:#}", error)),
        }
    }
}

pub type HookResult = Result<HookOutcome, HookError>;

/// The HTTP request a hook chain runs on behalf of.
#[derive(Debug, Default)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: Value,
    pub headers: HeaderMap,
    /// Headers hooks want added to the response.
    pub response_headers: Mutex<HeaderMap>,
}

impl RequestContext {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, query: Value) -> Self {
        self.query = query;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// What a transform sees besides the value it transforms.
pub struct HookContext {
    pub resource: Arc<ResourceDef>,
    pub stage: HookStage,
    pub kind: HookKind,
    /// Effective configuration of the hook for this resource.
    pub config: Map<String, Value>,
    pub request: Arc<RequestContext>,
}

#[async_trait::async_trait]
pub trait Transform: Send + Sync {
    async fn apply(&self, value: Value, context: &HookContext) -> HookResult;
}

struct FnTransform<F>(F);

#[async_trait::async_trait]
impl<F> Transform for FnTransform<F>
where
    F: Fn(Value, &HookContext) -> HookResult + Send + Sync,
{
    async fn apply(&self, value: Value, context: &HookContext) -> HookResult {
        (self.0)(value, context)
    }
}

/// Wrap a synchronous closure as a transform.
pub fn transform_fn<F>(f: F) -> Arc<dyn Transform>
where
    F: Fn(Value, &HookContext) -> HookResult + Send + Sync + 'static,
{
    Arc::new(FnTransform(f))
}

pub type HookInit = Arc<dyn Fn(&Map<String, Value>) -> Arc<dyn Transform> + Send + Sync>;

/// A named hook: default configuration plus a constructor for its transform.
#[derive(Clone)]
pub struct HookDefinition {
    pub name: String,
    pub priority: i32,
    pub config: Map<String, Value>,
    pub init: HookInit,
}

impl HookDefinition {
    pub fn new<F>(name: impl Into<String>, init: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Arc<dyn Transform> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            priority: 0,
            config: Map::new(),
            init: Arc::new(init),
        }
    }

    /// A hook whose transform does not depend on configuration.
    pub fn from_transform(name: impl Into<String>, transform: Arc<dyn Transform>) -> Self {
        Self::new(name, move |_| transform.clone())
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        if let Value::Object(config) = config {
            self.config = config;
        }
        self
    }
}

impl std::fmt::Debug for HookDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookDefinition")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookScope {
    All,
    Resource(String),
    /// Every resource field embedding the named custom type.
    CustomType(String),
}

#[derive(Debug, Clone)]
struct Registration {
    stage: HookStage,
    kind: HookKind,
    scope: HookScope,
    definition: HookDefinition,
    options: Map<String, Value>,
}

/// Mutable collection of hook registrations, composed into chains at startup.
#[derive(Debug, Default)]
pub struct HookRegistry {
    registrations: Vec<Registration>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        stage: HookStage,
        kind: HookKind,
        scope: HookScope,
        definition: HookDefinition,
        options: Value,
    ) -> &mut Self {
        self.registrations.push(Registration {
            stage,
            kind,
            scope,
            definition,
            options: match options {
                Value::Object(options) => options,
                _ => Map::new(),
            },
        });
        self
    }

    /// Register for every resource.
    pub fn register_all(&mut self, stage: HookStage, kind: HookKind, definition: HookDefinition) -> &mut Self {
        self.register(stage, kind, HookScope::All, definition, Value::Null)
    }

    /// Register for one resource.
    pub fn register_for(
        &mut self,
        resource: &str,
        stage: HookStage,
        kind: HookKind,
        definition: HookDefinition,
    ) -> &mut Self {
        self.register(stage, kind, HookScope::Resource(resource.to_string()), definition, Value::Null)
    }

    /// Register for every field of the named custom type.
    pub fn register_for_type(
        &mut self,
        custom_type: &str,
        stage: HookStage,
        kind: HookKind,
        definition: HookDefinition,
    ) -> &mut Self {
        self.register(stage, kind, HookScope::CustomType(custom_type.to_string()), definition, Value::Null)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Build the immutable chains for every resource in `schemas`.
    pub fn compose(&self, schemas: &SchemaRegistry) -> HookChains {
        let mut chains = HashMap::new();
        for def in schemas.iter() {
            for stage in [HookStage::Before, HookStage::After] {
                for kind in [HookKind::Read, HookKind::Write, HookKind::Response, HookKind::ErrorResponse] {
                    let chain = self.compose_chain(def, stage, kind);
                    if !chain.is_empty() {
                        chains.insert((def.name.clone(), stage, kind), chain);
                    }
                }
            }
        }
        HookChains { chains }
    }

    /// Registrations for one stage and kind in `scope`, by descending priority.
    fn selected(&self, stage: HookStage, kind: HookKind, scope: impl Fn(&HookScope) -> bool) -> Vec<&Registration> {
        let mut selected: Vec<&Registration> = self
            .registrations
            .iter()
            .filter(|r| r.stage == stage && r.kind == kind && scope(&r.scope))
            .collect();
        // Stable, so equal priorities keep registration order
        selected.sort_by(|a, b| b.definition.priority.cmp(&a.definition.priority));
        selected
    }

    fn compose_chain(&self, def: &ResourceDef, stage: HookStage, kind: HookKind) -> Vec<ComposedHook> {
        let embedded = self
            .selected(stage, kind, |scope| matches!(scope, HookScope::CustomType(_)))
            .into_iter()
            .flat_map(|registration| {
                let HookScope::CustomType(type_name) = &registration.scope else {
                    return Vec::new();
                };
                def.custom_type_paths(type_name)
                    .into_iter()
                    .filter_map(|path| {
                        let hook = compose_hook(def, registration)?;
                        Some(ComposedHook {
                            name: format!("{}-{}-{}", type_name, hook.name, path),
                            transform: Arc::new(FieldTransform {
                                path,
                                inner: hook.transform,
                            }),
                            ..hook
                        })
                    })
                    .collect()
            });
        let global = self
            .selected(stage, kind, |scope| *scope == HookScope::All)
            .into_iter()
            .filter_map(|registration| compose_hook(def, registration));
        let own = self
            .selected(stage, kind, |scope| matches!(scope, HookScope::Resource(name) if name == &def.name))
            .into_iter()
            .filter_map(|registration| compose_hook(def, registration));

        embedded.chain(global).chain(own).collect()
    }
}

/// Resolve the effective config of one registration; `None` when disabled.
fn compose_hook(def: &ResourceDef, registration: &Registration) -> Option<ComposedHook> {
    let mut config = registration.definition.config.clone();
    config.extend(registration.options.clone());
    if let Some(resource_options) = def.hook_options(&registration.definition.name) {
        config.extend(resource_options.clone());
    }
    if config.get("disable").is_some_and(is_truthy) {
        debug!(
            "Hook '{}' disabled for {}",
            registration.definition.name, def.name
        );
        return None;
    }
    let transform = (registration.definition.init)(&config);
    Some(ComposedHook {
        name: registration.definition.name.clone(),
        priority: registration.definition.priority,
        config,
        transform,
    })
}

/// Applies a transform to the custom-type value embedded at `path`.
struct FieldTransform {
    path: String,
    inner: Arc<dyn Transform>,
}

#[async_trait::async_trait]
impl Transform for FieldTransform {
    async fn apply(&self, mut value: Value, context: &HookContext) -> HookResult {
        let Some(embedded) = embedded_slot(&mut value, &self.path).map(Value::take) else {
            return Ok(HookOutcome::Continue(value));
        };

        let transformed = match embedded {
            Value::Null => Value::Null,
            Value::Array(items) => {
                let mut transformed = Vec::with_capacity(items.len());
                for item in items {
                    match self.inner.apply(item, context).await? {
                        HookOutcome::Continue(item) => transformed.push(item),
                        HookOutcome::Abort => return Ok(HookOutcome::Abort),
                    }
                }
                Value::Array(transformed)
            }
            single => match self.inner.apply(single, context).await? {
                HookOutcome::Continue(single) => single,
                HookOutcome::Abort => return Ok(HookOutcome::Abort),
            },
        };

        if let Some(slot) = embedded_slot(&mut value, &self.path) {
            *slot = transformed;
        }
        Ok(HookOutcome::Continue(value))
    }
}

/// The field inside a document, or inside the `$set` of an update command.
fn embedded_slot<'v>(value: &'v mut Value, path: &str) -> Option<&'v mut Value> {
    let map = value.as_object_mut()?;
    if map.contains_key(path) {
        return map.get_mut(path);
    }
    map.get_mut("$set")?.as_object_mut()?.get_mut(path)
}

pub struct ComposedHook {
    pub name: String,
    pub priority: i32,
    pub config: Map<String, Value>,
    transform: Arc<dyn Transform>,
}

/// Per-resource chains keyed by stage and kind.
#[derive(Default)]
pub struct HookChains {
    chains: HashMap<(String, HookStage, HookKind), Vec<ComposedHook>>,
}

impl HookChains {
    pub fn chain(&self, resource: &str, stage: HookStage, kind: HookKind) -> &[ComposedHook] {
        self.chains
            .get(&(resource.to_string(), stage, kind))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Hook names in execution order.
    pub fn names(&self, resource: &str, stage: HookStage, kind: HookKind) -> Vec<String> {
        self.chain(resource, stage, kind)
            .iter()
            .map(|hook| hook.name.clone())
            .collect()
    }

    /// Run one chain sequentially; the first `Abort` stops it.
    pub async fn run(
        &self,
        def: &Arc<ResourceDef>,
        stage: HookStage,
        kind: HookKind,
        value: Value,
        request: &Arc<RequestContext>,
    ) -> HookResult {
        let mut current = value;
        for hook in self.chain(&def.name, stage, kind) {
            let context = HookContext {
                resource: def.clone(),
                stage,
                kind,
                config: hook.config.clone(),
                request: request.clone(),
            };
            match hook.transform.apply(current, &context).await? {
                HookOutcome::Continue(next) => current = next,
                HookOutcome::Abort => {
                    debug!("Hook '{}' aborted {:?} {:?} on {}", hook.name, stage, kind, def.name);
                    return Ok(HookOutcome::Abort);
                }
            }
        }
        Ok(HookOutcome::Continue(current))
    }

    /// Run the chain over every value concurrently, sequential within each.
    pub async fn run_each(
        &self,
        def: &Arc<ResourceDef>,
        stage: HookStage,
        kind: HookKind,
        values: Vec<Value>,
        request: &Arc<RequestContext>,
    ) -> Vec<HookResult> {
        join_all(
            values
                .into_iter()
                .map(|value| self.run(def, stage, kind, value, request)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceDeclaration, ResourceOptions};
    use serde_json::json;

    fn schemas(hooks: Value) -> SchemaRegistry {
        SchemaRegistry::builder()
            .resource(ResourceDeclaration::new(
                "person",
                json!({"name": "string"}),
                ResourceOptions {
                    hooks: hooks.as_object().cloned().unwrap_or_default(),
                    ..Default::default()
                },
            ))
            .resource(ResourceDeclaration::new("pet", json!({"name": "string"}), ResourceOptions::default()))
            .build()
            .unwrap()
    }

    fn append(name: &str, priority: i32) -> HookDefinition {
        let suffix = name.to_string();
        HookDefinition::from_transform(
            name,
            transform_fn(move |value, _| {
                let mut trail = value.as_str().unwrap_or_default().to_string();
                trail.push_str(&suffix);
                Ok(HookOutcome::Continue(Value::String(trail)))
            }),
        )
        .with_priority(priority)
    }

    fn request() -> Arc<RequestContext> {
        Arc::new(RequestContext::new(Method::GET, "/people"))
    }

    #[test]
    fn test_chain_order_global_then_resource_by_priority() {
        let mut registry = HookRegistry::new();
        registry
            .register_for("person", HookStage::Before, HookKind::Write, append("r1", 1))
            .register_all(HookStage::Before, HookKind::Write, append("g1", 1))
            .register_for("person", HookStage::Before, HookKind::Write, append("r2", 5))
            .register_all(HookStage::Before, HookKind::Write, append("g2", 10))
            .register_all(HookStage::Before, HookKind::Write, append("g3", 1));

        let chains = registry.compose(&schemas(Value::Null));
        assert_eq!(
            chains.names("person", HookStage::Before, HookKind::Write),
            vec!["g2", "g1", "g3", "r2", "r1"]
        );
        assert_eq!(
            chains.names("pet", HookStage::Before, HookKind::Write),
            vec!["g2", "g1", "g3"]
        );
        assert!(chains.names("pet", HookStage::After, HookKind::Write).is_empty());
    }

    #[test]
    fn test_disabled_hooks_are_excluded_at_composition() {
        let mut registry = HookRegistry::new();
        registry
            .register_all(HookStage::Before, HookKind::Read, append("audit", 0))
            .register_all(HookStage::Before, HookKind::Read, append("scope", 0));

        let chains = registry.compose(&schemas(json!({"audit": {"disable": true}})));
        assert_eq!(chains.names("person", HookStage::Before, HookKind::Read), vec!["scope"]);
        assert_eq!(chains.names("pet", HookStage::Before, HookKind::Read), vec!["audit", "scope"]);
    }

    #[test]
    fn test_effective_config_layers_defaults_inline_and_resource() {
        let definition = HookDefinition::new("stamp", |config| {
            let config = config.clone();
            transform_fn(move |_, _| Ok(HookOutcome::Continue(Value::Object(config.clone()))))
        })
        .with_config(json!({"a": 1, "b": 1, "c": 1}));

        let mut registry = HookRegistry::new();
        registry.register(
            HookStage::After,
            HookKind::Read,
            HookScope::All,
            definition,
            json!({"b": 2, "c": 2}),
        );
        let chains = registry.compose(&schemas(json!({"stamp": {"c": 3}})));
        let hook = &chains.chain("person", HookStage::After, HookKind::Read)[0];
        assert_eq!(Value::Object(hook.config.clone()), json!({"a": 1, "b": 2, "c": 3}));
    }

    #[tokio::test]
    async fn test_run_threads_values_and_stops_on_abort() {
        let mut registry = HookRegistry::new();
        registry
            .register_all(HookStage::Before, HookKind::Write, append("a", 3))
            .register_all(HookStage::Before, HookKind::Write, append("b", 2))
            .register_for(
                "pet",
                HookStage::Before,
                HookKind::Write,
                HookDefinition::from_transform("stop", transform_fn(|_, _| Ok(HookOutcome::Abort))),
            )
            .register_for("pet", HookStage::Before, HookKind::Write, append("never", -1));

        let schemas = schemas(Value::Null);
        let chains = registry.compose(&schemas);
        let person = schemas.get("person").unwrap();
        let pet = schemas.get("pet").unwrap();

        let outcome = chains
            .run(&person, HookStage::Before, HookKind::Write, json!(">"), &request())
            .await
            .unwrap();
        assert_eq!(outcome, HookOutcome::Continue(json!(">ab")));

        let outcome = chains
            .run(&pet, HookStage::Before, HookKind::Write, json!(">"), &request())
            .await
            .unwrap();
        assert_eq!(outcome, HookOutcome::Abort);
    }

    fn upper_city() -> HookDefinition {
        HookDefinition::from_transform(
            "upper",
            transform_fn(|mut value, _| {
                if let Some(city) = value.get_mut("city") {
                    if let Some(upper) = city.as_str().map(str::to_uppercase) {
                        *city = Value::String(upper);
                    }
                }
                Ok(HookOutcome::Continue(value))
            }),
        )
    }

    #[tokio::test]
    async fn test_custom_type_hooks_apply_to_embedding_fields() {
        let schemas = SchemaRegistry::builder()
            .custom_type("address", json!({"city": "string"}))
            .resource(ResourceDeclaration::new(
                "person",
                json!({"name": "string", "home": "address", "past": ["address"]}),
                ResourceOptions::default(),
            ))
            .resource(ResourceDeclaration::new("pet", json!({"name": "string"}), ResourceOptions::default()))
            .build()
            .unwrap();

        let mut registry = HookRegistry::new();
        registry
            .register_for("person", HookStage::Before, HookKind::Write, append("own", 0))
            .register_for_type("address", HookStage::Before, HookKind::Write, upper_city());
        let chains = registry.compose(&schemas);
        assert_eq!(
            chains.names("person", HookStage::Before, HookKind::Write),
            vec!["address-upper-home", "address-upper-past", "own"]
        );
        assert!(chains.names("pet", HookStage::Before, HookKind::Write).is_empty());

        let mut registry = HookRegistry::new();
        registry.register_for_type("address", HookStage::Before, HookKind::Write, upper_city());
        let chains = registry.compose(&schemas);
        let person = schemas.get("person").unwrap();

        let outcome = chains
            .run(
                &person,
                HookStage::Before,
                HookKind::Write,
                json!({"name": "a", "home": {"city": "oslo"}, "past": [{"city": "rome"}, {"city": "lima"}]}),
                &request(),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            HookOutcome::Continue(json!({"name": "a", "home": {"city": "OSLO"}, "past": [{"city": "ROME"}, {"city": "LIMA"}]}))
        );

        let outcome = chains
            .run(&person, HookStage::Before, HookKind::Write, json!({"$set": {"home": {"city": "bern"}}}), &request())
            .await
            .unwrap();
        assert_eq!(outcome, HookOutcome::Continue(json!({"$set": {"home": {"city": "BERN"}}})));

        let outcome = chains
            .run(&person, HookStage::Before, HookKind::Write, json!({"name": "b"}), &request())
            .await
            .unwrap();
        assert_eq!(outcome, HookOutcome::Continue(json!({"name": "b"})));
    }

    #[tokio::test]
    async fn test_validation_errors_map_to_client_errors() {
        let mut registry = HookRegistry::new();
        registry.register_all(
            HookStage::Before,
            HookKind::Write,
            HookDefinition::from_transform(
                "reject",
                transform_fn(|_, _| Err(HookError::Validation("name is required".into()))),
            ),
        );
        let schemas = schemas(Value::Null);
        let chains = registry.compose(&schemas);
        let person = schemas.get("person").unwrap();

        let results = chains
            .run_each(&person, HookStage::Before, HookKind::Write, vec![json!({}), json!({})], &request())
            .await;
        assert_eq!(results.len(), 2);
        for result in results {
            let error: ResourceError = result.unwrap_err().into();
            assert!(matches!(error, ResourceError::Validation(_)));
        }

        let failed: ResourceError = HookError::Failed(anyhow::anyhow!("boom")).into();
        assert!(matches!(failed, ResourceError::Hook(_)));
    }
}
