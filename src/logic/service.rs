use futures_util::future::join_all;
use log::debug;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{ResourceError, ResourceResult};
use crate::logic::hooks::{HookChains, HookKind, HookOutcome, HookStage, RequestContext};
use crate::logic::patch::update_from_patch;
use crate::logic::query_tree::{QueryTree, ResourceReader};
use crate::model::{id_values, QueryOptions, ResourceDef, ResourceRef, UpdateCommand};
use crate::store::adapter::StorageAdapter;
use crate::store::traits::DocumentStore;

/// Documents returned by a read, plus the total when it was requested.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub items: Vec<Value>,
    pub count: Option<u64>,
}

/// Outcome of a PUT: the stored document and whether it had to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct Replaced {
    pub document: Value,
    pub created: bool,
}

/// Orchestrates hooks, query resolution, storage and relationship repair
/// for every resource operation.
pub struct ResourceService<S: DocumentStore> {
    adapter: StorageAdapter<S>,
    hooks: HookChains,
}

impl<S: DocumentStore> ResourceService<S> {
    pub fn new(adapter: StorageAdapter<S>, hooks: HookChains) -> Self {
        Self { adapter, hooks }
    }

    pub fn adapter(&self) -> &StorageAdapter<S> {
        &self.adapter
    }

    pub fn hooks(&self) -> &HookChains {
        &self.hooks
    }

    pub fn resolve(&self, resource: impl Into<ResourceRef>) -> ResourceResult<Arc<ResourceDef>> {
        Ok(self.adapter.registry().resolve(resource)?)
    }

    /// Look a resource up by its route segment.
    pub fn by_route(&self, route: &str) -> ResourceResult<Arc<ResourceDef>> {
        self.adapter
            .registry()
            .by_route(route)
            .ok_or_else(|| ResourceError::not_found("resource", format!("no resource is served at /{}", route)))
    }

    /// Every registered resource definition.
    pub fn describe(&self) -> Value {
        Value::Array(
            self.adapter
                .registry()
                .iter()
                .map(|def| serde_json::to_value(def.as_ref()).unwrap_or(Value::Null))
                .collect(),
        )
    }

    pub async fn list(
        &self,
        def: &Arc<ResourceDef>,
        filter: Value,
        options: &QueryOptions,
        request: &Arc<RequestContext>,
    ) -> ResourceResult<Listing> {
        let filter = self.before(def, HookKind::Read, filter, request).await?;
        let reader = ScopedReader { service: self, request };
        let filter = QueryTree::new(self.adapter.registry(), &reader)
            .resolve(def.clone(), filter)
            .await?;

        let documents = self.adapter.find_many(def, &filter, options).await?;
        let items = self.after_each(def, HookKind::Read, documents, request).await?;
        let count = if options.count {
            Some(self.adapter.count(def, &filter, options.include_deleted).await?)
        } else {
            None
        };
        Ok(Listing { items, count })
    }

    /// Documents with the given ids; `NotFound` when none match.
    pub async fn get_by_ids(
        &self,
        def: &Arc<ResourceDef>,
        ids: &[String],
        options: &QueryOptions,
        request: &Arc<RequestContext>,
    ) -> ResourceResult<Listing> {
        let listing = self.list(def, ids_filter(ids), options, request).await?;
        if listing.items.is_empty() {
            return Err(ResourceError::not_found(&def.name, ids.join(",")));
        }
        Ok(listing)
    }

    /// Documents of the target resource linked from `field` of one document.
    pub async fn get_related(
        &self,
        def: &Arc<ResourceDef>,
        id: &str,
        field: &str,
        options: &QueryOptions,
        request: &Arc<RequestContext>,
    ) -> ResourceResult<Listing> {
        let reference = def
            .reference(field)
            .ok_or_else(|| ResourceError::not_found(&def.name, format!("no relationship named '{}'", field)))?;
        if reference.external {
            return Err(ResourceError::BadRequest(format!(
                "'{}.{}' references an external resource",
                def.name, field
            )));
        }
        let target = self.resolve(reference.target.as_str())?;

        let owner = self
            .get_by_ids(def, &[id.to_string()], &QueryOptions::default(), request)
            .await?;
        let ids: Vec<String> = owner
            .items
            .first()
            .map(|item| id_values(item.get("links").and_then(|links| links.get(field))))
            .unwrap_or_default()
            .into_iter()
            .map(|id| match id {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();
        if ids.is_empty() {
            return Ok(Listing {
                items: Vec::new(),
                count: options.count.then_some(0),
            });
        }
        self.list(&target, ids_filter(&ids), options, request).await
    }

    /// Create every document concurrently; each carries its own outcome.
    pub async fn create_many(
        &self,
        def: &Arc<ResourceDef>,
        documents: Vec<Value>,
        request: &Arc<RequestContext>,
    ) -> Vec<ResourceResult<Value>> {
        join_all(
            documents
                .into_iter()
                .map(|document| self.create_one(def, document, request)),
        )
        .await
    }

    async fn create_one(
        &self,
        def: &Arc<ResourceDef>,
        document: Value,
        request: &Arc<RequestContext>,
    ) -> ResourceResult<Value> {
        let document = self.before(def, HookKind::Write, document, request).await?;
        let created = self.adapter.create(def, None, &document).await?;
        self.after(def, HookKind::Write, created, request).await
    }

    /// Update the document if it exists, otherwise create it under `id`.
    pub async fn replace(
        &self,
        def: &Arc<ResourceDef>,
        id: &str,
        document: Value,
        request: &Arc<RequestContext>,
    ) -> ResourceResult<Replaced> {
        let document = self.before(def, HookKind::Write, document, request).await?;
        let key = Value::String(id.to_string());
        let command = UpdateCommand::from_value(&document)?;

        let (stored, created) = match self.adapter.update(def, &key, command).await {
            Ok(updated) => (updated, false),
            Err(ResourceError::NotFound { .. }) => {
                debug!("{} {} not found, creating it", def.name, id);
                (self.adapter.create(def, Some(&key), &document).await?, true)
            }
            Err(error) => return Err(error),
        };
        let document = self.after(def, HookKind::Write, stored, request).await?;
        Ok(Replaced { document, created })
    }

    pub async fn patch(
        &self,
        def: &Arc<ResourceDef>,
        id: &str,
        body: &Value,
        request: &Arc<RequestContext>,
    ) -> ResourceResult<Value> {
        let command = update_from_patch(&def.route, body)?;
        let update = self
            .before(def, HookKind::Write, command.to_value(), request)
            .await?;
        let command = UpdateCommand::from_value(&update)?;
        let updated = self
            .adapter
            .update(def, &Value::String(id.to_string()), command)
            .await?;
        self.after(def, HookKind::Write, updated, request).await
    }

    /// Soft-delete, or physically remove with `destroy`, the given ids.
    pub async fn delete_by_ids(
        &self,
        def: &Arc<ResourceDef>,
        ids: &[String],
        destroy: bool,
        request: &Arc<RequestContext>,
    ) -> ResourceResult<Vec<Value>> {
        let filter = Value::Array(ids.iter().cloned().map(Value::String).collect());
        let removed = self.delete_matching(def, &filter, destroy, request).await?;
        if removed.is_empty() {
            return Err(ResourceError::not_found(&def.name, ids.join(",")));
        }
        Ok(removed)
    }

    /// Delete everything matching `filter`; a null filter matches all.
    pub async fn delete_all(
        &self,
        def: &Arc<ResourceDef>,
        filter: &Value,
        destroy: bool,
        request: &Arc<RequestContext>,
    ) -> ResourceResult<Vec<Value>> {
        self.delete_matching(def, filter, destroy, request).await
    }

    /// Every matched document passes the before-write chain before anything
    /// is removed, and every removed one passes the after-write chain.
    async fn delete_matching(
        &self,
        def: &Arc<ResourceDef>,
        filter: &Value,
        destroy: bool,
        request: &Arc<RequestContext>,
    ) -> ResourceResult<Vec<Value>> {
        let mut options = QueryOptions::with_limit(0);
        options.include_deleted = destroy;
        let matched = self.adapter.find_many(def, filter, &options).await?;
        if matched.is_empty() {
            return Ok(Vec::new());
        }

        let outcomes = self
            .hooks
            .run_each(def, HookStage::Before, HookKind::Write, matched, request)
            .await;
        for outcome in outcomes {
            if outcome? == HookOutcome::Abort {
                return Err(ResourceError::Aborted);
            }
        }

        let removed = if destroy {
            self.adapter.delete(def, filter).await?
        } else {
            self.adapter.mark_deleted(def, filter).await?
        };
        debug!("Deleted {} {} document(s), destroy={}", removed.len(), def.name, destroy);
        self.after_each(def, HookKind::Write, removed, request).await
    }

    pub async fn count(&self, def: &Arc<ResourceDef>, filter: &Value, include_deleted: bool) -> ResourceResult<u64> {
        self.adapter.count(def, filter, include_deleted).await
    }

    /// Run a before chain; an abort becomes `ResourceError::Aborted`.
    pub async fn before(
        &self,
        def: &Arc<ResourceDef>,
        kind: HookKind,
        value: Value,
        request: &Arc<RequestContext>,
    ) -> ResourceResult<Value> {
        match self.hooks.run(def, HookStage::Before, kind, value, request).await? {
            HookOutcome::Continue(value) => Ok(value),
            HookOutcome::Abort => Err(ResourceError::Aborted),
        }
    }

    pub async fn after(
        &self,
        def: &Arc<ResourceDef>,
        kind: HookKind,
        value: Value,
        request: &Arc<RequestContext>,
    ) -> ResourceResult<Value> {
        match self.hooks.run(def, HookStage::After, kind, value, request).await? {
            HookOutcome::Continue(value) => Ok(value),
            HookOutcome::Abort => Err(ResourceError::Aborted),
        }
    }

    async fn after_each(
        &self,
        def: &Arc<ResourceDef>,
        kind: HookKind,
        values: Vec<Value>,
        request: &Arc<RequestContext>,
    ) -> ResourceResult<Vec<Value>> {
        self.hooks
            .run_each(def, HookStage::After, kind, values, request)
            .await
            .into_iter()
            .map(|outcome| match outcome? {
                HookOutcome::Continue(value) => Ok(value),
                HookOutcome::Abort => Err(ResourceError::Aborted),
            })
            .collect()
    }
}

fn ids_filter(ids: &[String]) -> Value {
    match ids {
        [id] => json!({ "id": id }),
        _ => json!({ "id": { "$in": ids } }),
    }
}

/// Sub-reads issued while resolving a filter, on behalf of one request.
struct ScopedReader<'a, S: DocumentStore> {
    service: &'a ResourceService<S>,
    request: &'a Arc<RequestContext>,
}

#[async_trait::async_trait]
impl<'a, S: DocumentStore> ResourceReader for ScopedReader<'a, S> {
    async fn read_ids(&self, def: &Arc<ResourceDef>, filter: Value) -> ResourceResult<Vec<Value>> {
        // A zero limit lifts the resource default
        let options = QueryOptions::with_limit(0).select(["id"]);
        let listing = self.service.list(def, filter, &options, self.request).await?;
        Ok(listing
            .items
            .into_iter()
            .filter_map(|item| item.get("id").cloned())
            .collect())
    }
}
