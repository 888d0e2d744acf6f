use futures_util::future::join_all;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{ResourceError, ResourceResult};
use crate::logic::relationships::RelationshipMaintainer;
use crate::model::{
    get_path, id_values, is_truthy, now_timestamp, Document, FindOptions, Predicate, QueryOptions,
    ResourceDef, SchemaRegistry, SortKey, UpdateCommand, DELETED_AT, LINKS_BAG, PHYSICAL_KEY,
    TENANT_FIELD,
};
use crate::store::codec::{cast_update, prune_select, to_storage, to_wire, to_wire_projected};
use crate::store::query_parser::parse_query;
use crate::store::traits::{DocumentStore, StoreResult};

/// What soft deletion does to set-valued relationship fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetFieldDeletePolicy {
    /// Unset them together with singular fields.
    #[default]
    Clear,
    /// Keep them until the document is physically removed.
    PreserveUntilHardDelete,
}

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// Retries after the first attempt when an upsert hits a duplicate key.
    pub upsert_retry_limit: usize,
    pub set_field_delete_policy: SetFieldDeletePolicy,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            upsert_retry_limit: 5,
            set_field_delete_policy: SetFieldDeletePolicy::default(),
        }
    }
}

/// Logical document operations over a physical store.
pub struct StorageAdapter<S: DocumentStore> {
    store: Arc<S>,
    registry: Arc<SchemaRegistry>,
    maintainer: RelationshipMaintainer<S>,
    settings: AdapterSettings,
}

impl<S: DocumentStore> StorageAdapter<S> {
    pub fn new(store: Arc<S>, registry: Arc<SchemaRegistry>, settings: AdapterSettings) -> Self {
        let maintainer = RelationshipMaintainer::new(store.clone(), registry.clone());
        Self {
            store,
            registry,
            maintainer,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn maintainer(&self) -> &RelationshipMaintainer<S> {
        &self.maintainer
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    /// Declare the unique indexes every registered resource relies on.
    pub async fn init(&self) -> ResourceResult<()> {
        for def in self.registry.iter() {
            let mut fields = Vec::new();
            if def.multitenant {
                fields.push(TENANT_FIELD.to_string());
            }
            if def.pk.is_some() || def.multitenant {
                fields.push(def.pk_field().to_string());
                self.store.ensure_unique_index(&def.collection, &fields).await?;
                debug!("Unique index on {} ({})", def.collection, fields.join(", "));
            }
        }
        Ok(())
    }

    /// Create one document, upserting when an upsert key matches.
    pub async fn create(&self, def: &ResourceDef, id: Option<&Value>, input: &Value) -> ResourceResult<Value> {
        let document = to_storage(def, input, id)?;
        let paths: Vec<String> = document.keys().cloned().collect();

        let stored = match self.upsert_match(def, &document) {
            Some(predicate) => self.upsert(def, predicate, document).await?,
            None => self.store.insert(&def.collection, document).await?,
        };

        self.maintainer.repair(def, &stored, &paths).await?;
        Ok(to_wire(def, &stored))
    }

    /// Match on the first declared upsert key; a missing or falsy value inserts.
    fn upsert_match(&self, def: &ResourceDef, document: &Document) -> Option<Predicate> {
        let key = def.upsert_keys.first()?;
        let value = get_path(document, key).filter(|value| is_truthy(value))?.clone();
        let mut predicate = Predicate::eq(key.as_str(), value);
        if let Some(tenant) = document.get(TENANT_FIELD).filter(|t| !t.is_null()) {
            predicate = predicate.with(Predicate::eq(TENANT_FIELD, tenant.clone()));
        }
        Some(predicate)
    }

    async fn upsert(&self, def: &ResourceDef, predicate: Predicate, document: Document) -> ResourceResult<Document> {
        let limit = self.settings.upsert_retry_limit;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_upsert(def, &predicate, &document).await {
                Err(error) if error.is_duplicate_key() => {
                    if attempts > limit {
                        return Err(ResourceError::StorageConflict {
                            resource: def.name.clone(),
                            attempts,
                        });
                    }
                    warn!("Upsert on {} hit a duplicate key (attempt {}), retrying", def.name, attempts);
                }
                other => return other.map_err(ResourceError::from),
            }
        }
    }

    async fn try_upsert(&self, def: &ResourceDef, predicate: &Predicate, document: &Document) -> StoreResult<Document> {
        let Some(existing) = self.store.find_one(&def.collection, predicate).await? else {
            return self.store.insert(&def.collection, document.clone()).await;
        };

        let mut update = UpdateCommand::new();
        for (key, value) in document {
            if key == PHYSICAL_KEY {
                continue;
            }
            match (value, existing.get(key)) {
                (Value::Object(nested), Some(Value::Object(_))) => {
                    flatten_into(&mut update.set, key, nested);
                }
                _ => {
                    update.set.insert(key.clone(), value.clone());
                }
            }
        }
        let by_key = Predicate::eq(PHYSICAL_KEY, existing.get(PHYSICAL_KEY).cloned().unwrap_or(Value::Null));
        match self.store.find_one_and_update(&def.collection, &by_key, &update).await? {
            Some(updated) => Ok(updated),
            None => self.store.insert(&def.collection, document.clone()).await,
        }
    }

    /// Exactly one document, or `NotFound`.
    pub async fn find(&self, def: &ResourceDef, filter: &Value, options: &QueryOptions) -> ResourceResult<Value> {
        let mut options = options.clone();
        options.limit = Some(1);
        options.page = None;
        self.find_many(def, filter, &options)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ResourceError::not_found(&def.name, filter.to_string()))
    }

    pub async fn find_many(
        &self,
        def: &ResourceDef,
        filter: &Value,
        options: &QueryOptions,
    ) -> ResourceResult<Vec<Value>> {
        let predicate = self.predicate(def, filter, options.include_deleted)?;
        let find_options = self.find_options(def, options);
        let documents = self.store.find(&def.collection, &predicate, &find_options).await?;

        Ok(match options.select.clone().map(prune_select) {
            Some(select) if !select.is_empty() => documents
                .iter()
                .map(|document| to_wire_projected(def, document, &select))
                .collect(),
            _ => documents.iter().map(|document| to_wire(def, document)).collect(),
        })
    }

    pub async fn count(&self, def: &ResourceDef, filter: &Value, include_deleted: bool) -> ResourceResult<u64> {
        let predicate = self.predicate(def, filter, include_deleted)?;
        Ok(self.store.count(&def.collection, &predicate).await?)
    }

    /// Apply an update to the first live match and repair the touched references.
    pub async fn update(&self, def: &ResourceDef, filter: &Value, mut command: UpdateCommand) -> ResourceResult<Value> {
        cast_update(def, &mut command)?;
        let predicate = self.predicate(def, filter, false)?;

        if command.is_empty() {
            let existing = self
                .store
                .find_one(&def.collection, &predicate)
                .await?
                .ok_or_else(|| ResourceError::not_found(&def.name, filter.to_string()))?;
            return Ok(to_wire(def, &existing));
        }

        let updated = self
            .store
            .find_one_and_update(&def.collection, &predicate, &command)
            .await?
            .ok_or_else(|| ResourceError::not_found(&def.name, filter.to_string()))?;

        self.maintainer
            .repair(def, &updated, &command.modified_paths())
            .await?;
        Ok(to_wire(def, &updated))
    }

    /// Soft-delete every live match: snapshot references, clear them, repair.
    pub async fn mark_deleted(&self, def: &ResourceDef, ids: &Value) -> ResourceResult<Vec<Value>> {
        let predicate = self.predicate(def, ids, false)?;
        let documents = self
            .store
            .find(&def.collection, &predicate, &FindOptions::default())
            .await?;

        let deleted_at = now_timestamp();
        let outcomes = join_all(
            documents
                .iter()
                .map(|document| self.mark_one_deleted(def, document, &deleted_at)),
        )
        .await;
        collect_outcomes(outcomes)
    }

    async fn mark_one_deleted(&self, def: &ResourceDef, document: &Document, deleted_at: &str) -> ResourceResult<Value> {
        let mut snapshot = Map::new();
        let mut cleared = Vec::new();
        let mut update = UpdateCommand::new().set(DELETED_AT, Value::String(deleted_at.to_string()));

        for reference in &def.references {
            let values = id_values(document.get(&reference.path));
            if !values.is_empty() {
                let value = if reference.singular {
                    values[0].clone()
                } else {
                    Value::Array(values)
                };
                snapshot.insert(reference.path.clone(), value);
            }
            let clear = reference.singular
                || self.settings.set_field_delete_policy == SetFieldDeletePolicy::Clear;
            if clear && document.contains_key(&reference.path) {
                update.unset.push(reference.path.clone());
                cleared.push(reference.path.clone());
            }
        }
        if !snapshot.is_empty() {
            update.set.insert(LINKS_BAG.to_string(), Value::Object(snapshot));
        }

        let by_key = physical_match(document);
        let updated = self
            .store
            .find_one_and_update(&def.collection, &by_key, &update)
            .await?
            .ok_or_else(|| ResourceError::not_found(&def.name, "document vanished during deletion"))?;

        self.maintainer.repair(def, &updated, &cleared).await?;
        Ok(to_wire(def, &updated))
    }

    /// Soft-delete, then physically remove every match, deleted or not.
    pub async fn delete(&self, def: &ResourceDef, ids: &Value) -> ResourceResult<Vec<Value>> {
        self.mark_deleted(def, ids).await?;
        let predicate = self.predicate(def, ids, true)?;

        if self.settings.set_field_delete_policy == SetFieldDeletePolicy::PreserveUntilHardDelete {
            self.clear_set_fields(def, &predicate).await?;
        }

        let documents = self
            .store
            .find(&def.collection, &predicate, &FindOptions::default())
            .await?;
        let removed = self.store.delete_many(&def.collection, &predicate).await?;
        debug!("Removed {} {} document(s)", removed, def.name);
        Ok(documents.iter().map(|document| to_wire(def, document)).collect())
    }

    /// Dissociate set-valued references kept through soft deletion.
    async fn clear_set_fields(&self, def: &ResourceDef, predicate: &Predicate) -> ResourceResult<()> {
        let documents = self
            .store
            .find(&def.collection, predicate, &FindOptions::default())
            .await?;
        let outcomes = join_all(
            documents
                .iter()
                .map(|document| self.clear_one_set_fields(def, document)),
        )
        .await;
        collect_outcomes(outcomes).map(|_| ())
    }

    async fn clear_one_set_fields(&self, def: &ResourceDef, document: &Document) -> ResourceResult<Value> {
        let held: Vec<String> = def
            .references
            .iter()
            .filter(|r| !r.singular && !id_values(document.get(&r.path)).is_empty())
            .map(|r| r.path.clone())
            .collect();
        if held.is_empty() {
            return Ok(to_wire(def, document));
        }
        let update = held
            .iter()
            .fold(UpdateCommand::new(), |update, path| update.unset(path.as_str()));
        let updated = self
            .store
            .find_one_and_update(&def.collection, &physical_match(document), &update)
            .await?
            .ok_or_else(|| ResourceError::not_found(&def.name, "document vanished during deletion"))?;
        self.maintainer.repair(def, &updated, &held).await?;
        Ok(to_wire(def, &updated))
    }

    /// Normalize a filter, gating soft-deleted documents unless asked not to.
    pub fn predicate(&self, def: &ResourceDef, filter: &Value, include_deleted: bool) -> ResourceResult<Predicate> {
        let predicate = parse_query(def, filter)?;
        Ok(if include_deleted {
            predicate
        } else {
            predicate.not_deleted()
        })
    }

    fn find_options(&self, def: &ResourceDef, options: &QueryOptions) -> FindOptions {
        let mut find_options = options.find_options();
        if find_options.sort.is_empty() {
            if let Some(sort) = &def.default_sort {
                find_options.sort = SortKey::parse_list(sort);
            }
        }
        if find_options.limit.is_none() && options.page.is_none() && options.limit.is_none() {
            find_options.limit = def.default_limit;
        }
        find_options
    }
}

fn physical_match(document: &Document) -> Predicate {
    Predicate::eq(PHYSICAL_KEY, document.get(PHYSICAL_KEY).cloned().unwrap_or(Value::Null))
}

fn flatten_into(set: &mut Document, prefix: &str, nested: &Map<String, Value>) {
    for (key, value) in nested {
        set.insert(format!("{}.{}", prefix, key), value.clone());
    }
}

/// Merge per-document outcomes: repair failures are concatenated, any other
/// error wins outright.
fn collect_outcomes(outcomes: Vec<ResourceResult<Value>>) -> ResourceResult<Vec<Value>> {
    let mut values = Vec::with_capacity(outcomes.len());
    let mut repair_failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(value) => values.push(value),
            Err(ResourceError::RelationshipRepair(failures)) => repair_failures.extend(failures),
            Err(other) => return Err(other),
        }
    }
    if repair_failures.is_empty() {
        Ok(values)
    } else {
        Err(ResourceError::RelationshipRepair(repair_failures))
    }
}
