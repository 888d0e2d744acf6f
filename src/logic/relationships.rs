use futures_util::future::join_all;
use itertools::Itertools;
use log::debug;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{ResourceError, ResourceResult};
use crate::model::{
    id_values, Condition, Document, Predicate, ReferenceDescriptor, ResourceDef, SchemaRegistry,
    UpdateCommand, TENANT_FIELD,
};
use crate::store::traits::{DocumentStore, StoreResult};

/// Shape of a maintained relationship, seen from the primary side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Association {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Association {
    pub fn of(primary_singular: bool, inverse_singular: bool) -> Self {
        match (primary_singular, inverse_singular) {
            (true, true) => Association::OneToOne,
            (true, false) => Association::OneToMany,
            (false, true) => Association::ManyToOne,
            (false, false) => Association::ManyToMany,
        }
    }
}

/// Keeps inverse relationship fields consistent after a primary write.
pub struct RelationshipMaintainer<S: DocumentStore> {
    store: Arc<S>,
    registry: Arc<SchemaRegistry>,
    invocations: AtomicU64,
}

/// Everything one cardinality algorithm needs about the write being repaired.
struct Repair<'a> {
    primary: &'a ResourceDef,
    descriptor: &'a ReferenceDescriptor,
    target: &'a ResourceDef,
    inverse: &'a str,
    primary_id: Value,
    values: Vec<Value>,
    tenant: Option<Value>,
}

impl Repair<'_> {
    /// Conjoin the tenant of the primary document, if any.
    fn scoped(&self, predicate: Predicate) -> Predicate {
        match &self.tenant {
            Some(tenant) => predicate.with(Predicate::eq(TENANT_FIELD, tenant.clone())),
            None => predicate,
        }
    }

    fn points_back(&self) -> Predicate {
        Predicate::eq(self.inverse, self.primary_id.clone())
    }

    fn target_pk(&self, condition: Condition) -> Predicate {
        Predicate::field(self.target.pk_field(), condition)
    }
}

impl<S: DocumentStore> RelationshipMaintainer<S> {
    pub fn new(store: Arc<S>, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            store,
            registry,
            invocations: AtomicU64::new(0),
        }
    }

    /// Number of cardinality algorithms run so far.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Repair the inverse side of every maintained reference in `changed_paths`.
    ///
    /// Descriptors are repaired concurrently; every failure is collected
    /// into a single `RelationshipRepair` error.
    pub async fn repair(
        &self,
        def: &ResourceDef,
        document: &Document,
        changed_paths: &[String],
    ) -> ResourceResult<()> {
        let touched: Vec<&ReferenceDescriptor> = def
            .maintained_references()
            .filter(|reference| {
                changed_paths
                    .iter()
                    .any(|path| path.split('.').next() == Some(reference.path.as_str()))
            })
            .collect();
        if touched.is_empty() {
            return Ok(());
        }

        let Some(primary_id) = document.get(def.pk_field()).filter(|id| !id.is_null()).cloned() else {
            debug!("Skipping relationship repair on {} without a primary key", def.name);
            return Ok(());
        };
        let tenant = if def.multitenant {
            document.get(TENANT_FIELD).filter(|t| !t.is_null()).cloned()
        } else {
            None
        };

        let outcomes = join_all(touched.into_iter().map(|descriptor| {
            let primary_id = primary_id.clone();
            let tenant = tenant.clone();
            async move {
                self.repair_descriptor(def, descriptor, document, primary_id, tenant)
                    .await
                    .map_err(|error| {
                        format!(
                            "{}.{} -> {}.{}: {}",
                            def.name,
                            descriptor.path,
                            descriptor.target,
                            descriptor.inverse.as_deref().unwrap_or_default(),
                            error
                        )
                    })
            }
        }))
        .await;

        let failures: Vec<String> = outcomes.into_iter().filter_map(Result::err).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ResourceError::RelationshipRepair(failures))
        }
    }

    async fn repair_descriptor(
        &self,
        def: &ResourceDef,
        descriptor: &ReferenceDescriptor,
        document: &Document,
        primary_id: Value,
        tenant: Option<Value>,
    ) -> ResourceResult<()> {
        let target = self.registry.resolve(descriptor.target.as_str())?;
        let Some(inverse) = descriptor.inverse.as_deref() else {
            return Ok(());
        };
        let inverse_singular = target
            .reference(inverse)
            .map(|reference| reference.singular)
            .unwrap_or(true);

        let repair = Repair {
            primary: def,
            descriptor,
            target: &target,
            inverse,
            primary_id,
            values: id_values(document.get(&descriptor.path))
                .into_iter()
                .unique_by(Value::to_string)
                .collect(),
            tenant,
        };

        let association = Association::of(descriptor.singular, inverse_singular);
        self.invocations.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Repairing {:?} {}.{} -> {}.{} for {} with {:?}",
            association, def.name, descriptor.path, target.name, inverse, repair.primary_id, repair.values
        );

        match association {
            Association::OneToOne => self.one_to_one(&repair).await?,
            Association::OneToMany => self.one_to_many(&repair).await?,
            Association::ManyToOne => self.many_to_one(&repair).await?,
            Association::ManyToMany => self.many_to_many(&repair).await?,
        }
        Ok(())
    }

    async fn one_to_one(&self, repair: &Repair<'_>) -> StoreResult<()> {
        let collection = &repair.target.collection;
        let new_target = repair.values.first();

        // Dissociate the previous partner before associating the new one
        let mut stale = repair.points_back();
        if let Some(new_target) = new_target {
            stale = stale.with(repair.target_pk(Condition::Ne(new_target.clone())));
        }
        self.store
            .update_many(collection, &repair.scoped(stale), &UpdateCommand::new().unset(repair.inverse))
            .await?;

        let Some(new_target) = new_target else {
            return Ok(());
        };
        let target_match = repair.scoped(repair.target_pk(Condition::Eq(new_target.clone())));

        // The new target may still be bound to a different primary
        if let Some(existing) = self.store.find_one(collection, &target_match).await? {
            let displaced = existing
                .get(repair.inverse)
                .filter(|partner| !partner.is_null() && **partner != repair.primary_id);
            if let Some(displaced) = displaced {
                let predicate = Predicate::and([
                    Predicate::eq(repair.primary.pk_field(), displaced.clone()),
                    Predicate::eq(repair.descriptor.path.as_str(), new_target.clone()),
                ]);
                self.store
                    .update_many(
                        &repair.primary.collection,
                        &repair.scoped(predicate),
                        &UpdateCommand::new().unset(repair.descriptor.path.as_str()),
                    )
                    .await?;
            }
        }

        self.store
            .update_many(
                collection,
                &target_match,
                &UpdateCommand::new().set(repair.inverse, repair.primary_id.clone()),
            )
            .await?;
        Ok(())
    }

    async fn one_to_many(&self, repair: &Repair<'_>) -> StoreResult<()> {
        let collection = &repair.target.collection;
        let new_target = repair.values.first();

        let mut stale = repair.points_back();
        if let Some(new_target) = new_target {
            stale = stale.with(repair.target_pk(Condition::Ne(new_target.clone())));
        }
        self.store
            .update_many(
                collection,
                &repair.scoped(stale),
                &UpdateCommand::new().pull(repair.inverse, vec![repair.primary_id.clone()]),
            )
            .await?;

        if let Some(new_target) = new_target {
            self.store
                .update_many(
                    collection,
                    &repair.scoped(repair.target_pk(Condition::Eq(new_target.clone()))),
                    &UpdateCommand::new().add_to_set(repair.inverse, vec![repair.primary_id.clone()]),
                )
                .await?;
        }
        Ok(())
    }

    async fn many_to_one(&self, repair: &Repair<'_>) -> StoreResult<()> {
        let collection = &repair.target.collection;

        let stale = repair
            .points_back()
            .with(repair.target_pk(Condition::Nin(repair.values.clone())));
        self.store
            .update_many(collection, &repair.scoped(stale), &UpdateCommand::new().unset(repair.inverse))
            .await?;

        if repair.values.is_empty() {
            return Ok(());
        }
        self.store
            .update_many(
                collection,
                &repair.scoped(repair.target_pk(Condition::In(repair.values.clone()))),
                &UpdateCommand::new().set(repair.inverse, repair.primary_id.clone()),
            )
            .await?;

        // Any other primary still listing a claimed id loses it, however many there are
        let redundant = Predicate::and([
            Predicate::field(repair.primary.pk_field(), Condition::Ne(repair.primary_id.clone())),
            Predicate::field(repair.descriptor.path.as_str(), Condition::In(repair.values.clone())),
        ]);
        let cleaned = self
            .store
            .update_many(
                &repair.primary.collection,
                &repair.scoped(redundant),
                &UpdateCommand::new().pull(repair.descriptor.path.as_str(), repair.values.clone()),
            )
            .await?;
        if cleaned > 0 {
            debug!(
                "Removed redundant {}.{} bindings from {} document(s)",
                repair.primary.name, repair.descriptor.path, cleaned
            );
        }
        Ok(())
    }

    async fn many_to_many(&self, repair: &Repair<'_>) -> StoreResult<()> {
        let collection = &repair.target.collection;

        let stale = repair
            .points_back()
            .with(repair.target_pk(Condition::Nin(repair.values.clone())));
        self.store
            .update_many(
                collection,
                &repair.scoped(stale),
                &UpdateCommand::new().pull(repair.inverse, vec![repair.primary_id.clone()]),
            )
            .await?;

        if !repair.values.is_empty() {
            self.store
                .update_many(
                    collection,
                    &repair.scoped(repair.target_pk(Condition::In(repair.values.clone()))),
                    &UpdateCommand::new().add_to_set(repair.inverse, vec![repair.primary_id.clone()]),
                )
                .await?;
        }
        Ok(())
    }
}
