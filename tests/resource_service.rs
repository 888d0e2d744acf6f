use axum::http::Method;
use resource_db_rust::store::traits::{StoreError, StoreResult};
use parking_lot::Mutex;
use resource_db_rust::{
    register_validation, transform_fn, AdapterSettings, Document, DocumentStore, FindOptions, HookDefinition,
    HookKind, HookOutcome, HookRegistry, HookStage, MemoryStore, Predicate, QueryOptions, RequestContext,
    ResourceDeclaration, ResourceDef, ResourceError, ResourceOptions, ResourceService, SchemaRegistry,
    SetFieldDeletePolicy, StorageAdapter, UpdateCommand,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn schemas() -> SchemaRegistry {
    let keyed = |pk: &str| ResourceOptions {
        pk: Some(pk.to_string()),
        ..Default::default()
    };
    SchemaRegistry::builder()
        .resource(ResourceDeclaration::new(
            "person",
            json!({
                "name": "string",
                "email": "string",
                "soulmate": {"ref": "person", "inverse": "soulmate"},
                "pets": [{"ref": "pet", "inverse": "owner"}],
                "houses": [{"ref": "house", "inverse": "owners"}]
            }),
            keyed("email"),
        ))
        .resource(ResourceDeclaration::new(
            "pet",
            json!({"name": "string", "owner": {"ref": "person", "inverse": "pets"}}),
            keyed("name"),
        ))
        .resource(ResourceDeclaration::new(
            "house",
            json!({"address": "string", "owners": [{"ref": "person", "inverse": "houses"}]}),
            keyed("address"),
        ))
        .resource(ResourceDeclaration::new(
            "part",
            json!({"code": "string", "label": "string"}),
            ResourceOptions {
                upsert_keys: vec!["code".to_string(), "label".to_string()],
                ..Default::default()
            },
        ))
        .resource(ResourceDeclaration::new(
            "member",
            json!({
                "handle": "string",
                "_tenantId": "string",
                "partner": {"ref": "member", "inverse": "partner"}
            }),
            keyed("handle"),
        ))
        .build()
        .unwrap()
}

async fn create_service<S: DocumentStore>(store: Arc<S>, settings: AdapterSettings) -> ResourceService<S> {
    create_service_with_hooks(store, settings, HookRegistry::new()).await
}

async fn create_service_with_hooks<S: DocumentStore>(
    store: Arc<S>,
    settings: AdapterSettings,
    mut hooks: HookRegistry,
) -> ResourceService<S> {
    let schemas = Arc::new(schemas());
    let adapter = StorageAdapter::new(store, schemas.clone(), settings);
    adapter.init().await.unwrap();
    register_validation(&mut hooks, &schemas);
    ResourceService::new(adapter, hooks.compose(&schemas))
}

async fn memory_service() -> ResourceService<MemoryStore> {
    create_service(Arc::new(MemoryStore::new()), AdapterSettings::default()).await
}

fn request() -> Arc<RequestContext> {
    Arc::new(RequestContext::new(Method::GET, "/test"))
}

fn def<S: DocumentStore>(service: &ResourceService<S>, name: &str) -> Arc<ResourceDef> {
    service.resolve(name).unwrap()
}

async fn create<S: DocumentStore>(service: &ResourceService<S>, resource: &str, documents: Vec<Value>) -> Vec<Value> {
    service
        .create_many(&def(service, resource), documents, &request())
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect()
}

async fn get<S: DocumentStore>(service: &ResourceService<S>, resource: &str, id: &str) -> Value {
    service
        .get_by_ids(&def(service, resource), &[id.to_string()], &QueryOptions::default(), &request())
        .await
        .unwrap()
        .items
        .remove(0)
}

async fn patch<S: DocumentStore>(service: &ResourceService<S>, resource: &str, id: &str, body: Value) -> Value {
    service
        .patch(&def(service, resource), id, &body, &request())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_one_to_one_symmetry_clears_displaced_partner() {
    let service = memory_service().await;
    create(
        &service,
        "person",
        vec![
            json!({"email": "p1@x.com"}),
            json!({"email": "p2@x.com"}),
            json!({"email": "p3@x.com"}),
        ],
    )
    .await;

    patch(&service, "person", "p2@x.com", json!({"soulmate": "p3@x.com"})).await;
    assert_eq!(get(&service, "person", "p3@x.com").await["links"]["soulmate"], json!("p2@x.com"));

    patch(&service, "person", "p1@x.com", json!({"soulmate": "p2@x.com"})).await;
    assert_eq!(get(&service, "person", "p2@x.com").await["links"]["soulmate"], json!("p1@x.com"));
    assert!(get(&service, "person", "p3@x.com").await.get("links").is_none());
}

#[tokio::test]
async fn test_many_to_many_closure() {
    let service = memory_service().await;
    let route = def(&service, "person").route.clone();
    create(&service, "house", vec![json!({"address": "h1"})]).await;
    create(
        &service,
        "person",
        vec![json!({"email": "a@x.com"}), json!({"email": "b@x.com"})],
    )
    .await;

    let add = json!([{"op": "add", "path": format!("/{}/0/links/houses/-", route), "value": "h1"}]);
    patch(&service, "person", "a@x.com", add.clone()).await;
    patch(&service, "person", "b@x.com", add).await;
    assert_eq!(
        get(&service, "house", "h1").await["links"]["owners"],
        json!(["a@x.com", "b@x.com"])
    );

    let remove = json!([{"op": "remove", "path": format!("/{}/0/links/houses/-", route), "value": "h1"}]);
    patch(&service, "person", "a@x.com", remove).await;
    assert_eq!(get(&service, "house", "h1").await["links"]["owners"], json!(["b@x.com"]));
    assert_eq!(get(&service, "person", "b@x.com").await["links"]["houses"], json!(["h1"]));
}

#[tokio::test]
async fn test_many_to_one_moves_the_pet_between_owners() {
    let service = memory_service().await;
    create(&service, "pet", vec![json!({"name": "spot"})]).await;

    for owner in ["b@x.com", "c@x.com", "a@x.com"] {
        create(
            &service,
            "person",
            vec![json!({"email": owner, "links": {"pets": ["spot"]}})],
        )
        .await;
        assert_eq!(get(&service, "pet", "spot").await["links"]["owner"], json!(owner));
    }

    assert!(get(&service, "person", "b@x.com").await.get("links").is_none());
    assert!(get(&service, "person", "c@x.com").await.get("links").is_none());
    assert_eq!(get(&service, "person", "a@x.com").await["links"]["pets"], json!(["spot"]));
}

#[tokio::test]
async fn test_one_to_many_follows_the_owner() {
    let service = memory_service().await;
    create(
        &service,
        "person",
        vec![json!({"email": "a@x.com"}), json!({"email": "b@x.com"})],
    )
    .await;
    create(&service, "pet", vec![json!({"name": "spot", "owner": "a@x.com"})]).await;
    assert_eq!(get(&service, "person", "a@x.com").await["links"]["pets"], json!(["spot"]));

    patch(&service, "pet", "spot", json!({"owner": "b@x.com"})).await;
    assert!(get(&service, "person", "a@x.com").await.get("links").is_none());
    assert_eq!(get(&service, "person", "b@x.com").await["links"]["pets"], json!(["spot"]));
}

#[tokio::test]
async fn test_updates_without_references_skip_repair() {
    let service = memory_service().await;
    create(
        &service,
        "person",
        vec![json!({"email": "b@x.com"}), json!({"email": "a@x.com", "soulmate": "b@x.com"})],
    )
    .await;

    let before = service.adapter().maintainer().invocations();
    patch(&service, "person", "a@x.com", json!({"name": "Dilbert"})).await;
    assert_eq!(service.adapter().maintainer().invocations(), before);

    patch(&service, "person", "a@x.com", json!({"soulmate": null})).await;
    assert_eq!(service.adapter().maintainer().invocations(), before + 1);
}

#[tokio::test]
async fn test_soft_delete_is_idempotent() {
    let service = memory_service().await;
    let pet = def(&service, "pet");
    create(&service, "pet", vec![json!({"name": "rex"})]).await;

    let removed = service.delete_by_ids(&pet, &["rex".to_string()], false, &request()).await.unwrap();
    let deleted_at = removed[0]["deletedAt"].clone();
    assert!(deleted_at.is_string());

    assert!(service.adapter().mark_deleted(&pet, &json!(["rex"])).await.unwrap().is_empty());
    assert!(matches!(
        service.delete_by_ids(&pet, &["rex".to_string()], false, &request()).await,
        Err(ResourceError::NotFound { .. })
    ));

    let live = service.list(&pet, Value::Null, &QueryOptions::default(), &request()).await.unwrap();
    assert!(live.items.is_empty());
    let all = service
        .list(&pet, Value::Null, &QueryOptions::default().including_deleted(), &request())
        .await
        .unwrap();
    assert_eq!(all.items.len(), 1);
    assert_eq!(all.items[0]["deletedAt"], deleted_at);
}

#[tokio::test]
async fn test_before_write_hook_can_veto_a_delete() {
    let locked = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let (gate, counter) = (locked.clone(), calls.clone());
    let mut hooks = HookRegistry::new();
    hooks.register_for(
        "pet",
        HookStage::Before,
        HookKind::Write,
        HookDefinition::from_transform(
            "lock",
            transform_fn(move |value, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                if gate.load(Ordering::SeqCst) {
                    Ok(HookOutcome::Abort)
                } else {
                    Ok(HookOutcome::Continue(value))
                }
            }),
        ),
    );
    let service = create_service_with_hooks(Arc::new(MemoryStore::new()), AdapterSettings::default(), hooks).await;
    let pet = def(&service, "pet");
    create(&service, "pet", vec![json!({"name": "rex"})]).await;

    locked.store(true, Ordering::SeqCst);
    let before = calls.load(Ordering::SeqCst);
    let outcome = service.delete_by_ids(&pet, &["rex".to_string()], true, &request()).await;
    assert!(matches!(outcome, Err(ResourceError::Aborted)));
    assert_eq!(calls.load(Ordering::SeqCst), before + 1);

    let outcome = service.delete_all(&pet, &Value::Null, false, &request()).await;
    assert!(matches!(outcome, Err(ResourceError::Aborted)));
    assert_eq!(get(&service, "pet", "rex").await["id"], json!("rex"));
}

#[tokio::test]
async fn test_after_write_hooks_run_on_deleted_documents() {
    let removed = Arc::new(Mutex::new(Vec::new()));
    let sink = removed.clone();
    let mut hooks = HookRegistry::new();
    hooks.register_for(
        "pet",
        HookStage::After,
        HookKind::Write,
        HookDefinition::from_transform(
            "audit",
            transform_fn(move |value, _| {
                if value.get("deletedAt").is_some_and(Value::is_string) {
                    sink.lock().push(value["id"].clone());
                }
                Ok(HookOutcome::Continue(value))
            }),
        ),
    );
    let service = create_service_with_hooks(Arc::new(MemoryStore::new()), AdapterSettings::default(), hooks).await;
    let pet = def(&service, "pet");
    create(&service, "pet", vec![json!({"name": "rex"}), json!({"name": "spot"}), json!({"name": "fido"})]).await;
    assert!(removed.lock().is_empty());

    service.delete_by_ids(&pet, &["rex".to_string()], false, &request()).await.unwrap();
    service.delete_all(&pet, &json!({"name": "spot"}), true, &request()).await.unwrap();
    assert_eq!(*removed.lock(), vec![json!("rex"), json!("spot")]);

    let live = service.list(&pet, Value::Null, &QueryOptions::default(), &request()).await.unwrap();
    assert_eq!(live.items.len(), 1);
    assert_eq!(live.items[0]["id"], json!("fido"));
}

#[tokio::test]
async fn test_upsert_matches_on_the_first_declared_key_only() {
    let service = memory_service().await;
    let part = def(&service, "part");
    create(&service, "part", vec![json!({"code": "A", "label": "L"})]).await;
    create(&service, "part", vec![json!({"label": "L"})]).await;
    create(&service, "part", vec![json!({"code": "", "label": "L"})]).await;

    let parts = service.list(&part, Value::Null, &QueryOptions::default(), &request()).await.unwrap();
    assert_eq!(parts.items.len(), 3);

    create(&service, "part", vec![json!({"code": "A", "label": "M"})]).await;
    let parts = service.list(&part, Value::Null, &QueryOptions::default(), &request()).await.unwrap();
    assert_eq!(parts.items.len(), 3);
    let coded = service
        .list(&part, json!({"code": "A"}), &QueryOptions::default(), &request())
        .await
        .unwrap();
    assert_eq!(coded.items.len(), 1);
    assert_eq!(coded.items[0]["label"], json!("M"));
}

/// Wraps a memory store and rejects the next updates with a duplicate key.
struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicUsize,
}

#[async_trait::async_trait]
impl DocumentStore for FlakyStore {
    async fn ensure_unique_index(&self, collection: &str, fields: &[String]) -> StoreResult<()> {
        self.inner.ensure_unique_index(collection, fields).await
    }

    async fn insert(&self, collection: &str, document: Document) -> StoreResult<Document> {
        self.inner.insert(collection, document).await
    }

    async fn find(&self, collection: &str, predicate: &Predicate, options: &FindOptions) -> StoreResult<Vec<Document>> {
        self.inner.find(collection, predicate, options).await
    }

    async fn count(&self, collection: &str, predicate: &Predicate) -> StoreResult<u64> {
        self.inner.count(collection, predicate).await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        predicate: &Predicate,
        update: &UpdateCommand,
    ) -> StoreResult<Option<Document>> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::DuplicateKey {
                collection: collection.to_string(),
                index: "code".to_string(),
            });
        }
        self.inner.find_one_and_update(collection, predicate, update).await
    }

    async fn update_many(&self, collection: &str, predicate: &Predicate, update: &UpdateCommand) -> StoreResult<u64> {
        self.inner.update_many(collection, predicate, update).await
    }

    async fn delete_many(&self, collection: &str, predicate: &Predicate) -> StoreResult<u64> {
        self.inner.delete_many(collection, predicate).await
    }
}

#[tokio::test]
async fn test_upsert_survives_transient_duplicate_keys() {
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        failures: AtomicUsize::new(0),
    });
    let service = create_service(store.clone(), AdapterSettings::default()).await;
    let part = def(&service, "part");

    create(&service, "part", vec![json!({"code": "A", "label": "first"})]).await;

    store.failures.store(4, Ordering::SeqCst);
    create(&service, "part", vec![json!({"code": "A", "label": "second"})]).await;

    let parts = service.list(&part, Value::Null, &QueryOptions::default(), &request()).await.unwrap();
    assert_eq!(parts.items.len(), 1);
    assert_eq!(parts.items[0]["label"], json!("second"));

    store.failures.store(6, Ordering::SeqCst);
    let outcome = service
        .create_many(&part, vec![json!({"code": "A", "label": "third"})], &request())
        .await
        .remove(0);
    assert!(matches!(outcome, Err(ResourceError::StorageConflict { attempts: 6, .. })));
}

#[tokio::test]
async fn test_repair_stays_within_tenant() {
    let service = memory_service().await;
    let member = def(&service, "member");
    create(
        &service,
        "member",
        vec![
            json!({"handle": "a", "_tenantId": "t1"}),
            json!({"handle": "b", "_tenantId": "t1"}),
            json!({"handle": "b", "_tenantId": "t2"}),
        ],
    )
    .await;

    service
        .patch(&member, "a", &json!({"partner": "b"}), &request())
        .await
        .unwrap();

    let partnered = service
        .list(&member, json!({"partner": "a"}), &QueryOptions::default(), &request())
        .await
        .unwrap();
    assert_eq!(partnered.items.len(), 1);
    assert_eq!(partnered.items[0]["_tenantId"], json!("t1"));
}

#[tokio::test]
async fn test_null_string_filters_actual_nulls() {
    let service = memory_service().await;
    let person = def(&service, "person");
    create(
        &service,
        "person",
        vec![
            json!({"email": "n1@x.com", "name": null}),
            json!({"email": "n2@x.com", "name": "null"}),
            json!({"email": "n3@x.com", "name": "Alice"}),
        ],
    )
    .await;

    let found = service
        .list(&person, json!({"name": "null"}), &QueryOptions::default(), &request())
        .await
        .unwrap();
    let ids: Vec<&Value> = found.items.iter().map(|item| &item["id"]).collect();
    assert_eq!(ids, vec![&json!("n1@x.com")]);
}

#[tokio::test]
async fn test_relationship_filters_resolve_through_the_tree() {
    let service = memory_service().await;
    let person = def(&service, "person");
    create(
        &service,
        "person",
        vec![
            json!({"email": "w@x.com", "name": "Wally"}),
            json!({"email": "d@x.com", "name": "Dilbert", "soulmate": "w@x.com"}),
        ],
    )
    .await;

    let found = service
        .list(&person, json!({"soulmate": {"name": "Wally"}}), &QueryOptions::default(), &request())
        .await
        .unwrap();
    assert_eq!(found.items.len(), 1);
    assert_eq!(found.items[0]["id"], json!("d@x.com"));

    let related = service
        .get_related(&person, "d@x.com", "soulmate", &QueryOptions::default(), &request())
        .await
        .unwrap();
    assert_eq!(related.items[0]["name"], json!("Wally"));
}

#[tokio::test]
async fn test_clear_policy_dissociates_sets_on_soft_delete() {
    let service = memory_service().await;
    let person = def(&service, "person");
    create(&service, "house", vec![json!({"address": "h1"})]).await;
    create(&service, "person", vec![json!({"email": "a@x.com", "houses": ["h1"]})]).await;

    service.delete_by_ids(&person, &["a@x.com".to_string()], false, &request()).await.unwrap();
    assert!(get(&service, "house", "h1").await.get("links").is_none());

    let deleted = service
        .list(&person, Value::Null, &QueryOptions::default().including_deleted(), &request())
        .await
        .unwrap();
    assert_eq!(deleted.items[0]["links"], json!({"houses": ["h1"]}));
}

#[tokio::test]
async fn test_preserve_policy_dissociates_sets_on_hard_delete() {
    let settings = AdapterSettings {
        set_field_delete_policy: SetFieldDeletePolicy::PreserveUntilHardDelete,
        ..Default::default()
    };
    let service = create_service(Arc::new(MemoryStore::new()), settings).await;
    let person = def(&service, "person");
    create(&service, "house", vec![json!({"address": "h1"})]).await;
    create(&service, "person", vec![json!({"email": "a@x.com", "houses": ["h1"]})]).await;

    service.delete_by_ids(&person, &["a@x.com".to_string()], false, &request()).await.unwrap();
    assert_eq!(get(&service, "house", "h1").await["links"]["owners"], json!(["a@x.com"]));

    let removed = service
        .delete_all(&person, &json!(["a@x.com"]), true, &request())
        .await
        .unwrap();
    assert_eq!(removed.len(), 1);
    assert!(get(&service, "house", "h1").await.get("links").is_none());
    assert_eq!(
        service.count(&person, &Value::Null, true).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_put_creates_then_replaces() {
    let service = memory_service().await;
    let pet = def(&service, "pet");

    let created = service
        .replace(&pet, "rex", json!({"name": "rex"}), &request())
        .await
        .unwrap();
    assert!(created.created);

    let replaced = service
        .replace(&pet, "rex", json!({"name": "rex", "owner": null}), &request())
        .await
        .unwrap();
    assert!(!replaced.created);
    assert_eq!(replaced.document["id"], json!("rex"));
}
