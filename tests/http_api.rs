use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use reqwest::Client;
use resource_db_rust::config::AppConfig;
use resource_db_rust::routes::create_app;
use resource_db_rust::{
    build_state, transform_fn, HookDefinition, HookKind, HookOutcome, HookRegistry, HookStage, MemoryStore,
    ResourceDeclaration, ResourceOptions, SchemaRegistry,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceExt;

fn schemas() -> SchemaRegistry {
    SchemaRegistry::builder()
        .resource(ResourceDeclaration::new(
            "person",
            json!({
                "name": "string",
                "email": "string",
                "soulmate": {"ref": "person", "inverse": "soulmate"},
                "pets": [{"ref": "pet", "inverse": "owner"}]
            }),
            ResourceOptions {
                pk: Some("email".into()),
                ..Default::default()
            },
        ))
        .resource(ResourceDeclaration::new(
            "pet",
            json!({"name": "string", "owner": {"ref": "person", "inverse": "pets"}}),
            ResourceOptions {
                pk: Some("name".into()),
                ..Default::default()
            },
        ))
        .resource(ResourceDeclaration::new(
            "company",
            json!({"name": {"type": "string", "validation": {"required": true}}}),
            ResourceOptions::default(),
        ))
        .build()
        .unwrap()
}

async fn create_test_app(hooks: HookRegistry) -> Router {
    let config = AppConfig::default();
    let state = build_state(Arc::new(MemoryStore::new()), Arc::new(schemas()), hooks, &config)
        .await
        .unwrap();
    create_app(state, false)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.map(|b| b.to_string()).unwrap_or_default()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_soulmate_scenario() {
    let app = create_test_app(HookRegistry::new()).await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/people",
        Some(json!({"people": [{"email": "a@x.com"}, {"email": "b@x.com"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["people"].as_array().unwrap().len(), 2);

    let (status, _) = send(&app, Method::PATCH, "/people/a@x.com", Some(json!({"soulmate": "b@x.com"}))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, Method::GET, "/people?filter%5Bsoulmate%5D=b%40x.com", None).await;
    assert_eq!(status, StatusCode::OK);
    let people = body["people"].as_array().unwrap();
    assert_eq!(people.len(), 1);
    assert_eq!(people[0]["id"], json!("a@x.com"));

    let (status, body) = send(&app, Method::GET, "/people/b@x.com", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["people"][0]["links"]["soulmate"], json!("a@x.com"));
}

#[tokio::test]
async fn test_meta_count_and_related() {
    let app = create_test_app(HookRegistry::new()).await;
    send(
        &app,
        Method::POST,
        "/people",
        Some(json!({"people": [{"email": "a@x.com", "links": {"pets": ["spot", "rex"]}}]})),
    )
    .await;
    send(&app, Method::POST, "/pets", Some(json!({"pets": [{"name": "spot"}, {"name": "rex"}]}))).await;

    let (status, body) = send(&app, Method::GET, "/pets?includeMeta=count&sort=name", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["count"], json!(2));
    assert_eq!(body["pets"][0]["id"], json!("rex"));

    let (status, body) = send(&app, Method::GET, "/people/a@x.com/pets", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pets"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_hook_abort_uses_abort_status() {
    let mut hooks = HookRegistry::new();
    hooks.register_for(
        "person",
        HookStage::Before,
        HookKind::Read,
        HookDefinition::from_transform("gate", transform_fn(|_, _| Ok(HookOutcome::Abort))),
    );
    let app = create_test_app(hooks).await;

    let (status, body) = send(&app, Method::GET, "/people", None).await;
    assert_eq!(status.as_u16(), 321);
    assert_eq!(body, Value::Null);

    let (status, _) = send(&app, Method::GET, "/pets", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_response_hook_overrides_status() {
    let mut hooks = HookRegistry::new();
    hooks.register_for(
        "pet",
        HookStage::Before,
        HookKind::Response,
        HookDefinition::from_transform(
            "accepted",
            transform_fn(|body, _| Ok(HookOutcome::Continue(json!({"statusCode": 202, "body": {"wrapped": body}})))),
        ),
    );
    let app = create_test_app(hooks).await;

    let (status, body) = send(&app, Method::GET, "/pets", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({"wrapped": {"pets": []}}));
}

#[tokio::test]
async fn test_error_statuses() {
    let app = create_test_app(HookRegistry::new()).await;

    let (status, body) = send(&app, Method::POST, "/companies", Some(json!({"companies": [{}]}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], json!("ValidationError"));
    assert!(body["detail"].as_str().unwrap().contains("name"));

    let (status, body) = send(&app, Method::POST, "/people/a@x.com", Some(json!({}))).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body["error"], json!("MethodNotAllowed"));

    let (status, body) = send(&app, Method::GET, "/people/nobody@x.com", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("NotFound"));

    let (status, _) = send(&app, Method::GET, "/spaceships", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, Method::GET, "/pets?filter%5Bname%5D%5Bregex%5D=%5B", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("BadRequest"));
}

// Test client wrapper for making API calls
struct TestClient {
    client: Client,
    base_url: String,
}

impl TestClient {
    fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }

    async fn post(&self, path: &str, json: Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .json(&json)
            .send()
            .await
    }

    async fn put(&self, path: &str, json: Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .put(format!("{}{}", self.base_url, path))
            .json(&json)
            .send()
            .await
    }

    async fn get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.get(format!("{}{}", self.base_url, path)).send().await
    }

    async fn delete(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.delete(format!("{}{}", self.base_url, path)).send().await
    }

    async fn patch(&self, path: &str, json: Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .patch(format!("{}{}", self.base_url, path))
            .json(&json)
            .send()
            .await
    }
}

async fn spawn_server() -> TestClient {
    let app = create_test_app(HookRegistry::new()).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestClient::new(format!("http://{}", address))
}

#[tokio::test]
async fn test_live_server_workflow() {
    let client = spawn_server().await;

    let health: Value = client.get("/health").await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], json!("healthy"));

    let resources: Value = client.get("/resources").await.unwrap().json().await.unwrap();
    assert_eq!(resources["resources"].as_array().unwrap().len(), 3);

    let response = client.put("/pets/rex", json!({"pets": [{"name": "rex"}]})).await.unwrap();
    assert_eq!(response.status().as_u16(), 201);
    let response = client.put("/pets/rex", json!({"name": "rex"})).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let response = client.post("/people", json!({"people": [{"email": "a@x.com"}]})).await.unwrap();
    assert_eq!(response.status().as_u16(), 201);

    let patch = json!([{"op": "add", "path": "/people/0/links/pets/-", "value": "rex"}]);
    let response = client.patch("/people/a@x.com", patch).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let rex: Value = client.get("/pets/rex").await.unwrap().json().await.unwrap();
    assert_eq!(rex["pets"][0]["links"]["owner"], json!("a@x.com"));

    let response = client.delete("/pets/rex").await.unwrap();
    assert_eq!(response.status().as_u16(), 204);
    assert!(response.text().await.unwrap().is_empty());
    let response = client.get("/pets/rex").await.unwrap();
    assert_eq!(response.status().as_u16(), 404);

    let deleted: Value = client
        .get("/pets?includeDeleted=true")
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(deleted["pets"][0]["deletedAt"].is_string());
}
