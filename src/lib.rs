pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

// Export API types
pub use api::handlers;
pub use api::routes;

pub use error::{ResourceError, ResourceResult};

pub use logic::{
    register_validation, transform_fn, HookChains, HookDefinition, HookError, HookKind, HookOutcome,
    HookRegistry, HookStage, RequestContext, ResourceService, Transform,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{AdapterSettings, DocumentStore, MemoryStore, PostgresStore, SetFieldDeletePolicy, StorageAdapter};

use anyhow::Context;
use axum::http::StatusCode;
use log::{info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::api::handlers::{AppContext, AppState};
use crate::config::{AppConfig, Backend};

/// Declarations loaded from the resource file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceFile {
    pub custom_types: Map<String, Value>,
    pub resources: Vec<ResourceDeclaration>,
}

impl ResourceFile {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read resource file {}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse resource file {}", path))
    }

    pub fn registry(self) -> Result<SchemaRegistry, SchemaError> {
        self.custom_types
            .into_iter()
            .fold(SchemaRegistry::builder(), |builder, (name, schema)| builder.custom_type(name, schema))
            .resources(self.resources)
            .build()
    }
}

/// Assemble the shared handler state over a store.
///
/// Validation hooks are added to `hooks` for every resource that declares
/// field rules before the chains are composed.
pub async fn build_state<S: DocumentStore>(
    store: Arc<S>,
    schemas: Arc<SchemaRegistry>,
    mut hooks: HookRegistry,
    config: &AppConfig,
) -> anyhow::Result<AppState<S>> {
    let adapter = StorageAdapter::new(store, schemas.clone(), config.adapter_settings());
    adapter.init().await?;

    register_validation(&mut hooks, &schemas);
    let chains = hooks.compose(&schemas);

    Ok(Arc::new(AppContext {
        service: ResourceService::new(adapter, chains),
        abort_status: StatusCode::from_u16(config.api.hook_abort_status)
            .with_context(|| format!("Invalid hook abort status {}", config.api.hook_abort_status))?,
        default_page_size: config.api.default_page_size,
    }))
}

fn load_schemas(config: &AppConfig) -> anyhow::Result<Arc<SchemaRegistry>> {
    let file = match &config.api.resources_path {
        Some(path) => ResourceFile::load(path)?,
        None => {
            warn!("No resource file configured; serving no resources");
            ResourceFile::default()
        }
    };
    let schemas = file.registry()?;
    info!("Registered {} resources", schemas.len());
    Ok(Arc::new(schemas))
}

/// Serve the configured resources until the listener closes.
pub async fn serve(config: &AppConfig) -> anyhow::Result<()> {
    let schemas = load_schemas(config)?;
    match config.database.backend {
        Backend::Memory => serve_with(Arc::new(MemoryStore::new()), schemas, config).await,
        Backend::Postgres => {
            let database_url = config.database_url()?;
            let postgres_store =
                PostgresStore::new(&database_url, config.database.max_connections.unwrap_or(20)).await?;
            postgres_store.migrate().await?;
            serve_with(Arc::new(postgres_store), schemas, config).await
        }
    }
}

async fn serve_with<S: DocumentStore + 'static>(
    store: Arc<S>,
    schemas: Arc<SchemaRegistry>,
    config: &AppConfig,
) -> anyhow::Result<()> {
    use axum::serve;
    use tokio::net::TcpListener;

    let state = build_state(store, schemas, HookRegistry::new(), config).await?;
    let app = crate::api::routes::create_app(state, config.api.cors);

    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    info!("Resource server listening on http://{}", bind_address);

    serve(listener, app).await?;

    Ok(())
}

// Function for integration testing
pub async fn run_server() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();

    let config = AppConfig::load()?;
    serve(&config).await
}
