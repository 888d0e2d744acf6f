use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;

use crate::api::handlers::{self, AppState};
use crate::store::traits::DocumentStore;

pub fn create_router<S: DocumentStore + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Resource definitions
        .route("/resources", get(handlers::list_resources::<S>))
        // Collections
        .route(
            "/:collection",
            get(handlers::list_documents::<S>)
                .post(handlers::create_documents::<S>)
                .delete(handlers::delete_collection::<S>)
                .fallback(handlers::method_not_allowed::<S>),
        )
        // Documents by id, comma separated
        .route(
            "/:collection/:ids",
            get(handlers::get_documents::<S>)
                .put(handlers::replace_document::<S>)
                .patch(handlers::patch_document::<S>)
                .delete(handlers::delete_documents::<S>)
                .fallback(handlers::method_not_allowed::<S>),
        )
        // Related documents through a relationship field
        .route(
            "/:collection/:ids/:field",
            get(handlers::get_related::<S>).fallback(handlers::method_not_allowed::<S>),
        )
}

/// The resource router with the optional CORS layer applied.
pub fn create_app<S: DocumentStore + 'static>(state: AppState<S>, cors: bool) -> Router {
    let router = create_router::<S>();
    let router = if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };
    router.with_state(state)
}
