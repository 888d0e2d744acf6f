use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use log::error;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::api::handlers::AppContext;
use crate::error::ResourceError;
use crate::logic::hooks::{HookKind, HookOutcome, HookStage, RequestContext};
use crate::model::ResourceDef;
use crate::store::traits::DocumentStore;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: &str, detail: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            detail: Some(detail.into()),
        }
    }
}

/// Short machine-readable name of an error.
pub fn error_reason(error: &ResourceError) -> &'static str {
    match error {
        ResourceError::Validation(_) => "ValidationError",
        ResourceError::NotFound { .. } => "NotFound",
        ResourceError::StorageConflict { .. } => "StorageConflict",
        ResourceError::Cast { .. } => "CastError",
        ResourceError::BadRequest(_) => "BadRequest",
        ResourceError::MethodNotAllowed(_) => "MethodNotAllowed",
        ResourceError::RelationshipRepair(_) => "RelationshipRepairFailure",
        ResourceError::Aborted => "Aborted",
        ResourceError::Hook(_) => "HookError",
        ResourceError::Schema(_) => "SchemaError",
        ResourceError::Store(_) => "StoreError",
    }
}

/// Turn the outcome of a resource operation into an HTTP response.
///
/// Success bodies pass through the resource's before-response hooks and
/// error bodies through its before-error-response hooks. Either chain may
/// answer `{statusCode, body}` to override the response, or abort, which
/// yields the configured abort status with an empty body.
pub async fn respond<S: DocumentStore>(
    context: &AppContext<S>,
    def: Option<&Arc<ResourceDef>>,
    request: &Arc<RequestContext>,
    outcome: Result<(StatusCode, Value), ResourceError>,
) -> Response {
    let mut response = match outcome {
        Ok((status, body)) => match run_response_hooks(context, def, request, HookKind::Response, body).await {
            Ok(Some(body)) => json_response(override_of(status, body)),
            Ok(None) => context.abort_status.into_response(),
            Err(e) => error_response(context, def, request, e).await,
        },
        Err(e) => error_response(context, def, request, e).await,
    };
    let headers: HeaderMap = request.response_headers.lock().clone();
    response.headers_mut().extend(headers);
    response
}

async fn error_response<S: DocumentStore>(
    context: &AppContext<S>,
    def: Option<&Arc<ResourceDef>>,
    request: &Arc<RequestContext>,
    e: ResourceError,
) -> Response {
    let status = e.status_code(context.abort_status);
    if e.is_silent() {
        return status.into_response();
    }
    if status.is_server_error() {
        error!("{} {} failed: {}", request.method, request.path, e);
    }

    let body = serde_json::to_value(ErrorResponse::new(error_reason(&e), e.to_string())).unwrap_or(Value::Null);
    match run_response_hooks(context, def, request, HookKind::ErrorResponse, body.clone()).await {
        Ok(Some(body)) => json_response(override_of(status, body)),
        Ok(None) => context.abort_status.into_response(),
        Err(hook_error) => {
            error!("error-response hook failed on {}: {}", request.path, hook_error);
            json_response((status, body))
        }
    }
}

/// `Ok(None)` when a hook aborted.
async fn run_response_hooks<S: DocumentStore>(
    context: &AppContext<S>,
    def: Option<&Arc<ResourceDef>>,
    request: &Arc<RequestContext>,
    kind: HookKind,
    body: Value,
) -> Result<Option<Value>, ResourceError> {
    let Some(def) = def else {
        return Ok(Some(body));
    };
    match context
        .service
        .hooks()
        .run(def, HookStage::Before, kind, body, request)
        .await?
    {
        HookOutcome::Continue(body) => Ok(Some(body)),
        HookOutcome::Abort => Ok(None),
    }
}

fn override_of(status: StatusCode, body: Value) -> (StatusCode, Value) {
    if let Value::Object(map) = &body {
        if let (Some(code), Some(inner)) = (map.get("statusCode"), map.get("body")) {
            if let Some(code) = code.as_u64().and_then(|c| u16::try_from(c).ok()) {
                if let Ok(status) = StatusCode::from_u16(code) {
                    return (status, inner.clone());
                }
            }
        }
    }
    (status, body)
}

fn json_response((status, body): (StatusCode, Value)) -> Response {
    if body.is_null() {
        return status.into_response();
    }
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_override_of() {
        let (status, body) = override_of(StatusCode::OK, json!({"statusCode": 202, "body": {"ok": true}}));
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, json!({"ok": true}));

        let plain = json!({"people": []});
        assert_eq!(override_of(StatusCode::OK, plain.clone()), (StatusCode::OK, plain));
    }

    #[test]
    fn test_error_body_shape() {
        let e = ResourceError::not_found("person", "a@x.com");
        let body = serde_json::to_value(ErrorResponse::new(error_reason(&e), e.to_string())).unwrap();
        assert_eq!(body, json!({"error": "NotFound", "detail": "person not found: a@x.com"}));
    }
}
