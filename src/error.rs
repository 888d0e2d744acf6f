use axum::http::StatusCode;
use thiserror::Error as ThisError;

use crate::model::registry::SchemaError;
use crate::store::traits::StoreError;

/// Errors surfaced by the resource core to the route layer.
#[derive(Debug, ThisError)]
pub enum ResourceError {
    /// Field-level constraint failure raised by a hook.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{resource} not found: {detail}")]
    NotFound { resource: String, detail: String },

    /// Upsert lost every race against concurrent writers.
    #[error("{resource}: unique index conflict persisted after {attempts} attempts")]
    StorageConflict { resource: String, attempts: usize },

    #[error("Cast to {expected} failed for value {value} at path \"{path}\" (field \"{field}\") for resource \"{resource}\"")]
    Cast {
        resource: String,
        field: String,
        path: String,
        expected: String,
        value: String,
    },

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    MethodNotAllowed(String),

    /// Every inverse-side mutation that failed while repairing relationships.
    #[error("relationship repair failed: {}", .0.join("; "))]
    RelationshipRepair(Vec<String>),

    /// A hook cancelled the operation.
    #[error("operation aborted by hook")]
    Aborted,

    #[error("hook failed: {0}")]
    Hook(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ResourceResult<T> = Result<T, ResourceError>;

impl ResourceError {
    pub fn not_found(resource: &str, detail: impl Into<String>) -> Self {
        ResourceError::NotFound {
            resource: resource.to_string(),
            detail: detail.into(),
        }
    }

    pub fn cast(
        resource: &str,
        path: &str,
        expected: impl std::fmt::Display,
        value: &serde_json::Value,
    ) -> Self {
        ResourceError::Cast {
            resource: resource.to_string(),
            field: path.split('.').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            expected: expected.to_string(),
            value: value.to_string(),
        }
    }

    /// HTTP status for this error; hook aborts use the configured status.
    pub fn status_code(&self, abort_status: StatusCode) -> StatusCode {
        match self {
            ResourceError::Validation(_) => StatusCode::FORBIDDEN,
            ResourceError::NotFound { .. } => StatusCode::NOT_FOUND,
            ResourceError::Cast { .. } | ResourceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ResourceError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ResourceError::Aborted => abort_status,
            ResourceError::Schema(SchemaError::UnknownResource(_)) => StatusCode::NOT_FOUND,
            ResourceError::StorageConflict { .. }
            | ResourceError::RelationshipRepair(_)
            | ResourceError::Hook(_)
            | ResourceError::Schema(_)
            | ResourceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller may see the error message.
    pub fn is_silent(&self) -> bool {
        matches!(self, ResourceError::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_mapping() {
        let abort = StatusCode::from_u16(321).unwrap();
        assert_eq!(
            ResourceError::Validation("name".into()).status_code(abort),
            StatusCode::FORBIDDEN
        );
        assert_eq!(ResourceError::Aborted.status_code(abort).as_u16(), 321);
        assert_eq!(
            ResourceError::not_found("person", "x").status_code(abort),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ResourceError::RelationshipRepair(vec!["a".into()]).status_code(abort),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_cast_message_names_path_field_and_resource() {
        let error = ResourceError::cast("person", "nested.field2", "number", &json!("abc"));
        let message = error.to_string();
        assert!(message.contains("nested.field2"));
        assert!(message.contains("\"nested\""));
        assert!(message.contains("person"));
        assert_eq!(error.status_code(StatusCode::IM_A_TEAPOT), StatusCode::BAD_REQUEST);
    }
}
