use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{Json, Response},
};
use log::debug;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::api::query_string::parse_query_pairs;
use crate::api::response::respond;
use crate::error::{ResourceError, ResourceResult};
use crate::logic::hooks::RequestContext;
use crate::logic::service::ResourceService;
use crate::model::{flag, string_list, QueryOptions, ResourceDef};
use crate::store::traits::DocumentStore;

/// Everything a handler needs: the service plus response settings.
pub struct AppContext<S: DocumentStore> {
    pub service: ResourceService<S>,
    pub abort_status: StatusCode,
    pub default_page_size: usize,
}

pub type AppState<S> = Arc<AppContext<S>>;

type QueryPairs = Query<Vec<(String, String)>>;

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Registered resource definitions
pub async fn list_resources<S: DocumentStore + 'static>(State(context): State<AppState<S>>) -> Json<Value> {
    Json(json!({ "resources": context.service.describe() }))
}

pub async fn list_documents<S: DocumentStore + 'static>(
    State(context): State<AppState<S>>,
    Path(collection): Path<String>,
    Query(pairs): QueryPairs,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let query = parse_query_pairs(pairs);
    let request = request_context(method, &uri, &query, headers);
    let def = match context.service.by_route(&collection) {
        Ok(def) => def,
        Err(e) => return respond(&context, None, &request, Err(e)).await,
    };

    let outcome: ResourceResult<(StatusCode, Value)> = async {
        let filter = list_filter(&query)?;
        let options = list_options(&query, context.default_page_size)?;
        let listing = context.service.list(&def, filter, &options, &request).await?;
        let mut body = collection_body(&def, listing.items);
        if let Some(count) = listing.count {
            body.insert("meta".to_string(), json!({ "count": count }));
        }
        Ok((StatusCode::OK, Value::Object(body)))
    }
    .await;
    respond(&context, Some(&def), &request, outcome).await
}

pub async fn create_documents<S: DocumentStore + 'static>(
    State(context): State<AppState<S>>,
    Path(collection): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = request_context(method, &uri, &Value::Null, headers);
    let def = match context.service.by_route(&collection) {
        Ok(def) => def,
        Err(e) => return respond(&context, None, &request, Err(e)).await,
    };

    let outcome: ResourceResult<(StatusCode, Value)> = async {
        let documents = documents_from_body(&def, &parse_body(&body)?)?;
        let mut created = Vec::with_capacity(documents.len());
        // Siblings of a failed document stay written; the first failure is reported
        for result in context.service.create_many(&def, documents, &request).await {
            created.push(result?);
        }
        Ok((StatusCode::CREATED, Value::Object(collection_body(&def, created))))
    }
    .await;
    respond(&context, Some(&def), &request, outcome).await
}

pub async fn delete_collection<S: DocumentStore + 'static>(
    State(context): State<AppState<S>>,
    Path(collection): Path<String>,
    Query(pairs): QueryPairs,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let query = parse_query_pairs(pairs);
    let request = request_context(method, &uri, &query, headers);
    let def = match context.service.by_route(&collection) {
        Ok(def) => def,
        Err(e) => return respond(&context, None, &request, Err(e)).await,
    };

    let outcome: ResourceResult<(StatusCode, Value)> = async {
        let filter = list_filter(&query)?;
        let removed = context
            .service
            .delete_all(&def, &filter, flag(query.get("destroy")), &request)
            .await?;
        debug!("Removed {} {} document(s)", removed.len(), def.name);
        Ok((StatusCode::NO_CONTENT, Value::Null))
    }
    .await;
    respond(&context, Some(&def), &request, outcome).await
}

pub async fn get_documents<S: DocumentStore + 'static>(
    State(context): State<AppState<S>>,
    Path((collection, ids)): Path<(String, String)>,
    Query(pairs): QueryPairs,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let query = parse_query_pairs(pairs);
    let request = request_context(method, &uri, &query, headers);
    let def = match context.service.by_route(&collection) {
        Ok(def) => def,
        Err(e) => return respond(&context, None, &request, Err(e)).await,
    };

    let outcome: ResourceResult<(StatusCode, Value)> = async {
        let options = list_options(&query, context.default_page_size)?;
        let listing = context
            .service
            .get_by_ids(&def, &split_ids(&ids), &options, &request)
            .await?;
        Ok((StatusCode::OK, Value::Object(collection_body(&def, listing.items))))
    }
    .await;
    respond(&context, Some(&def), &request, outcome).await
}

pub async fn replace_document<S: DocumentStore + 'static>(
    State(context): State<AppState<S>>,
    Path((collection, ids)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = request_context(method, &uri, &Value::Null, headers);
    let def = match context.service.by_route(&collection) {
        Ok(def) => def,
        Err(e) => return respond(&context, None, &request, Err(e)).await,
    };

    let outcome: ResourceResult<(StatusCode, Value)> = async {
        let id = single_id(&ids)?;
        let document = match documents_from_body(&def, &parse_body(&body)?)?.as_slice() {
            [document] => document.clone(),
            _ => {
                return Err(ResourceError::BadRequest(
                    "PUT expects exactly one document".to_string(),
                ))
            }
        };
        let replaced = context.service.replace(&def, &id, document, &request).await?;
        let status = if replaced.created {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        };
        Ok((status, Value::Object(collection_body(&def, vec![replaced.document]))))
    }
    .await;
    respond(&context, Some(&def), &request, outcome).await
}

pub async fn patch_document<S: DocumentStore + 'static>(
    State(context): State<AppState<S>>,
    Path((collection, ids)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = request_context(method, &uri, &Value::Null, headers);
    let def = match context.service.by_route(&collection) {
        Ok(def) => def,
        Err(e) => return respond(&context, None, &request, Err(e)).await,
    };

    let outcome: ResourceResult<(StatusCode, Value)> = async {
        let id = single_id(&ids)?;
        let patched = context
            .service
            .patch(&def, &id, &parse_body(&body)?, &request)
            .await?;
        Ok((StatusCode::OK, Value::Object(collection_body(&def, vec![patched]))))
    }
    .await;
    respond(&context, Some(&def), &request, outcome).await
}

pub async fn delete_documents<S: DocumentStore + 'static>(
    State(context): State<AppState<S>>,
    Path((collection, ids)): Path<(String, String)>,
    Query(pairs): QueryPairs,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let query = parse_query_pairs(pairs);
    let request = request_context(method, &uri, &query, headers);
    let def = match context.service.by_route(&collection) {
        Ok(def) => def,
        Err(e) => return respond(&context, None, &request, Err(e)).await,
    };

    let outcome: ResourceResult<(StatusCode, Value)> = async {
        let removed = context
            .service
            .delete_by_ids(&def, &split_ids(&ids), flag(query.get("destroy")), &request)
            .await?;
        debug!("Removed {} {} document(s)", removed.len(), def.name);
        Ok((StatusCode::NO_CONTENT, Value::Null))
    }
    .await;
    respond(&context, Some(&def), &request, outcome).await
}

/// Documents linked from one relationship field of a document.
pub async fn get_related<S: DocumentStore + 'static>(
    State(context): State<AppState<S>>,
    Path((collection, id, field)): Path<(String, String, String)>,
    Query(pairs): QueryPairs,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let query = parse_query_pairs(pairs);
    let request = request_context(method, &uri, &query, headers);
    let def = match context.service.by_route(&collection) {
        Ok(def) => def,
        Err(e) => return respond(&context, None, &request, Err(e)).await,
    };

    let outcome: ResourceResult<(StatusCode, Value)> = async {
        let options = list_options(&query, context.default_page_size)?;
        let listing = context
            .service
            .get_related(&def, &id, &field, &options, &request)
            .await?;
        let route = def
            .reference(&field)
            .and_then(|reference| context.service.resolve(reference.target.as_str()).ok())
            .map(|target| target.route.clone())
            .unwrap_or(field.clone());
        let mut body = Map::new();
        body.insert(route, Value::Array(listing.items));
        if let Some(count) = listing.count {
            body.insert("meta".to_string(), json!({ "count": count }));
        }
        Ok((StatusCode::OK, Value::Object(body)))
    }
    .await;
    respond(&context, Some(&def), &request, outcome).await
}

pub async fn method_not_allowed<S: DocumentStore + 'static>(
    State(context): State<AppState<S>>,
    method: Method,
    uri: Uri,
) -> Response {
    let request = Arc::new(RequestContext::new(method.clone(), uri.path()));
    let e = ResourceError::MethodNotAllowed(format!("{} is not supported on {}", method, uri.path()));
    respond(&context, None, &request, Err(e)).await
}

fn request_context(method: Method, uri: &Uri, query: &Value, headers: HeaderMap) -> Arc<RequestContext> {
    Arc::new(
        RequestContext::new(method, uri.path())
            .with_query(query.clone())
            .with_headers(headers),
    )
}

fn collection_body(def: &ResourceDef, items: Vec<Value>) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert(def.route.clone(), Value::Array(items));
    body
}

fn parse_body(body: &Bytes) -> ResourceResult<Value> {
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| ResourceError::BadRequest(format!("invalid JSON body: {}", e)))
}

/// Accepts `{<route>: [docs]}`, `{<route>: doc}`, a bare array or a bare document.
fn documents_from_body(def: &ResourceDef, body: &Value) -> ResourceResult<Vec<Value>> {
    let payload = match body {
        Value::Object(map) if map.len() == 1 && map.contains_key(&def.route) => &map[&def.route],
        other => other,
    };
    match payload {
        Value::Array(items) if !items.is_empty() => Ok(items.clone()),
        Value::Object(_) => Ok(vec![payload.clone()]),
        _ => Err(ResourceError::BadRequest(format!(
            "expected {} documents in the request body",
            def.name
        ))),
    }
}

fn list_filter(query: &Value) -> ResourceResult<Value> {
    let mut filter = match query.get("filter") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            return Err(ResourceError::BadRequest(format!(
                "filter must be an object, got {}",
                other
            )))
        }
    };
    if let Some(ids) = query.get("ids") {
        filter.insert("id".to_string(), json!({ "$in": string_list(ids) }));
    }
    Ok(if filter.is_empty() {
        Value::Null
    } else {
        Value::Object(filter)
    })
}

fn list_options(query: &Value, default_page_size: usize) -> ResourceResult<QueryOptions> {
    let mut options = QueryOptions::from_value(query)?;
    if options.page.is_some() && options.page_size.is_none() && options.limit.is_none() {
        options.page_size = Some(default_page_size);
    }
    if query.get("includeMeta").is_some_and(|meta| string_list(meta).iter().any(|m| m == "count")) {
        options.count = true;
    }
    Ok(options)
}

fn split_ids(ids: &str) -> Vec<String> {
    ids.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

fn single_id(ids: &str) -> ResourceResult<String> {
    match split_ids(ids).as_slice() {
        [id] => Ok(id.clone()),
        _ => Err(ResourceError::BadRequest(format!(
            "'{}' must name exactly one document",
            ids
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_filter_and_options() {
        let query = json!({
            "filter": {"name": "Dilbert"},
            "ids": "a@x.com,b@x.com",
            "page": "2",
            "includeMeta": "count"
        });
        assert_eq!(
            list_filter(&query).unwrap(),
            json!({"name": "Dilbert", "id": {"$in": ["a@x.com", "b@x.com"]}})
        );
        let options = list_options(&query, 25).unwrap();
        assert_eq!(options.page, Some(2));
        assert_eq!(options.page_size, Some(25));
        assert!(options.count);

        assert_eq!(list_filter(&json!({})).unwrap(), Value::Null);
        assert!(list_filter(&json!({"filter": "x"})).is_err());
    }

    #[test]
    fn test_ids() {
        assert_eq!(split_ids("a, b,,c"), vec!["a", "b", "c"]);
        assert_eq!(single_id("a").unwrap(), "a");
        assert!(single_id("a,b").is_err());
    }
}
