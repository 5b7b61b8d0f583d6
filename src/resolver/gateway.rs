//! Loopback HTTP surface the worker runtime points its bindings at.
//!
//! - `ANY /service/{binding}/{*path}` calls a service binding
//! - `GET /durable-object/{binding}/id-from-name/{name}` derives an object id
//! - `ANY /durable-object/{binding}/object/{id}/{*path}` calls an object

use axum::extract::{Path, Request, State};
use axum::http::uri::{PathAndQuery, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;

use super::{BindingResolver, ResolveError};

pub fn build_router(resolver: BindingResolver) -> Router {
    Router::new()
        .route("/service/:binding", any(service_root))
        .route("/service/:binding/*path", any(service_path))
        .route(
            "/durable-object/:binding/id-from-name/:name",
            get(id_from_name),
        )
        .route("/durable-object/:binding/object/:id", any(object_root))
        .route("/durable-object/:binding/object/:id/*path", any(object_path))
        .route("/health", get(|| async { "ok" }))
        .with_state(resolver)
}

#[derive(Debug, Serialize)]
struct IdResponse {
    id: String,
}

async fn service_root(
    State(resolver): State<BindingResolver>,
    Path(binding): Path<String>,
    request: Request,
) -> Response {
    call_service(resolver, binding, "", request).await
}

async fn service_path(
    State(resolver): State<BindingResolver>,
    Path((binding, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    call_service(resolver, binding, &path, request).await
}

async fn call_service(resolver: BindingResolver, binding: String, path: &str, request: Request) -> Response {
    let request = rewrite_path(request, path);
    resolver
        .fetch_service(&binding, request)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn id_from_name(
    State(resolver): State<BindingResolver>,
    Path((binding, name)): Path<(String, String)>,
) -> Result<Json<IdResponse>, ResolveError> {
    let namespace = resolver.durable_object(&binding)?;
    let id = namespace.id_from_name(&name).await?;
    Ok(Json(IdResponse { id: id.to_string() }))
}

async fn object_root(
    State(resolver): State<BindingResolver>,
    Path((binding, id)): Path<(String, String)>,
    request: Request,
) -> Response {
    call_object(resolver, binding, id, "", request).await
}

async fn object_path(
    State(resolver): State<BindingResolver>,
    Path((binding, id, path)): Path<(String, String, String)>,
    request: Request,
) -> Response {
    call_object(resolver, binding, id, &path, request).await
}

async fn call_object(
    resolver: BindingResolver,
    binding: String,
    id: String,
    path: &str,
    request: Request,
) -> Response {
    object_fetch(resolver, binding, id, path, request)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn object_fetch(
    resolver: BindingResolver,
    binding: String,
    id: String,
    path: &str,
    request: Request,
) -> Result<Response, ResolveError> {
    let namespace = resolver.durable_object(&binding)?;
    let id = namespace.id_from_string(&id)?;
    namespace.get(id).fetch(rewrite_path(request, path)).await
}

/// Replace the gateway prefix with the binding-relative path, keeping the query.
fn rewrite_path(mut request: Request, path: &str) -> Request {
    let query = request.uri().query().map(|q| format!("?{}", q)).unwrap_or_default();
    let target = format!("/{}{}", path.trim_start_matches('/'), query);
    if let Ok(path_and_query) = PathAndQuery::try_from(target.as_str()) {
        let mut parts = request.uri().clone().into_parts();
        parts.path_and_query = Some(path_and_query);
        if let Ok(uri) = Uri::from_parts(parts) {
            *request.uri_mut() = uri;
        }
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_rewrite_path_keeps_query() {
        let rewritten = rewrite_path(request("/service/B/api/items?limit=5"), "api/items");
        assert_eq!(rewritten.uri().path(), "/api/items");
        assert_eq!(rewritten.uri().query(), Some("limit=5"));
    }

    #[test]
    fn test_rewrite_path_root() {
        let rewritten = rewrite_path(request("/service/B"), "");
        assert_eq!(rewritten.uri().path(), "/");
        assert_eq!(rewritten.uri().query(), None);
    }
}
