//! HTTP forwarding shared by the proxy controller and the binding resolver.

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reqwest::redirect::Policy;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest request body buffered before forwarding.
pub const MAX_REQUEST_BODY: usize = 100 * 1024 * 1024;

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("invalid upstream url {0:?}")]
    InvalidUrl(String),
    #[error("request body exceeds {} bytes", MAX_REQUEST_BODY)]
    BodyTooLarge,
    #[error("upstream {origin} unavailable: {source}")]
    Unavailable {
        origin: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ForwardError {
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ForwardError::Client(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ForwardError::InvalidUrl(_) | ForwardError::Unavailable { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Thin wrapper over a reqwest client that never follows redirects, so the
/// caller sees exactly what the upstream returned.
#[derive(Clone, Debug)]
pub struct Forwarder {
    client: Client,
}

impl Forwarder {
    pub fn new() -> Result<Self, ForwardError> {
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(ForwardError::Client)?;
        Ok(Self { client })
    }

    /// Send `request` to `origin`, keeping method, path, query, headers and body.
    ///
    /// `extra` headers are added after the request's own, overriding same-named ones.
    pub async fn send(
        &self,
        origin: &str,
        extra: &BTreeMap<String, String>,
        request: Request,
    ) -> Result<reqwest::Response, ForwardError> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", origin.trim_end_matches('/'), path_and_query);
        let url = reqwest::Url::parse(&url).map_err(|_| ForwardError::InvalidUrl(url.clone()))?;

        let body = axum::body::to_bytes(body, MAX_REQUEST_BODY)
            .await
            .map_err(|_| ForwardError::BodyTooLarge)?;

        let mut headers = strip_hop_by_hop(&parts.headers);
        for (name, value) in extra {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "skipping invalid extra header"),
            }
        }

        debug!(method = %parts.method, %url, body_size = body.len(), "forwarding request");
        self.client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|source| ForwardError::Unavailable {
                origin: origin.to_string(),
                source,
            })
    }
}

/// Convert an upstream reply into a streaming axum response.
pub fn into_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = strip_hop_by_hop(upstream.headers());
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop_keeps_end_to_end_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("example.com"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.append("x-multi", HeaderValue::from_static("1"));
        headers.append("x-multi", HeaderValue::from_static("2"));

        let stripped = strip_hop_by_hop(&headers);
        assert!(stripped.get("host").is_none());
        assert!(stripped.get("connection").is_none());
        assert_eq!(stripped.get("content-type").unwrap(), "text/plain");
        assert_eq!(stripped.get_all("x-multi").iter().count(), 2);
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            ForwardError::BodyTooLarge.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ForwardError::InvalidUrl("nope".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn test_refused_connection_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let forwarder = Forwarder::new().unwrap();
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let err = forwarder
            .send(&format!("http://127.0.0.1:{}", port), &BTreeMap::new(), request)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Unavailable { .. }));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
