//! Live-reload script injection and the browser notification channel.

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket};
use axum::http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use flate2::read::GzDecoder;
use std::io::Read;
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::forward::{self, strip_hop_by_hop};

/// Path the injected script connects to.
pub const LIVE_RELOAD_PATH: &str = "/cdn-cgi/live-reload";

/// Inserted verbatim into HTML responses. Reloads the page when the proxy
/// sends `reload`.
pub const RELOAD_SCRIPT: &str = concat!(
    "<script defer type=\"application/javascript\">",
    "(function(){",
    "var p=location.protocol===\"https:\"?\"wss:\":\"ws:\";",
    "var ws=new WebSocket(p+\"//\"+location.host+\"/cdn-cgi/live-reload\");",
    "ws.onmessage=function(e){if(e.data===\"reload\")location.reload();};",
    "})();",
    "</script>"
);

const RELOAD_MESSAGE: &str = "reload";

const MAX_DECOMPRESSED_SIZE: usize = 50 * 1024 * 1024;

pub fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

/// Insert the script before the first `</body>`, or append it when there is none.
pub fn inject(html: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(html.len() + RELOAD_SCRIPT.len());
    match find_ignore_case(html, b"</body>") {
        Some(at) => {
            out.extend_from_slice(&html[..at]);
            out.extend_from_slice(RELOAD_SCRIPT.as_bytes());
            out.extend_from_slice(&html[at..]);
        }
        None => {
            out.extend_from_slice(html);
            out.extend_from_slice(RELOAD_SCRIPT.as_bytes());
        }
    }
    out
}

/// Remove one injected script. `None` if the body carries none.
pub fn strip(html: &[u8]) -> Option<Vec<u8>> {
    let script = RELOAD_SCRIPT.as_bytes();
    let at = html.windows(script.len()).position(|w| w == script)?;
    let mut out = Vec::with_capacity(html.len() - script.len());
    out.extend_from_slice(&html[..at]);
    out.extend_from_slice(&html[at + script.len()..]);
    Some(out)
}

fn find_ignore_case(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

/// Turn an upstream reply into the client response, injecting the script
/// into HTML when `inject_script` is set. Everything else streams through.
pub async fn render(upstream: reqwest::Response, inject_script: bool) -> Response {
    if !inject_script || !is_html(upstream.headers()) {
        return forward::into_response(upstream);
    }

    let encoding = upstream
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase());
    let gzipped = match encoding.as_deref() {
        None | Some("identity") => false,
        Some("gzip") => true,
        Some(other) => {
            debug!(encoding = other, "cannot inject into encoded body, passing through");
            return forward::into_response(upstream);
        }
    };

    let status = upstream.status();
    let mut headers = strip_hop_by_hop(upstream.headers());
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to read upstream html body");
            return (StatusCode::BAD_GATEWAY, format!("failed to read upstream body: {}", e))
                .into_response();
        }
    };
    let body = if gzipped {
        match gunzip(&body) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "gzip decompression failed");
                return (StatusCode::BAD_GATEWAY, e).into_response();
            }
        }
    } else {
        body
    };

    headers.remove(CONTENT_LENGTH);
    headers.remove(CONTENT_ENCODING);
    headers.remove(ETAG);

    let mut response = Response::new(Body::from(inject(&body)));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn gunzip(body: &Bytes) -> Result<Bytes, String> {
    let decoder = GzDecoder::new(body.as_ref());
    let mut decompressed = Vec::with_capacity(body.len().saturating_mul(2));
    let bytes_read = decoder
        .take((MAX_DECOMPRESSED_SIZE + 1) as u64)
        .read_to_end(&mut decompressed)
        .map_err(|e| e.to_string())?;
    if bytes_read > MAX_DECOMPRESSED_SIZE {
        return Err(format!(
            "decompressed html exceeds {}MB limit",
            MAX_DECOMPRESSED_SIZE / 1024 / 1024
        ));
    }
    Ok(Bytes::from(decompressed))
}

/// Fan-out of reload notifications to connected browsers.
#[derive(Clone, Debug)]
pub struct LiveReloadHub {
    tx: broadcast::Sender<()>,
}

impl Default for LiveReloadHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveReloadHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    /// Returns the number of browsers notified.
    pub fn notify(&self) -> usize {
        self.tx.send(()).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

/// Serve one browser until it disconnects.
pub async fn serve_socket(mut socket: WebSocket, mut reloads: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            reload = reloads.recv() => match reload {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    if socket.send(Message::Text(RELOAD_MESSAGE.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("live reload client disconnected");
}
