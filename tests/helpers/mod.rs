#![allow(dead_code)] // Test helpers appear unused when compiled independently

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, Request, State,
    },
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use devmesh::config::WorkerConfig;
use devmesh::registry::{DevRegistry, FileRegistryStore};
use devmesh::resolver::ID_HEADER;
use devmesh::retry::RetryConfig;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path as FsPath;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

const WAIT_ATTEMPTS: usize = 50;
const WAIT_DELAY: Duration = Duration::from_millis(100);

pub const HTML_PAGE: &str = "<html><body><h1>hello</h1></body></html>";

/// Best-effort check for whether binding to loopback is permitted in the current sandbox.
pub async fn can_bind_loopback() -> bool {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true, // treat other errors as non-fatal for skipping
    }
}

/// Find an available TCP port
pub async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Config for a test worker: ephemeral ports, shared registry dir, fast timers.
pub fn worker_config(name: &str, registry_dir: &FsPath) -> WorkerConfig {
    let mut config = WorkerConfig::new(name);
    config.dev.port = 0;
    config.dev.inspector_port = 0;
    config.dev.outbound_port = 0;
    config.registry.path = Some(registry_dir.to_path_buf());
    config.registry.heartbeat_ms = 200;
    config.registry.ttl_ms = 2_000;
    config.registry.resolve_timeout_ms = 3_000;
    config.proxy.settle_ms = 0;
    config
}

/// A registry handle on `dir` as a separate process would open it.
pub fn registry_at(dir: &FsPath) -> DevRegistry {
    DevRegistry::new(Arc::new(FileRegistryStore::new(dir)))
        .with_ttl(Duration::from_secs(2))
        .with_retry(RetryConfig::fixed(Duration::from_millis(20)))
}

#[derive(Clone)]
struct RuntimeState {
    label: String,
    hits: Arc<Mutex<Vec<String>>>,
    counters: Arc<Mutex<HashMap<String, u64>>>,
}

/// Stand-in for a worker runtime process.
pub struct MockRuntime {
    state: RuntimeState,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl MockRuntime {
    /// Paths served so far, in arrival order.
    pub fn hits(&self) -> Vec<String> {
        self.state.hits.lock().unwrap().clone()
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// Spawn a mock runtime that answers with its `label`, return (runtime, origin)
///
/// - `GET /html` returns an HTML page
/// - `GET /slow/{ms}` answers after a delay
/// - `GET /relay?to={url}` fetches `url` and answers `{label} relayed {body}`
/// - `POST /counter` increments a counter keyed by the durable object id header
/// - anything else answers `{label} {path}`
pub async fn spawn_mock_runtime(label: &str) -> (MockRuntime, String) {
    let state = RuntimeState {
        label: label.to_string(),
        hits: Arc::new(Mutex::new(Vec::new())),
        counters: Arc::new(Mutex::new(HashMap::new())),
    };

    let app = Router::new()
        .route("/html", get(html))
        .route("/slow/:ms", get(slow))
        .route("/relay", get(relay))
        .route("/counter", post(counter))
        .fallback(echo)
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock runtime listener");
    let port = listener.local_addr().unwrap().port();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = server.await {
            eprintln!("mock runtime server error: {}", err);
        }
    });

    (
        MockRuntime {
            state,
            shutdown_tx,
            handle,
        },
        format!("http://127.0.0.1:{}", port),
    )
}

fn record(state: &RuntimeState, path: &str) {
    state.hits.lock().unwrap().push(path.to_string());
}

async fn echo(State(state): State<RuntimeState>, request: Request) -> String {
    let path = request
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_default();
    record(&state, &path);
    format!("{} {}", state.label, path)
}

async fn html(State(state): State<RuntimeState>) -> Response {
    record(&state, "/html");
    ([(CONTENT_TYPE, "text/html; charset=utf-8")], HTML_PAGE).into_response()
}

async fn slow(State(state): State<RuntimeState>, Path(ms): Path<u64>) -> String {
    record(&state, &format!("/slow/{}", ms));
    tokio::time::sleep(Duration::from_millis(ms)).await;
    format!("{} slow {}", state.label, ms)
}

/// Calls `to` and wraps its body, like a worker calling back into itself.
async fn relay(
    State(state): State<RuntimeState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    record(&state, "/relay");
    let Some(to) = params.get("to") else {
        return (StatusCode::BAD_REQUEST, "missing to").into_response();
    };
    match reqwest::get(to.as_str()).await {
        Ok(resp) => {
            let body = resp.text().await.unwrap_or_default();
            format!("{} relayed {}", state.label, body).into_response()
        }
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

async fn counter(State(state): State<RuntimeState>, headers: HeaderMap) -> Response {
    let Some(id) = headers.get(ID_HEADER).and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing object id").into_response();
    };
    let mut counters = state.counters.lock().unwrap();
    let count = counters.entry(id.to_string()).or_insert(0);
    *count += 1;
    Json(serde_json::json!({ "id": id, "count": *count, "served_by": state.label })).into_response()
}

/// Stand-in for a runtime's debugger socket at `/ws`.
///
/// Like a real runtime, it only emits events to sessions that sent
/// `Runtime.enable`: the reply is followed by `Runtime.executionContextCreated`
/// and a `Runtime.consoleAPICalled` naming the label. Other text frames are
/// answered with `{"echo": <frame>, "from": <label>}`. `stop` drops every open
/// session.
pub struct MockDebugger {
    kill: broadcast::Sender<()>,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl MockDebugger {
    pub async fn stop(self) {
        let _ = self.kill.send(());
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

#[derive(Clone)]
struct DebuggerState {
    label: String,
    kill: broadcast::Sender<()>,
}

pub async fn spawn_mock_debugger(label: &str) -> (MockDebugger, String) {
    let (kill, _) = broadcast::channel(4);
    let state = DebuggerState {
        label: label.to_string(),
        kill: kill.clone(),
    };
    let app = Router::new().route("/ws", get(debugger)).with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock debugger listener");
    let port = listener.local_addr().unwrap().port();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = server.await {
            eprintln!("mock debugger server error: {}", err);
        }
    });

    (
        MockDebugger {
            kill,
            shutdown_tx,
            handle,
        },
        format!("ws://127.0.0.1:{}/ws", port),
    )
}

async fn debugger(State(state): State<DebuggerState>, upgrade: WebSocketUpgrade) -> Response {
    let kill = state.kill.subscribe();
    upgrade.on_upgrade(move |socket| debugger_session(socket, state.label, kill))
}

async fn debugger_session(mut socket: WebSocket, label: String, mut kill: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = kill.recv() => return,
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let command: serde_json::Value =
                        serde_json::from_str(&text).unwrap_or(serde_json::Value::Null);
                    let replies = if command["method"] == "Runtime.enable" {
                        vec![
                            serde_json::json!({ "id": command["id"], "result": {} }),
                            serde_json::json!({
                                "method": "Runtime.executionContextCreated",
                                "params": { "context": { "id": 1, "name": label } }
                            }),
                            serde_json::json!({
                                "method": "Runtime.consoleAPICalled",
                                "params": {
                                    "type": "log",
                                    "args": [{ "type": "string", "value": format!("hello from {}", label) }]
                                }
                            }),
                        ]
                    } else {
                        vec![serde_json::json!({ "echo": text, "from": label })]
                    };
                    for reply in replies {
                        if socket.send(Message::Text(reply.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
}

pub async fn poll_until<T, F, Fut>(mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..WAIT_ATTEMPTS {
        if let Some(result) = f().await {
            return Some(result);
        }
        tokio::time::sleep(WAIT_DELAY).await;
    }
    None
}
