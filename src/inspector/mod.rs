//! Stable debugger endpoint in front of restarting runtimes.
//!
//! DevTools connects once to `/worker/{name}` on the inspector port. The
//! runtime's own debugger socket changes on every reload; sessions follow the
//! latest upstream announced through [`InspectorProxy::set_upstream`].

mod discovery;
mod relay;

pub use discovery::{TargetDescriptor, VersionInfo};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::header::HOST;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};

/// Where one worker's debugger currently lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetState {
    /// Runtime debugger websocket, once a build has reported one.
    pub url: Option<String>,
    /// Set between `reload_start` and the next upstream URL. Upstream drops
    /// during this window are expected and do not end client sessions.
    pub reloading: bool,
}

#[derive(Default)]
struct Inner {
    targets: RwLock<BTreeMap<String, watch::Sender<TargetState>>>,
}

/// Registry of debuggable workers plus the HTTP surface DevTools talks to.
#[derive(Clone, Default)]
pub struct InspectorProxy {
    inner: Arc<Inner>,
}

impl InspectorProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a worker discoverable. Existing state is kept.
    pub fn add_worker(&self, name: &str) {
        let mut targets = self.write();
        targets
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(TargetState::default()).0);
    }

    /// Drop a worker. Open sessions for it are closed.
    pub fn remove_worker(&self, name: &str) {
        if self.write().remove(name).is_some() {
            info!(worker = name, "inspector target removed");
        }
    }

    /// The runtime restarted and its debugger moved.
    pub fn set_upstream(&self, name: &str, url: Option<String>) {
        self.update(name, |state| {
            state.url = url;
            state.reloading = false;
        });
    }

    pub fn set_reloading(&self, name: &str) {
        self.update(name, |state| state.reloading = true);
    }

    pub fn state(&self, name: &str) -> Option<TargetState> {
        self.read().get(name).map(|tx| tx.borrow().clone())
    }

    pub fn workers(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Attachable workers as seen from `host`, in name order. A worker is
    /// attachable once its runtime has reported a debugger URL.
    pub fn targets(&self, host: &str) -> Vec<TargetDescriptor> {
        self.read()
            .iter()
            .filter(|(_, tx)| tx.borrow().url.is_some())
            .map(|(name, _)| TargetDescriptor::new(name, host))
            .collect()
    }

    fn subscribe(&self, name: &str) -> Option<watch::Receiver<TargetState>> {
        self.read().get(name).map(|tx| tx.subscribe())
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut TargetState)) {
        let mut targets = self.write();
        let tx = targets
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(TargetState::default()).0);
        tx.send_modify(f);
        debug!(worker = name, state = ?*tx.borrow(), "inspector target updated");
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, watch::Sender<TargetState>>> {
        self.inner
            .targets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, watch::Sender<TargetState>>> {
        self.inner
            .targets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/json", get(list_targets))
            .route("/json/list", get(list_targets))
            .route("/json/version", get(version))
            .route("/worker/:name", get(attach))
            .with_state(self.clone())
    }
}

fn request_host(headers: &HeaderMap) -> String {
    headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_string()
}

async fn list_targets(
    State(inspector): State<InspectorProxy>,
    headers: HeaderMap,
) -> Json<Vec<TargetDescriptor>> {
    Json(inspector.targets(&request_host(&headers)))
}

async fn version() -> Json<VersionInfo> {
    Json(VersionInfo::current())
}

async fn attach(
    State(inspector): State<InspectorProxy>,
    Path(name): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let Some(target) = inspector.subscribe(&name) else {
        return (StatusCode::NOT_FOUND, format!("no worker named {:?}", name)).into_response();
    };
    info!(worker = %name, "debugger attached");
    upgrade.on_upgrade(move |socket| relay::run_session(name, socket, target))
}
