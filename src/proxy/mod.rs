//! Per-worker dev front end.
//!
//! The controller sits between clients and the worker runtime. It buffers
//! requests while the runtime reloads, injects the live-reload script into
//! HTML, owns the worker's listeners and publishes the worker to the registry.

mod controller;
mod listener;
pub mod live_reload;

pub use controller::{ProxyController, ProxySnapshot};
pub use listener::Listener;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::forward::ForwardError;
use crate::registry::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Before the first build has completed.
    Idle,
    Reloading,
    Ready,
}

/// How the bundler emitted the script. Routing never looks at this.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptFormat {
    #[default]
    Modules,
    ServiceWorker,
}

/// A build handed over by the bundler on `reload_start`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub entrypoint: PathBuf,
    #[serde(default)]
    pub format: ScriptFormat,
}

/// Where the freshly started runtime can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyData {
    /// Origin of the user worker, e.g. `http://127.0.0.1:8788`.
    pub user_worker_url: String,
    /// Debugger websocket of the runtime, if it exposes one.
    #[serde(default)]
    pub user_worker_inspector_url: Option<String>,
    /// Headers added to every request forwarded to the runtime.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub live_reload: bool,
}

impl ProxyData {
    pub fn new(user_worker_url: impl Into<String>) -> Self {
        Self {
            user_worker_url: user_worker_url.into(),
            user_worker_inspector_url: None,
            headers: BTreeMap::new(),
            live_reload: false,
        }
    }

    pub fn with_inspector(mut self, url: impl Into<String>) -> Self {
        self.user_worker_inspector_url = Some(url.into());
        self
    }

    pub fn with_live_reload(mut self, enabled: bool) -> Self {
        self.live_reload = enabled;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Upstream(#[from] ForwardError),
    #[error("request buffer full ({0} requests waiting for reload)")]
    BufferFull(usize),
    #[error("worker proxy is shutting down")]
    ShuttingDown,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Upstream(e) => e.status(),
            ProxyError::BufferFull(_) | ProxyError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Bind { .. } | ProxyError::Registry(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
