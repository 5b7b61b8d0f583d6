use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// A worker's live address and capabilities as published to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub name: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub host: String,
    pub port: u16,
    /// Durable object classes this worker implements.
    #[serde(default)]
    pub durable_objects: BTreeSet<String>,
    /// Headers to attach when proxying to this worker.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl WorkerDescriptor {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            protocol: default_protocol(),
            host: host.into(),
            port,
            durable_objects: BTreeSet::new(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_durable_objects<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.durable_objects = classes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// `protocol://host:port`, bracketing IPv6 literals.
    pub fn origin(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{}://[{}]:{}", self.protocol, self.host, self.port)
        } else {
            format!("{}://{}:{}", self.protocol, self.host, self.port)
        }
    }

    pub fn exports_class(&self, class_name: &str) -> bool {
        self.durable_objects.contains(class_name)
    }
}

fn default_protocol() -> String {
    "http".to_string()
}

/// Identity of the process (and registry handle) that wrote an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerToken {
    pub pid: u32,
    pub instance: u64,
}

impl OwnerToken {
    /// Fresh token for the current process. Two handles in one process get
    /// distinct tokens.
    pub fn generate() -> Self {
        Self {
            pid: std::process::id(),
            instance: rand::random(),
        }
    }
}

/// The persisted unit: descriptor plus owner and liveness heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub descriptor: WorkerDescriptor,
    pub owner: OwnerToken,
    pub heartbeat_at_ms: i64,
}

impl RegistryEntry {
    pub fn new(descriptor: WorkerDescriptor, owner: OwnerToken, now_ms: i64) -> Self {
        Self {
            descriptor,
            owner,
            heartbeat_at_ms: now_ms,
        }
    }

    /// Live while the last heartbeat is within `ttl` of `now_ms`.
    pub fn is_live(&self, now_ms: i64, ttl: Duration) -> bool {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.heartbeat_at_ms) <= ttl_ms
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
