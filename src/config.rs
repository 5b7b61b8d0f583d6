//! Worker configuration loaded from `devmesh.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "devmesh.toml";

/// Environment variable overriding the shared registry directory.
pub const REGISTRY_PATH_ENV: &str = "DEVMESH_REGISTRY_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Registry key for this worker.
    pub name: String,
    #[serde(default)]
    pub dev: DevConfig,
    #[serde(default)]
    pub services: Vec<ServiceBinding>,
    #[serde(default)]
    pub durable_objects: DurableObjects,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_inspector_port")]
    pub inspector_port: u16,
    /// Loopback port for the outbound binding gateway (0 picks a free port).
    #[serde(default)]
    pub outbound_port: u16,
    #[serde(default)]
    pub live_reload: bool,
    /// Headers callers must attach when reaching this worker through the registry.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            inspector_port: default_inspector_port(),
            outbound_port: 0,
            live_reload: false,
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub binding: String,
    pub service: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableObjects {
    #[serde(default)]
    pub bindings: Vec<DurableObjectBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableObjectBinding {
    pub name: String,
    pub class_name: String,
    /// Worker that owns the class. `None` means the class lives in this worker.
    #[serde(default)]
    pub script_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: None,
            heartbeat_ms: default_heartbeat_ms(),
            ttl_ms: default_ttl_ms(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(1))
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// Explicit path, then `DEVMESH_REGISTRY_PATH`, then `~/.devmesh/registry`.
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        if let Ok(path) = std::env::var(REGISTRY_PATH_ENV) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
        default_registry_path()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_max_buffered")]
    pub max_buffered: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            max_buffered: default_max_buffered(),
        }
    }
}

impl ProxyConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl WorkerConfig {
    /// Minimal config for a named worker with every other field defaulted.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dev: DevConfig::default(),
            services: Vec::new(),
            durable_objects: DurableObjects::default(),
            registry: RegistryConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }

    pub fn service(&self, binding: &str) -> Option<&ServiceBinding> {
        self.services.iter().find(|s| s.binding == binding)
    }

    pub fn durable_object(&self, binding: &str) -> Option<&DurableObjectBinding> {
        self.durable_objects
            .bindings
            .iter()
            .find(|b| b.name == binding)
    }

    /// Durable object classes implemented by this worker itself.
    pub fn exported_classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self
            .durable_objects
            .bindings
            .iter()
            .filter(|b| b.is_local_to(&self.name))
            .map(|b| b.class_name.clone())
            .collect();
        classes.sort();
        classes.dedup();
        classes
    }
}

impl DurableObjectBinding {
    pub fn is_local_to(&self, worker: &str) -> bool {
        match &self.script_name {
            None => true,
            Some(script) => script == worker,
        }
    }
}

pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<WorkerConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
    let config: WorkerConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.as_ref().display()))?;
    if config.name.trim().is_empty() {
        anyhow::bail!("Worker name must not be empty");
    }
    Ok(config)
}

pub fn default_registry_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".devmesh")
        .join("registry")
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_inspector_port() -> u16 {
    9229
}

fn default_heartbeat_ms() -> u64 {
    2_000
}

fn default_ttl_ms() -> u64 {
    10_000
}

fn default_resolve_timeout_ms() -> u64 {
    5_000
}

fn default_settle_ms() -> u64 {
    10
}

fn default_max_buffered() -> usize {
    1024
}
