// src/lib.rs
//! Local multi-worker dev mesh: a file-backed registry of running workers,
//! a reload-aware proxy in front of each worker, binding resolution between
//! workers and a debugger relay that survives restarts.

pub mod cli;
pub mod config;
pub mod forward;
pub mod inspector;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod telemetry;

pub use config::WorkerConfig;
pub use forward::{ForwardError, Forwarder};
pub use inspector::InspectorProxy;
pub use proxy::{Bundle, Phase, ProxyController, ProxyData, ProxyError, ProxySnapshot};
pub use registry::{DevRegistry, RegistryError, WorkerDescriptor};
pub use resolver::{BindingResolver, ResolveError};
pub use retry::RetryConfig;

// Re-export tracing for use in other modules
pub use tracing;
