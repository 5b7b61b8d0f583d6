//! Outbound binding resolution.
//!
//! Service and durable object bindings are declared statically in the worker
//! config but resolved against the dev registry on every call, because the
//! target's address changes whenever it restarts or moves ports.

mod durable_object;
pub mod gateway;

pub use durable_object::{
    DurableObjectId, DurableObjectNamespace, DurableObjectStub, CLASS_HEADER, ID_HEADER,
};

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{DurableObjectBinding, WorkerConfig};
use crate::forward::{self, ForwardError, Forwarder};
use crate::registry::{DevRegistry, Lookup, WorkerDescriptor};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no binding named {0:?}")]
    UnknownBinding(String),
    #[error("worker {worker:?} is not running (not found in the dev registry after {waited_ms}ms)")]
    NotFound { worker: String, waited_ms: u64 },
    #[error("worker {worker:?} does not export durable object class {class:?}")]
    MissingClass { worker: String, class: String },
    #[error("invalid durable object id {0:?}")]
    InvalidId(String),
    #[error("invalid durable object class name {0:?}")]
    InvalidClass(String),
    #[error(transparent)]
    Upstream(#[from] ForwardError),
}

impl ResolveError {
    pub fn status(&self) -> StatusCode {
        match self {
            ResolveError::UnknownBinding(_) => StatusCode::NOT_FOUND,
            ResolveError::InvalidId(_) | ResolveError::InvalidClass(_) => StatusCode::BAD_REQUEST,
            ResolveError::NotFound { .. } | ResolveError::MissingClass { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ResolveError::Upstream(e) => e.status(),
        }
    }

    /// Routing failures (target absent or lacking the class) as opposed to
    /// transport or caller errors.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            ResolveError::NotFound { .. } | ResolveError::MissingClass { .. }
        )
    }
}

impl IntoResponse for ResolveError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[derive(Debug, Default)]
struct Bindings {
    worker: String,
    services: HashMap<String, String>,
    durable_objects: HashMap<String, DurableObjectBinding>,
    resolve_timeout: Duration,
}

impl Bindings {
    fn from_config(config: &WorkerConfig) -> Self {
        Self {
            worker: config.name.clone(),
            services: config
                .services
                .iter()
                .map(|s| (s.binding.clone(), s.service.clone()))
                .collect(),
            durable_objects: config
                .durable_objects
                .bindings
                .iter()
                .map(|b| (b.name.clone(), b.clone()))
                .collect(),
            resolve_timeout: config.registry.resolve_timeout(),
        }
    }
}

struct Inner {
    bindings: RwLock<Bindings>,
    registry: DevRegistry,
    forwarder: Forwarder,
}

/// Routes a worker's outbound binding calls to registry-resolved endpoints.
#[derive(Clone)]
pub struct BindingResolver {
    inner: Arc<Inner>,
}

impl BindingResolver {
    pub fn new(config: &WorkerConfig, registry: DevRegistry, forwarder: Forwarder) -> Self {
        Self {
            inner: Arc::new(Inner {
                bindings: RwLock::new(Bindings::from_config(config)),
                registry,
                forwarder,
            }),
        }
    }

    /// Swap in the bindings and resolve timeout of an updated config.
    pub fn update(&self, config: &WorkerConfig) {
        let mut bindings = self.inner.bindings.write().unwrap_or_else(|p| p.into_inner());
        *bindings = Bindings::from_config(config);
    }

    pub fn resolve_timeout(&self) -> Duration {
        self.inner
            .bindings
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .resolve_timeout
    }

    pub fn registry(&self) -> &DevRegistry {
        &self.inner.registry
    }

    pub(crate) fn forwarder(&self) -> &Forwarder {
        &self.inner.forwarder
    }

    /// Target worker of a service binding.
    pub fn service_target(&self, binding: &str) -> Result<String, ResolveError> {
        let bindings = self.inner.bindings.read().unwrap_or_else(|p| p.into_inner());
        bindings
            .services
            .get(binding)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownBinding(binding.to_string()))
    }

    /// Resolve a worker by name, waiting up to the configured timeout.
    pub async fn resolve_worker(&self, worker: &str) -> Result<WorkerDescriptor, ResolveError> {
        let timeout = self.resolve_timeout();
        self.inner
            .registry
            .resolve_with_retry(worker, timeout)
            .await
            .ok_or_else(|| ResolveError::NotFound {
                worker: worker.to_string(),
                waited_ms: timeout.as_millis() as u64,
            })
    }

    /// Call a service binding, passing the request and response through verbatim.
    #[tracing::instrument(name = "service_binding", skip(self, request), fields(target = tracing::field::Empty))]
    pub async fn fetch_service(&self, binding: &str, request: Request) -> Result<Response, ResolveError> {
        let worker = self.service_target(binding)?;
        tracing::Span::current().record("target", worker.as_str());

        let target = self.resolve_worker(&worker).await.map_err(|e| {
            warn!(binding, error = %e, "service binding unresolved");
            e
        })?;

        debug!(binding, origin = %target.origin(), "dispatching service binding");
        let upstream = self
            .inner
            .forwarder
            .send(&target.origin(), &target.headers, request)
            .await?;
        Ok(forward::into_response(upstream))
    }

    /// Namespace handle for a durable object binding.
    pub fn durable_object(&self, binding: &str) -> Result<DurableObjectNamespace, ResolveError> {
        let bindings = self.inner.bindings.read().unwrap_or_else(|p| p.into_inner());
        let declared = bindings
            .durable_objects
            .get(binding)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownBinding(binding.to_string()))?;
        let owner = declared
            .script_name
            .clone()
            .unwrap_or_else(|| bindings.worker.clone());
        Ok(DurableObjectNamespace::new(self.clone(), declared, owner))
    }

    /// Resolve the worker owning `class`, insisting it currently exports it.
    pub(crate) async fn resolve_class_owner(
        &self,
        worker: &str,
        class: &str,
    ) -> Result<WorkerDescriptor, ResolveError> {
        let timeout = self.resolve_timeout();
        match self
            .inner
            .registry
            .resolve_where(worker, timeout, |d| d.exports_class(class))
            .await
        {
            Lookup::Found(descriptor) => Ok(descriptor),
            Lookup::Rejected(descriptor) => {
                warn!(
                    worker,
                    class,
                    exported = ?descriptor.durable_objects,
                    "durable object class not exported by target"
                );
                Err(ResolveError::MissingClass {
                    worker: worker.to_string(),
                    class: class.to_string(),
                })
            }
            Lookup::Missing => {
                warn!(worker, class, "durable object owner not running");
                Err(ResolveError::NotFound {
                    worker: worker.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceBinding;
    use crate::registry::MemoryRegistryStore;
    use crate::retry::RetryConfig;

    fn resolver_for(config: &WorkerConfig) -> BindingResolver {
        let registry = DevRegistry::new(Arc::new(MemoryRegistryStore::new()))
            .with_retry(RetryConfig::fixed(Duration::from_millis(5)));
        BindingResolver::new(config, registry, Forwarder::new().unwrap())
    }

    fn config_with_bindings() -> WorkerConfig {
        let mut config = WorkerConfig::new("worker-a");
        config.registry.resolve_timeout_ms = 50;
        config.services.push(ServiceBinding {
            binding: "B".to_string(),
            service: "worker-b".to_string(),
        });
        config.durable_objects.bindings.push(DurableObjectBinding {
            name: "COUNTER".to_string(),
            class_name: "Counter".to_string(),
            script_name: Some("worker-b".to_string()),
        });
        config.durable_objects.bindings.push(DurableObjectBinding {
            name: "SESSIONS".to_string(),
            class_name: "Session".to_string(),
            script_name: None,
        });
        config
    }

    #[test]
    fn test_service_target_lookup() {
        let resolver = resolver_for(&config_with_bindings());
        assert_eq!(resolver.service_target("B").unwrap(), "worker-b");
        assert!(matches!(
            resolver.service_target("MISSING"),
            Err(ResolveError::UnknownBinding(_))
        ));
    }

    #[test]
    fn test_durable_object_owner_defaults_to_self() {
        let resolver = resolver_for(&config_with_bindings());
        assert_eq!(resolver.durable_object("COUNTER").unwrap().owner(), "worker-b");
        assert_eq!(resolver.durable_object("SESSIONS").unwrap().owner(), "worker-a");
        assert!(resolver.durable_object("NOPE").is_err());
    }

    #[test]
    fn test_update_replaces_bindings() {
        let resolver = resolver_for(&config_with_bindings());
        let mut updated = WorkerConfig::new("worker-a");
        updated.services.push(ServiceBinding {
            binding: "C".to_string(),
            service: "worker-c".to_string(),
        });
        updated.registry.resolve_timeout_ms = 1_234;
        resolver.update(&updated);

        assert!(resolver.service_target("B").is_err());
        assert_eq!(resolver.service_target("C").unwrap(), "worker-c");
        assert_eq!(resolver.resolve_timeout(), Duration::from_millis(1_234));
    }

    #[tokio::test]
    async fn test_update_applies_new_resolve_timeout() {
        let resolver = resolver_for(&config_with_bindings());
        let mut updated = config_with_bindings();
        updated.registry.resolve_timeout_ms = 0;
        resolver.update(&updated);

        match resolver.resolve_worker("worker-b").await {
            Err(ResolveError::NotFound { waited_ms, .. }) => assert_eq!(waited_ms, 0),
            other => panic!("unexpected result: {:?}", other.map(|d| d.name)),
        }
    }

    #[tokio::test]
    async fn test_unresolved_service_is_routing_error() {
        let resolver = resolver_for(&config_with_bindings());
        let request = Request::builder()
            .uri("/")
            .body(axum::body::Body::empty())
            .unwrap();
        let err = resolver.fetch_service("B", request).await.unwrap_err();
        assert!(err.is_routing());
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_missing_class_is_capability_error() {
        let resolver = resolver_for(&config_with_bindings());
        resolver
            .registry()
            .register(WorkerDescriptor::new("worker-b", "127.0.0.1", 1))
            .await
            .unwrap();

        let namespace = resolver.durable_object("COUNTER").unwrap();
        let err = namespace.id_from_name("room").await.unwrap_err();
        assert!(matches!(err, ResolveError::MissingClass { .. }));
        assert!(err.is_routing());

        resolver
            .registry()
            .register(
                WorkerDescriptor::new("worker-b", "127.0.0.1", 1).with_durable_objects(["Counter"]),
            )
            .await
            .unwrap();
        let id = namespace.id_from_name("room").await.unwrap();
        assert_eq!(id, DurableObjectId::from_name("Counter", "room"));
    }
}
