//! Cross-worker durable object addressing.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::response::Response;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;

use super::{BindingResolver, ResolveError};
use crate::config::DurableObjectBinding;
use crate::forward;
use crate::registry::WorkerDescriptor;

/// Header naming the durable object class a stub call targets.
pub const CLASS_HEADER: &str = "x-devmesh-do-class";
/// Header carrying the hex object id a stub call targets.
pub const ID_HEADER: &str = "x-devmesh-do-id";

const ID_HEX_LEN: usize = 64;

/// Deterministic object identity: the same (class, name) pair yields the same
/// id in every process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DurableObjectId(String);

impl DurableObjectId {
    pub fn from_name(class_name: &str, name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(class_name.as_bytes());
        hasher.update(b":");
        hasher.update(name.as_bytes());
        let digest = hasher.finalize();
        let hex = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self(hex)
    }

    pub fn parse(id: &str) -> Result<Self, ResolveError> {
        let valid = id.len() == ID_HEX_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if valid {
            Ok(Self(id.to_string()))
        } else {
            Err(ResolveError::InvalidId(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DurableObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A durable object binding as seen from the calling worker.
#[derive(Clone)]
pub struct DurableObjectNamespace {
    resolver: BindingResolver,
    binding: DurableObjectBinding,
    owner: String,
}

impl DurableObjectNamespace {
    pub(super) fn new(resolver: BindingResolver, binding: DurableObjectBinding, owner: String) -> Self {
        Self {
            resolver,
            binding,
            owner,
        }
    }

    pub fn class_name(&self) -> &str {
        &self.binding.class_name
    }

    /// Worker that implements the class.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Derive an id after confirming the owner currently exports the class.
    pub async fn id_from_name(&self, name: &str) -> Result<DurableObjectId, ResolveError> {
        self.locate().await?;
        Ok(DurableObjectId::from_name(&self.binding.class_name, name))
    }

    pub fn id_from_string(&self, id: &str) -> Result<DurableObjectId, ResolveError> {
        DurableObjectId::parse(id)
    }

    pub fn get(&self, id: DurableObjectId) -> DurableObjectStub {
        DurableObjectStub {
            namespace: self.clone(),
            id,
        }
    }

    async fn locate(&self) -> Result<WorkerDescriptor, ResolveError> {
        self.resolver
            .resolve_class_owner(&self.owner, &self.binding.class_name)
            .await
    }
}

/// Handle for calling one object. Resolution happens on every call, so the
/// stub keeps working across the owner's restarts and port changes.
#[derive(Clone)]
pub struct DurableObjectStub {
    namespace: DurableObjectNamespace,
    id: DurableObjectId,
}

impl DurableObjectStub {
    pub fn id(&self) -> &DurableObjectId {
        &self.id
    }

    pub async fn fetch(&self, mut request: Request) -> Result<Response, ResolveError> {
        let target = self.namespace.locate().await?;

        let headers = request.headers_mut();
        headers.insert(
            CLASS_HEADER,
            HeaderValue::from_str(&self.namespace.binding.class_name)
                .map_err(|_| ResolveError::InvalidClass(self.namespace.binding.class_name.clone()))?,
        );
        headers.insert(
            ID_HEADER,
            HeaderValue::from_str(self.id.as_str())
                .map_err(|_| ResolveError::InvalidId(self.id.to_string()))?,
        );

        debug!(
            class = %self.namespace.binding.class_name,
            id = %self.id,
            target = %target.name,
            "calling durable object"
        );
        let upstream = self
            .namespace
            .resolver
            .forwarder()
            .send(&target.origin(), &target.headers, request)
            .await?;
        Ok(forward::into_response(upstream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_from_name_is_deterministic() {
        let a = DurableObjectId::from_name("Counter", "room-1");
        let b = DurableObjectId::from_name("Counter", "room-1");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), ID_HEX_LEN);
    }

    #[test]
    fn test_id_depends_on_class_and_name() {
        let base = DurableObjectId::from_name("Counter", "room-1");
        assert_ne!(base, DurableObjectId::from_name("Counter", "room-2"));
        assert_ne!(base, DurableObjectId::from_name("Session", "room-1"));
    }

    #[test]
    fn test_parse_round_trips_derived_id() {
        let id = DurableObjectId::from_name("Counter", "x");
        assert_eq!(DurableObjectId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        assert!(DurableObjectId::parse("").is_err());
        assert!(DurableObjectId::parse("abc").is_err());
        assert!(DurableObjectId::parse(&"G".repeat(ID_HEX_LEN)).is_err());
        assert!(DurableObjectId::parse(&"A".repeat(ID_HEX_LEN)).is_err());
    }
}
