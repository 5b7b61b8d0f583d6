//! Cross-process directory of running dev workers.
//!
//! Every worker publishes a [`WorkerDescriptor`] under its own name and keeps
//! it alive with a heartbeat. Entries whose heartbeat is older than the TTL
//! read as absent, so a crashed worker never leaves a dangling route.

mod descriptor;
mod store;

pub use descriptor::{OwnerToken, RegistryEntry, WorkerDescriptor};
pub use store::{validate_name, FileRegistryStore, MemoryRegistryStore, RegistryError, RegistryStore};

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::retry::{poll_until, RetryConfig};
use descriptor::now_ms;

const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Outcome of a conditional lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(WorkerDescriptor),
    /// Present and live, but the condition never held before the deadline.
    Rejected(WorkerDescriptor),
    Missing,
}

/// Result of a heartbeat attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Refreshed,
    /// The entry is gone (pruned or deleted by hand); re-register to recover.
    Missing,
    /// Another owner has taken the name over.
    Displaced(OwnerToken),
}

/// Typed, liveness-aware view over a [`RegistryStore`].
#[derive(Clone)]
pub struct DevRegistry {
    store: Arc<dyn RegistryStore>,
    owner: OwnerToken,
    ttl: Duration,
    retry: RetryConfig,
}

impl DevRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            owner: OwnerToken::generate(),
            ttl: DEFAULT_TTL,
            retry: RetryConfig::default(),
        }
    }

    /// File-backed registry at the configured (or default) shared directory.
    pub fn from_config(config: &RegistryConfig) -> Self {
        let path = config.resolved_path();
        debug!(path = %path.display(), "using registry directory");
        Self::new(Arc::new(FileRegistryStore::new(path))).with_ttl(config.ttl())
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn owner(&self) -> OwnerToken {
        self.owner
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Publish (or wholesale replace) the descriptor under its name.
    pub async fn register(&self, descriptor: WorkerDescriptor) -> Result<(), RegistryError> {
        validate_name(&descriptor.name)?;
        let now = now_ms();

        if let Some(previous) = self.read_entry(&descriptor.name).await {
            if previous.owner != self.owner && previous.is_live(now, self.ttl) {
                warn!(
                    name = %descriptor.name,
                    previous_pid = previous.owner.pid,
                    "replacing a live registration owned by another process"
                );
            }
        }

        let name = descriptor.name.clone();
        let origin = descriptor.origin();
        self.write_entry(RegistryEntry::new(descriptor, self.owner, now))
            .await?;
        info!(name = %name, origin = %origin, "registered worker");
        Ok(())
    }

    /// Refresh the heartbeat on an entry this handle owns.
    pub async fn heartbeat(&self, name: &str) -> Result<Heartbeat, RegistryError> {
        validate_name(name)?;
        match self.read_entry(name).await {
            Some(mut entry) if entry.owner == self.owner => {
                entry.heartbeat_at_ms = now_ms();
                self.write_entry(entry).await?;
                Ok(Heartbeat::Refreshed)
            }
            Some(entry) => Ok(Heartbeat::Displaced(entry.owner)),
            None => Ok(Heartbeat::Missing),
        }
    }

    /// Remove our own entry. Entries owned by someone else are left alone.
    pub async fn unregister(&self, name: &str) -> Result<bool, RegistryError> {
        validate_name(name)?;
        match self.read_entry(name).await {
            Some(entry) if entry.owner == self.owner => {
                let removed = self.store.delete(name).await?;
                info!(name, "unregistered worker");
                Ok(removed)
            }
            Some(_) => {
                debug!(name, "not unregistering entry owned by another process");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Single lookup. Missing, unreadable and stale entries are all absent.
    pub async fn resolve(&self, name: &str) -> Option<WorkerDescriptor> {
        let entry = self.read_entry(name).await?;
        if entry.is_live(now_ms(), self.ttl) {
            Some(entry.descriptor)
        } else {
            debug!(name, heartbeat_at_ms = entry.heartbeat_at_ms, "ignoring stale entry");
            None
        }
    }

    /// Poll until the worker appears or `max_wait` elapses.
    #[tracing::instrument(name = "registry_resolve", skip(self), fields(max_wait_ms = max_wait.as_millis() as u64))]
    pub async fn resolve_with_retry(&self, name: &str, max_wait: Duration) -> Option<WorkerDescriptor> {
        poll_until(&self.retry, max_wait, || self.resolve(name)).await
    }

    /// Poll until the worker appears with a descriptor satisfying `accept`.
    pub async fn resolve_where<F>(&self, name: &str, max_wait: Duration, accept: F) -> Lookup
    where
        F: Fn(&WorkerDescriptor) -> bool,
    {
        let last_seen: std::sync::Mutex<Option<WorkerDescriptor>> = std::sync::Mutex::new(None);
        let found = poll_until(&self.retry, max_wait, || {
            let attempt = self.resolve(name);
            let last_seen = &last_seen;
            let accept = &accept;
            async move {
                let seen = attempt.await;
                let hit = seen.as_ref().filter(|d| accept(d)).cloned();
                if hit.is_none() {
                    *last_seen.lock().unwrap_or_else(|p| p.into_inner()) = seen;
                }
                hit
            }
        })
        .await;

        let last_seen = last_seen.into_inner().unwrap_or_else(|p| p.into_inner());
        match (found, last_seen) {
            (Some(descriptor), _) => Lookup::Found(descriptor),
            (None, Some(descriptor)) => Lookup::Rejected(descriptor),
            (None, None) => Lookup::Missing,
        }
    }

    /// All live descriptors, sorted by name.
    pub async fn list(&self) -> Result<Vec<WorkerDescriptor>, RegistryError> {
        let now = now_ms();
        let mut live = Vec::new();
        for key in self.store.keys().await? {
            if let Some(entry) = self.read_entry(&key).await {
                if entry.is_live(now, self.ttl) {
                    live.push(entry.descriptor);
                }
            }
        }
        Ok(live)
    }

    /// Delete stale and unreadable entries. Returns the removed names.
    pub async fn prune(&self) -> Result<Vec<String>, RegistryError> {
        let now = now_ms();
        let mut removed = Vec::new();
        for key in self.store.keys().await? {
            let stale = match self.read_entry(&key).await {
                Some(entry) => !entry.is_live(now, self.ttl),
                None => true,
            };
            if stale && self.store.delete(&key).await? {
                info!(name = %key, "pruned stale registry entry");
                removed.push(key);
            }
        }
        Ok(removed)
    }

    async fn read_entry(&self, name: &str) -> Option<RegistryEntry> {
        let raw = match self.store.get(name).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(name, error = %e, "registry read failed");
                return None;
            }
        };
        match serde_json::from_slice::<RegistryEntry>(&raw) {
            Ok(entry) if entry.descriptor.name == name => Some(entry),
            Ok(entry) => {
                warn!(name, stored = %entry.descriptor.name, "registry entry name mismatch");
                None
            }
            Err(e) => {
                warn!(name, error = %e, "ignoring malformed registry entry");
                None
            }
        }
    }

    async fn write_entry(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        let body = serde_json::to_vec_pretty(&entry)?;
        self.store
            .put(&entry.descriptor.name, Bytes::from(body))
            .await
    }
}
