//! Durable store: namespaced key-value persistence with atomic batches and
//! change notification on a watched namespace.
//!
//! Design:
//! - [`Backend`] is the persistence seam. A batch is all-or-nothing;
//!   iteration yields a namespace in key order.
//! - [`Store`] adds the notification layer: after each committed batch,
//!   every `Put` into the watched namespace is published to subscribers so
//!   the scheduler can admit new tasks without a full rescan. Events are
//!   hints only: a consumer must re-read the record before acting on it,
//!   because the record may already have settled again.

mod memory;
mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::domain::StoreError;

/// Opaque namespace tag. The core owns `tasks`, `meta` and `task-registry`;
/// collaborators add their own domain namespaces (`packages`, `repos`, …).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(Arc<str>);

impl Namespace {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn tasks() -> Self {
        Self::new("tasks")
    }

    pub fn meta() -> Self {
        Self::new("meta")
    }

    pub fn task_registry() -> Self {
        Self::new("task-registry")
    }

    pub fn cache() -> Self {
        Self::new("cache")
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Namespace {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// One operation within an atomic batch.
#[derive(Debug, Clone)]
pub enum Mutation {
    Put {
        ns: Namespace,
        key: String,
        value: Value,
    },
    Del {
        ns: Namespace,
        key: String,
    },
}

impl Mutation {
    pub fn put<T: Serialize>(
        ns: Namespace,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, StoreError> {
        Ok(Self::Put {
            ns,
            key: key.into(),
            value: serde_json::to_value(value)?,
        })
    }

    pub fn put_value(ns: Namespace, key: impl Into<String>, value: Value) -> Self {
        Self::Put {
            ns,
            key: key.into(),
            value,
        }
    }

    pub fn del(ns: Namespace, key: impl Into<String>) -> Self {
        Self::Del {
            ns,
            key: key.into(),
        }
    }
}

/// Persistence port. `apply` must be all-or-nothing: partial application of
/// a batch must never be observable, even across a crash.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, ns: &Namespace, key: &str) -> Result<Option<Value>, StoreError>;

    async fn apply(&self, mutations: &[Mutation]) -> Result<(), StoreError>;

    /// All current entries of `ns`, in key order.
    async fn iterate(&self, ns: &Namespace) -> Result<Vec<(String, Value)>, StoreError>;

    async fn clear(&self, ns: &Namespace) -> Result<(), StoreError>;

    async fn clear_all(&self) -> Result<(), StoreError>;
}

/// A put that reached the watched namespace.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub key: String,
    pub value: Value,
}

/// Backend plus the change-notification layer.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
    watched: Namespace,
    events: broadcast::Sender<StoreEvent>,
}

impl Store {
    /// The channel capacity is generous; a lagging subscriber falls back to
    /// the next full scan, so dropped events are never lost work.
    pub fn new(backend: Arc<dyn Backend>, watched: Namespace) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            backend,
            watched,
            events,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, ns: &Namespace, key: &str) -> Result<Option<Value>, StoreError> {
        self.backend.get(ns, key).await
    }

    pub async fn get_as<T: DeserializeOwned>(
        &self,
        ns: &Namespace,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.backend.get(ns, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn iterate(&self, ns: &Namespace) -> Result<Vec<(String, Value)>, StoreError> {
        self.backend.iterate(ns).await
    }

    /// Commit one atomic batch, then publish the watched-namespace puts.
    pub async fn batch(&self, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        if mutations.is_empty() {
            return Ok(());
        }
        self.backend.apply(&mutations).await?;
        for mutation in &mutations {
            if let Mutation::Put { ns, key, value } = mutation
                && *ns == self.watched
            {
                // No subscriber yet is fine: pre-run controls commit before
                // the scheduler attaches.
                let _ = self.events.send(StoreEvent {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }
}
