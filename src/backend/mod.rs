//! Backend contract: the opaque resource handles a scope manages.
//!
//! The scope layer only manages the lifetime and visibility of these
//! handles. What a handle actually is (a pooled connection, a tracked
//! session, an in-memory table set) is the backend's business; call sites
//! that query or mutate downcast via [`ResourceHandle::as_any`].

pub mod memory;
pub mod postgres;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Failure reported by a resource factory or handle.
///
/// The scope layer never interprets backend failures; they propagate
/// unchanged to whoever requested the handle or called commit.
#[derive(Debug, thiserror::Error)]
#[error("backend failure: {0}")]
pub struct BackendError(#[source] Box<dyn std::error::Error + Send + Sync>);

impl BackendError {
    /// Wrap a backend error.
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Box::new(err))
    }

    /// Wrap a plain message.
    pub fn msg(msg: impl Into<String>) -> Self {
        Self(msg.into().into())
    }
}

/// Names one backing store within a collection (one handle per key).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceKey {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for ResourceKey {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a persisted entity, as understood by the refresh bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Transaction isolation requested for force-created scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Creates resource handles on demand.
///
/// Invoked at most once per key per owning scope; the collection caches the
/// result for the rest of the unit of work.
#[async_trait]
pub trait ResourceFactory: Send + Sync {
    async fn create(&self, key: &ResourceKey) -> Result<Arc<dyn ResourceHandle>, BackendError>;
}

/// One live persistence handle.
///
/// Query and mutation operations are opaque to the scope layer and live on
/// the concrete type behind [`as_any`](ResourceHandle::as_any).
#[async_trait]
pub trait ResourceHandle: Send + Sync {
    /// Open an explicit transaction at the given isolation level.
    async fn begin_transaction(&self, level: IsolationLevel) -> Result<(), BackendError>;

    /// Make every buffered mutation durable.
    async fn commit(&self) -> Result<(), BackendError>;

    /// Re-read `id` from the backing store if this handle has it cached.
    /// Returns whether the identity was held.
    async fn reload(&self, id: EntityId) -> Result<bool, BackendError>;

    /// Discard any uncommitted work and release the underlying resource.
    /// Called exactly once, when the owning collection is disposed.
    fn dispose(&self);

    /// Downcast support for backend-specific call sites.
    fn as_any(&self) -> &dyn Any;
}
