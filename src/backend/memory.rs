//! In-memory backend: the reference implementation of the backend contract.
//!
//! A [`MemoryHandle`] buffers mutations per unit of work and applies them to
//! a shared [`MemoryStore`] atomically on commit, the same shape a real
//! change-tracking backend has. Tests lean on it for durability, refresh
//! and disposal assertions; scratch deployments can use it as-is.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::backend::{
    BackendError, EntityId, IsolationLevel, ResourceFactory, ResourceHandle, ResourceKey,
};

/// One durable flush of a handle's buffered mutations.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub key: ResourceKey,
    pub mutations: usize,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct StoreInner {
    tables: HashMap<ResourceKey, HashMap<EntityId, Value>>,
    commits: Vec<CommitRecord>,
}

/// Shared durable state standing in for a database server.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Durable value of an entity, if committed.
    pub fn get(&self, key: &ResourceKey, id: EntityId) -> Option<Value> {
        self.lock().tables.get(key)?.get(&id).cloned()
    }

    /// Number of durable entities under `key`.
    pub fn len(&self, key: &ResourceKey) -> usize {
        self.lock().tables.get(key).map_or(0, HashMap::len)
    }

    /// Commit log, oldest first.
    pub fn commits(&self) -> Vec<CommitRecord> {
        self.lock().commits.clone()
    }

    fn apply(&self, key: &ResourceKey, mutations: Vec<Mutation>) {
        let mut inner = self.lock();
        let count = mutations.len();
        let table = inner.tables.entry(key.clone()).or_default();
        for mutation in mutations {
            match mutation {
                Mutation::Upsert(id, value) => {
                    table.insert(id, value);
                }
                Mutation::Delete(id) => {
                    table.remove(&id);
                }
            }
        }
        inner.commits.push(CommitRecord {
            key: key.clone(),
            mutations: count,
            at: Utc::now(),
        });
    }
}

/// Factory producing [`MemoryHandle`]s over one shared [`MemoryStore`].
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
    created: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(store: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            created: AtomicUsize::new(0),
        })
    }

    /// How many handles this factory has created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ResourceFactory for MemoryBackend {
    async fn create(&self, key: &ResourceKey) -> Result<Arc<dyn ResourceHandle>, BackendError> {
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MemoryHandle {
            key: key.clone(),
            store: Arc::clone(&self.store),
            state: Mutex::new(HandleState::default()),
        }))
    }
}

enum Mutation {
    Upsert(EntityId, Value),
    Delete(EntityId),
}

#[derive(Default)]
struct HandleState {
    pending: Vec<Mutation>,
    /// Identity map of loaded entities; `reload` refreshes it.
    cache: HashMap<EntityId, Value>,
    isolation: Option<IsolationLevel>,
    disposed: bool,
    dispose_calls: usize,
}

/// One unit-of-work session against the shared store.
pub struct MemoryHandle {
    key: ResourceKey,
    store: Arc<MemoryStore>,
    state: Mutex<HandleState>,
}

impl MemoryHandle {
    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load an entity into this handle's identity map: durable state first,
    /// buffered mutations applied on top.
    pub fn load(&self, id: EntityId) -> Option<Value> {
        let mut state = self.lock();
        let mut value = self.store.get(&self.key, id);
        for mutation in &state.pending {
            match mutation {
                Mutation::Upsert(pending_id, pending) if *pending_id == id => {
                    value = Some(pending.clone());
                }
                Mutation::Delete(pending_id) if *pending_id == id => {
                    value = None;
                }
                _ => {}
            }
        }
        if let Some(ref value) = value {
            state.cache.insert(id, value.clone());
        }
        value
    }

    /// Cached view of an entity without touching the store.
    pub fn cached(&self, id: EntityId) -> Option<Value> {
        self.lock().cache.get(&id).cloned()
    }

    /// Buffer an insert or update.
    pub fn upsert(&self, id: EntityId, value: Value) {
        self.lock().pending.push(Mutation::Upsert(id, value));
    }

    /// Buffer a delete.
    pub fn delete(&self, id: EntityId) {
        self.lock().pending.push(Mutation::Delete(id));
    }

    /// Number of buffered, not yet durable mutations.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Isolation level this handle's transaction was opened at.
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.lock().isolation
    }

    /// How many times `dispose` was called.
    pub fn dispose_count(&self) -> usize {
        self.lock().dispose_calls
    }
}

#[async_trait]
impl ResourceHandle for MemoryHandle {
    async fn begin_transaction(&self, level: IsolationLevel) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.isolation.is_some() {
            return Err(BackendError::msg("transaction already open"));
        }
        state.isolation = Some(level);
        Ok(())
    }

    async fn commit(&self) -> Result<(), BackendError> {
        let mutations = {
            let mut state = self.lock();
            if state.disposed {
                return Err(BackendError::msg("handle is disposed"));
            }
            std::mem::take(&mut state.pending)
        };
        self.store.apply(&self.key, mutations);
        Ok(())
    }

    async fn reload(&self, id: EntityId) -> Result<bool, BackendError> {
        let mut state = self.lock();
        if !state.cache.contains_key(&id) {
            return Ok(false);
        }
        match self.store.get(&self.key, id) {
            Some(value) => {
                state.cache.insert(id, value);
            }
            None => {
                state.cache.remove(&id);
            }
        }
        Ok(true)
    }

    fn dispose(&self) {
        let mut state = self.lock();
        state.dispose_calls += 1;
        if state.disposed {
            return;
        }
        state.disposed = true;
        let discarded = state.pending.len();
        state.pending.clear();
        state.cache.clear();
        if discarded > 0 {
            tracing::debug!(key = %self.key, discarded, "memory handle disposed; uncommitted mutations dropped");
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
