//! Lazily-created, jointly-disposed resource handles for one owning scope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::{
    BackendError, IsolationLevel, ResourceFactory, ResourceHandle, ResourceKey,
};

/// One resource handle per key, created on first request and held for the
/// lifetime of the owning scope.
///
/// A collection belongs to the single logical flow of its owning scope and
/// the scopes joined onto it; there is no internal cross-flow protection.
/// Suppress the ambient stack before fanning out to concurrent workers.
pub struct ResourceCollection {
    factory: Arc<dyn ResourceFactory>,
    read_only: bool,
    isolation: Option<IsolationLevel>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    handles: HashMap<ResourceKey, Arc<dyn ResourceHandle>>,
    disposed: bool,
}

impl ResourceCollection {
    pub(crate) fn new(
        factory: Arc<dyn ResourceFactory>,
        read_only: bool,
        isolation: Option<IsolationLevel>,
    ) -> Self {
        Self {
            factory,
            read_only,
            isolation,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    /// Cached handle for `key`, creating it through the factory on first
    /// request. A new handle's explicit transaction is opened before the
    /// handle becomes visible when the owning scope carries an isolation
    /// level.
    pub async fn get_or_create(
        &self,
        key: &ResourceKey,
    ) -> Result<Arc<dyn ResourceHandle>, BackendError> {
        {
            let inner = self.lock();
            if inner.disposed {
                return Err(BackendError::msg("resource collection is disposed"));
            }
            if let Some(handle) = inner.handles.get(key) {
                return Ok(Arc::clone(handle));
            }
        }

        let handle = self.factory.create(key).await?;
        if let Some(level) = self.isolation {
            handle.begin_transaction(level).await?;
        }

        let mut inner = self.lock();
        if let Some(existing) = inner.handles.get(key) {
            // At most one handle per key; a racing duplicate is released.
            let existing = Arc::clone(existing);
            drop(inner);
            handle.dispose();
            return Ok(existing);
        }
        inner.handles.insert(key.clone(), Arc::clone(&handle));
        tracing::debug!(%key, "resource handle created");
        Ok(handle)
    }

    /// Every handle created so far.
    pub(crate) fn handles(&self) -> Vec<Arc<dyn ResourceHandle>> {
        self.lock().handles.values().cloned().collect()
    }

    /// Commit every handle, stopping at the first backend failure.
    pub(crate) async fn commit_all(&self) -> Result<(), BackendError> {
        for handle in self.handles() {
            handle.commit().await?;
        }
        Ok(())
    }

    /// Dispose every handle exactly once. Later calls are no-ops.
    pub(crate) fn dispose(&self) {
        let handles = {
            let mut inner = self.lock();
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            std::mem::take(&mut inner.handles)
        };
        for handle in handles.into_values() {
            handle.dispose();
        }
    }
}
