//! Ambient handle resolution for repository-style collaborators.

use std::sync::Arc;

use crate::ambient;
use crate::backend::{ResourceHandle, ResourceKey};
use crate::error::{Result, ScopeError};

/// Resolves resource handles from whatever scope is ambient at call time.
///
/// Hand one of these to repositories and other leaf collaborators: they
/// stay oblivious to scope creation and fail fast when a caller forgot to
/// open a scope. A handle is never fabricated outside a unit of work.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLocator;

impl ResourceLocator {
    pub fn new() -> Self {
        Self
    }

    /// Cached handle for `key` from the ambient scope.
    pub async fn get(&self, key: &ResourceKey) -> Result<Arc<dyn ResourceHandle>> {
        let slot = ambient::current()?;
        let Some(scope) = slot.peek() else {
            return Err(ScopeError::NoAmbientScope);
        };
        Ok(scope.collection().get_or_create(key).await?)
    }
}
