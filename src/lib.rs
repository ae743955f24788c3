//! Ambient unit-of-work scoping for persistence resources.
//!
//! Service-layer code opens a [`ResourceScope`] per business operation.
//! Nested calls open scopes of their own that transparently join the
//! ambient one, so a whole call chain shares one set of live resource
//! handles and becomes durable exactly once, when the owning scope
//! commits. Callers keep fine control at the edges:
//!
//! 1. [`JoinOption::ForceCreateNew`] isolates a unit of work that commits
//!    independently of any ancestor.
//! 2. [`ScopeFactory::suppress_ambient`] hides the ambient scope before
//!    manual fan-out, forcing each worker onto its own isolated scope.
//! 3. [`ResourceScope::refresh_in_ancestors`] reconciles an isolated
//!    child's committed changes into an ancestor's already-cached handles.
//!
//! Ambient visibility follows the logical call flow across `.await`
//! (task-local, never thread-local); wrap each flow in [`ambient::flow`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use workscope::{ambient, MemoryBackend, MemoryStore, ResourceKey, ScopeFactory};
//!
//! let store = MemoryStore::new();
//! let factory = ScopeFactory::new(MemoryBackend::new(Arc::clone(&store)));
//!
//! ambient::flow(async {
//!     let mut scope = factory.begin()?;
//!     let db = scope.resource(&ResourceKey::from("school")).await?;
//!     // ... query and mutate through the handle ...
//!     scope.commit().await?;
//!     Ok::<_, workscope::ScopeError>(())
//! })
//! .await?;
//! ```

pub mod ambient;
pub mod backend;
pub mod collection;
pub mod error;
pub mod locator;
pub mod scope;

mod refresh;

pub use ambient::AmbientSlot;
pub use ambient::suppress::SuppressionGuard;
pub use backend::memory::{MemoryBackend, MemoryHandle, MemoryStore};
pub use backend::postgres::{PgBackend, PgHandle};
pub use backend::{
    BackendError, EntityId, IsolationLevel, ResourceFactory, ResourceHandle, ResourceKey,
};
pub use collection::ResourceCollection;
pub use error::ScopeError;
pub use locator::ResourceLocator;
pub use scope::factory::ScopeFactory;
pub use scope::{JoinOption, ReadOnlyScope, ResourceScope, ScopeOptions};
