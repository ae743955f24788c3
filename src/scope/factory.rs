//! Scope creation entry points.

use std::sync::Arc;

use crate::ambient::{self, suppress::SuppressionGuard};
use crate::backend::{IsolationLevel, ResourceFactory};
use crate::error::Result;
use crate::scope::{JoinOption, ReadOnlyScope, ResourceScope, ScopeOptions};

/// Opens [`ResourceScope`]s over one backend factory.
///
/// Service-layer code holds a `ScopeFactory` (usually one per process) and
/// opens a scope per business operation; nested operations open their own
/// and join it.
#[derive(Clone)]
pub struct ScopeFactory {
    backend: Arc<dyn ResourceFactory>,
}

impl ScopeFactory {
    pub fn new(backend: Arc<dyn ResourceFactory>) -> Self {
        Self { backend }
    }

    /// The backend factory scopes create their handles through.
    pub fn backend(&self) -> Arc<dyn ResourceFactory> {
        Arc::clone(&self.backend)
    }

    /// Read-write scope that joins a compatible ambient scope when one is
    /// visible and starts a new unit of work otherwise.
    pub fn begin(&self) -> Result<ResourceScope> {
        self.begin_with(ScopeOptions::default())
    }

    /// Read-only scope, joining like [`begin`](Self::begin).
    pub fn begin_read_only(&self) -> Result<ReadOnlyScope> {
        self.begin_with(ScopeOptions {
            read_only: true,
            ..Default::default()
        })
        .map(ReadOnlyScope::new)
    }

    /// Isolated read-write scope that never joins.
    pub fn begin_new(&self) -> Result<ResourceScope> {
        self.begin_with(ScopeOptions {
            join: JoinOption::ForceCreateNew,
            ..Default::default()
        })
    }

    /// Isolated read-write scope with an explicit transaction.
    pub fn begin_isolated(&self, isolation: IsolationLevel) -> Result<ResourceScope> {
        self.begin_with(ScopeOptions {
            join: JoinOption::ForceCreateNew,
            read_only: false,
            isolation: Some(isolation),
        })
    }

    /// Isolated read-only scope with an explicit transaction.
    pub fn begin_read_only_isolated(&self, isolation: IsolationLevel) -> Result<ReadOnlyScope> {
        self.begin_with(ScopeOptions {
            join: JoinOption::ForceCreateNew,
            read_only: true,
            isolation: Some(isolation),
        })
        .map(ReadOnlyScope::new)
    }

    /// Scope with explicit options.
    pub fn begin_with(&self, options: ScopeOptions) -> Result<ResourceScope> {
        ResourceScope::open(options, Arc::clone(&self.backend))
    }

    /// Hide the ambient stack ahead of manual fan-out.
    ///
    /// Each worker then builds its own isolated scope; release the guard
    /// after all of them have finished.
    pub fn suppress_ambient(&self) -> Result<SuppressionGuard> {
        Ok(SuppressionGuard::new(ambient::current()?))
    }
}
