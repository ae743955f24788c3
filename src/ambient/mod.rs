//! Flow-scoped storage for the ambient resource scope.
//!
//! The slot follows the logical continuation chain, not the worker thread:
//! it lives in a `tokio::task_local!` binding established by [`flow`], so a
//! scope opened before an `.await` is still ambient after resumption even
//! when the continuation lands on a different worker.
//!
//! Spawned tasks do not inherit the caller's slot. A worker that needs
//! scopes wraps itself in [`flow`] and builds its own root scope, which is
//! exactly the isolation manual fan-out requires (see
//! [`suppress`](crate::ambient::suppress)).

pub mod suppress;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::ScopeError;
use crate::scope::ScopeCore;

tokio::task_local! {
    static ACTIVE_SLOT: Arc<AmbientSlot>;
}

/// Run `fut` with a fresh ambient slot bound to its logical flow.
pub async fn flow<F>(fut: F) -> F::Output
where
    F: Future,
{
    ACTIVE_SLOT.scope(Arc::new(AmbientSlot::new()), fut).await
}

/// The slot bound to the current logical flow.
pub(crate) fn current() -> Result<Arc<AmbientSlot>, ScopeError> {
    ACTIVE_SLOT
        .try_with(Arc::clone)
        .map_err(|_| ScopeError::NoAmbientFlow)
}

/// Strict LIFO stack of the scopes visible to one logical flow.
///
/// A slot belongs to a single flow; the mutex keeps the type `Send` across
/// suspension points, it is never contended in correct programs. Tests may
/// construct a standalone slot and hand it to
/// [`ResourceScope::open_in`](crate::scope::ResourceScope::open_in) instead
/// of binding a task-local flow.
#[derive(Default)]
pub struct AmbientSlot {
    stack: Mutex<Vec<Arc<ScopeCore>>>,
}

impl AmbientSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<ScopeCore>>> {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Currently visible (innermost) scope, if any.
    pub fn peek(&self) -> Option<Arc<ScopeCore>> {
        self.lock().last().cloned()
    }

    /// Number of scopes visible in this flow.
    pub fn depth(&self) -> usize {
        self.lock().len()
    }

    /// Push a newly created scope, making it the visible scope.
    pub(crate) fn push(&self, core: Arc<ScopeCore>) {
        self.lock().push(core);
    }

    /// Pop `core` off the stack, restoring its predecessor.
    ///
    /// # Panics
    ///
    /// Panics if `core` is not the innermost scope. Scopes must be disposed
    /// in the reverse of their creation order; anything else is a defect in
    /// the calling code.
    pub(crate) fn pop(&self, core: &ScopeCore) {
        let mut stack = self.lock();
        let matches = stack.last().is_some_and(|top| top.id() == core.id());
        if matches {
            stack.pop();
            return;
        }
        let found = stack.last().map(|top| top.id().to_string());
        drop(stack);
        panic!(
            "ambient scope stack corrupted: expected scope {} on top, found {:?}; \
             scopes must be disposed in the reverse of their creation order",
            core.id(),
            found,
        );
    }

    /// Take the whole visible stack, hiding every scope from this flow.
    pub(crate) fn take_all(&self) -> Vec<Arc<ScopeCore>> {
        std::mem::take(&mut *self.lock())
    }

    /// Restore a stack previously taken by [`take_all`](Self::take_all).
    ///
    /// # Panics
    ///
    /// Panics if scopes created while the stack was hidden are still live.
    pub(crate) fn restore(&self, saved: Vec<Arc<ScopeCore>>) {
        let mut stack = self.lock();
        let live = stack.len();
        if live != 0 {
            drop(stack);
            panic!(
                "ambient suppression released while {live} scope(s) created under it \
                 are still live"
            );
        }
        *stack = saved;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::ambient::{self, AmbientSlot};
    use crate::backend::memory::{MemoryBackend, MemoryStore};
    use crate::error::ScopeError;
    use crate::scope::factory::ScopeFactory;
    use crate::scope::{ResourceScope, ScopeOptions};

    fn rig() -> ScopeFactory {
        ScopeFactory::new(MemoryBackend::new(MemoryStore::new()))
    }

    #[test]
    fn test_push_pop_balance() {
        let slot = Arc::new(AmbientSlot::new());
        let factory = rig();
        assert!(slot.peek().is_none());

        let outer = ResourceScope::open_in(&slot, ScopeOptions::default(), factory.backend())
            .unwrap();
        assert_eq!(slot.depth(), 1);

        let inner = ResourceScope::open_in(&slot, ScopeOptions::default(), factory.backend())
            .unwrap();
        assert_eq!(slot.depth(), 2);
        assert_eq!(slot.peek().unwrap().id(), inner.id());

        drop(inner);
        assert_eq!(slot.peek().unwrap().id(), outer.id());
        drop(outer);
        assert!(slot.peek().is_none());
    }

    #[test]
    #[should_panic(expected = "reverse of their creation order")]
    fn test_out_of_order_disposal_panics() {
        let slot = Arc::new(AmbientSlot::new());
        let factory = rig();

        let mut outer =
            ResourceScope::open_in(&slot, ScopeOptions::default(), factory.backend()).unwrap();
        let _inner =
            ResourceScope::open_in(&slot, ScopeOptions::default(), factory.backend()).unwrap();

        // Disposing the outer scope while the inner is still live.
        outer.dispose();
    }

    #[test]
    fn test_balance_restored_on_unwind() {
        let slot = Arc::new(AmbientSlot::new());
        let factory = rig();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope =
                ResourceScope::open_in(&slot, ScopeOptions::default(), factory.backend()).unwrap();
            panic!("mid-operation failure");
        }));

        assert!(result.is_err());
        assert!(slot.peek().is_none(), "slot must return to its pre-creation value");
    }

    #[tokio::test]
    async fn test_no_flow_on_bare_task() {
        let factory = rig();
        assert!(matches!(factory.begin(), Err(ScopeError::NoAmbientFlow)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ambient_survives_suspension() {
        let factory = rig();
        ambient::flow(async {
            let scope = factory.begin().unwrap();

            // Suspend; the continuation may resume on a different worker.
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;

            let joined = factory.begin().unwrap();
            assert!(!joined.owns_collection());
            assert!(Arc::ptr_eq(scope.collection(), joined.collection()));
        })
        .await;
    }

    #[tokio::test]
    async fn test_spawned_task_does_not_inherit_flow() {
        let factory = rig();
        ambient::flow(async {
            let _scope = factory.begin().unwrap();

            let inner_factory = factory.clone();
            let spawned = tokio::spawn(async move { inner_factory.begin().err() });
            let err = spawned.await.unwrap();
            assert!(matches!(err, Some(ScopeError::NoAmbientFlow)));
        })
        .await;
    }
}
