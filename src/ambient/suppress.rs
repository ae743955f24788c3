//! Suppression of ambient visibility ahead of manual fan-out.
//!
//! Two branches scheduled concurrently (spawned workers, or sibling
//! futures polled under `join!`) must not share one unprotected
//! `ResourceCollection`. Hiding the ambient stack forces every scope the
//! branches create onto the isolated-creation path; each branch wraps
//! itself in [`flow`](crate::ambient::flow) and builds its own root scope.
//! Release the guard only after all workers have finished.

use std::sync::Arc;

use crate::ambient::AmbientSlot;
use crate::scope::ScopeCore;

/// Restores the suppressed ambient stack on release or drop.
pub struct SuppressionGuard {
    slot: Arc<AmbientSlot>,
    saved: Option<Vec<Arc<ScopeCore>>>,
}

impl SuppressionGuard {
    pub(crate) fn new(slot: Arc<AmbientSlot>) -> Self {
        let saved = slot.take_all();
        tracing::debug!(hidden = saved.len(), "ambient scope stack suppressed");
        Self {
            slot,
            saved: Some(saved),
        }
    }

    /// Restore the pre-suppression ambient stack.
    ///
    /// Dropping the guard restores as well; `release` makes the restore
    /// point explicit once all fanned-out workers have finished.
    pub fn release(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            tracing::debug!(restored = saved.len(), "ambient scope stack restored");
            self.slot.restore(saved);
        }
    }
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        self.restore();
    }
}
