//! Reconciles an isolated scope's committed changes into ancestor scopes.
//!
//! An ancestor that never reloads its working set would keep serving stale
//! cached state after a force-created child commits. Walking the parent
//! chain and reloading just the touched identities lets the ancestor
//! observe the commit without discarding and re-fetching its collection.

use std::sync::Arc;

use crate::backend::EntityId;
use crate::error::Result;
use crate::scope::ScopeCore;

/// Ask every ancestor collection to re-read `ids` from the backing store.
///
/// Joined scopes share their ancestors' collection, which already observed
/// every mutation; only owning (typically force-created) scopes have
/// anything to report. Collections shared by several joined ancestors are
/// reloaded once.
pub(crate) async fn refresh_in_ancestors(core: &ScopeCore, ids: &[EntityId]) -> Result<()> {
    if ids.is_empty() || !core.owns_collection() {
        return Ok(());
    }

    let mut seen: Vec<usize> = vec![Arc::as_ptr(core.collection()) as usize];
    let mut refreshed = 0usize;
    let mut cursor = core.parent();
    while let Some(ancestor) = cursor {
        let collection = ancestor.collection();
        let addr = Arc::as_ptr(collection) as usize;
        if !seen.contains(&addr) {
            seen.push(addr);
            for handle in collection.handles() {
                for id in ids {
                    if handle.reload(*id).await? {
                        refreshed += 1;
                    }
                }
            }
        }
        cursor = ancestor.parent();
    }

    tracing::debug!(
        scope = %core.id(),
        identities = ids.len(),
        refreshed,
        "committed identities refreshed in ancestor scopes"
    );
    Ok(())
}
