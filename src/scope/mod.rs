//! The unit-of-work scope: joining, forced isolation, commit, disposal.
//!
//! A [`ResourceScope`] is opened on entry to a business operation. Nested
//! operations open their own scopes; with [`JoinOption::JoinExisting`] they
//! borrow the ambient scope's [`ResourceCollection`], so an entire call
//! chain works against the same live handles and becomes durable exactly
//! once, when the owning scope commits. [`JoinOption::ForceCreateNew`]
//! starts an isolated unit of work that commits on its own, regardless of
//! what any ancestor later does.

pub mod factory;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::ambient::{self, AmbientSlot};
use crate::backend::{EntityId, IsolationLevel, ResourceFactory, ResourceHandle, ResourceKey};
use crate::collection::ResourceCollection;
use crate::error::{Result, ScopeError};

/// Whether a new scope reuses the ambient unit of work or starts its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinOption {
    /// Reuse a compatible ambient scope's collection; commit is deferred to
    /// the owner.
    #[default]
    JoinExisting,
    /// Always create an isolated collection that commits independently.
    ForceCreateNew,
}

/// Options for opening a [`ResourceScope`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeOptions {
    pub join: JoinOption,
    pub read_only: bool,
    /// Explicit transaction isolation. Only valid with
    /// [`JoinOption::ForceCreateNew`]; an already-active ambient scope
    /// cannot retroactively adopt a different level.
    pub isolation: Option<IsolationLevel>,
}

#[derive(Default)]
struct ScopeState {
    committed: bool,
    disposed: bool,
}

/// Shared state of one scope: referenced from the ambient stack and, by
/// descendants, as their parent link.
pub struct ScopeCore {
    id: Uuid,
    read_only: bool,
    owns_collection: bool,
    /// Ambient scope at creation time. Recorded for force-created scopes
    /// too; the refresh bridge walks it.
    parent: Option<Arc<ScopeCore>>,
    collection: Arc<ResourceCollection>,
    state: Mutex<ScopeState>,
}

impl ScopeCore {
    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn owns_collection(&self) -> bool {
        self.owns_collection
    }

    pub(crate) fn parent(&self) -> Option<&Arc<ScopeCore>> {
        self.parent.as_ref()
    }

    pub(crate) fn collection(&self) -> &Arc<ResourceCollection> {
        &self.collection
    }

    fn is_committed(&self) -> bool {
        self.lock().committed
    }

    fn set_committed(&self) {
        self.lock().committed = true;
    }

    fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Flip to disposed; returns whether this call made the transition.
    fn mark_disposed(&self) -> bool {
        let mut state = self.lock();
        let first = !state.disposed;
        state.disposed = true;
        first
    }
}

/// A unit of work. Opened on entry to a business operation and disposed on
/// every exit path, explicitly or by `Drop` during unwind.
pub struct ResourceScope {
    core: Arc<ScopeCore>,
    slot: Arc<AmbientSlot>,
}

impl ResourceScope {
    /// Open a scope according to `options`, consulting the ambient slot of
    /// the current flow.
    pub fn open(options: ScopeOptions, factory: Arc<dyn ResourceFactory>) -> Result<Self> {
        let slot = ambient::current()?;
        Self::open_in(&slot, options, factory)
    }

    /// Open a scope against an explicit slot.
    ///
    /// Unit tests inject a standalone [`AmbientSlot`] here instead of
    /// binding a task-local flow.
    pub fn open_in(
        slot: &Arc<AmbientSlot>,
        options: ScopeOptions,
        factory: Arc<dyn ResourceFactory>,
    ) -> Result<Self> {
        if options.isolation.is_some() && options.join == JoinOption::JoinExisting {
            return Err(ScopeError::IsolationRequiresNewScope);
        }

        let ambient_scope = slot.peek();
        let core = match (options.join, ambient_scope) {
            (JoinOption::JoinExisting, Some(parent)) => {
                if parent.read_only() && !options.read_only {
                    return Err(ScopeError::ReadWriteInsideReadOnly);
                }
                Arc::new(ScopeCore {
                    id: Uuid::new_v4(),
                    read_only: options.read_only,
                    owns_collection: false,
                    collection: Arc::clone(parent.collection()),
                    parent: Some(parent),
                    state: Mutex::new(ScopeState::default()),
                })
            }
            (_, ambient_scope) => Arc::new(ScopeCore {
                id: Uuid::new_v4(),
                read_only: options.read_only,
                owns_collection: true,
                collection: Arc::new(ResourceCollection::new(
                    factory,
                    options.read_only,
                    options.isolation,
                )),
                parent: ambient_scope,
                state: Mutex::new(ScopeState::default()),
            }),
        };

        tracing::debug!(
            scope = %core.id,
            joined = !core.owns_collection,
            read_only = core.read_only,
            depth = slot.depth() + 1,
            "scope opened"
        );
        slot.push(Arc::clone(&core));
        Ok(Self {
            core,
            slot: Arc::clone(slot),
        })
    }

    /// Unique id of this scope.
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// Whether this scope owns its collection (commits) or borrows an
    /// ancestor's (defers).
    pub fn owns_collection(&self) -> bool {
        self.core.owns_collection
    }

    pub fn is_read_only(&self) -> bool {
        self.core.read_only
    }

    /// The collection this scope reads and mutates through. Borrowing
    /// scopes return the owning ancestor's collection.
    pub fn collection(&self) -> &Arc<ResourceCollection> {
        &self.core.collection
    }

    /// Cached handle for `key`, created through the backend factory on
    /// first request within this unit of work.
    pub async fn resource(&self, key: &ResourceKey) -> Result<Arc<dyn ResourceHandle>> {
        if self.core.is_disposed() {
            return Err(ScopeError::Disposed(self.core.id));
        }
        Ok(self.core.collection.get_or_create(key).await?)
    }

    /// Make the unit of work durable.
    ///
    /// Owning scopes flush every handle; a second call after a successful
    /// commit is a no-op. Borrowing scopes return immediately: commit is
    /// deferred to the owning ancestor, which is what makes a joined chain
    /// atomic. Nothing becomes durable before the owner commits.
    pub async fn commit(&mut self) -> Result<()> {
        if self.core.read_only {
            return Err(ScopeError::CommitOnReadOnly);
        }
        if self.core.is_disposed() {
            return Err(ScopeError::Disposed(self.core.id));
        }
        if !self.core.owns_collection {
            tracing::debug!(scope = %self.core.id, "commit deferred to the owning scope");
            return Ok(());
        }
        if self.core.is_committed() {
            return Ok(());
        }

        self.core.collection.commit_all().await?;
        self.core.set_committed();
        tracing::info!(
            scope = %self.core.id,
            depth = self.slot.depth(),
            "unit of work committed"
        );
        Ok(())
    }

    /// Report identities committed by this isolated scope back to any
    /// ancestor whose collection already cached them. See
    /// [`crate::scope`]-level docs and the refresh bridge.
    pub async fn refresh_in_ancestors(&self, ids: &[EntityId]) -> Result<()> {
        crate::refresh::refresh_in_ancestors(&self.core, ids).await
    }

    /// Release this scope: pop its ambient stack entry and, when owning,
    /// dispose the collection, discarding anything never committed.
    ///
    /// Idempotent, and also run on `Drop`, so every exit path including
    /// panics restores the previous ambient value and leaks nothing.
    pub fn dispose(&mut self) {
        if !self.core.mark_disposed() {
            return;
        }
        self.slot.pop(&self.core);
        if self.core.owns_collection {
            if !self.core.is_committed() && !self.core.read_only {
                tracing::warn!(
                    scope = %self.core.id,
                    "scope disposed without commit; buffered mutations discarded"
                );
            }
            self.core.collection.dispose();
        }
        tracing::debug!(scope = %self.core.id, "scope disposed");
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A scope that can never commit.
///
/// Reads go through the same ambient machinery and disposal releases
/// everything, but the type exposes no commit at all, so read-only call
/// chains are checked at compile time rather than at runtime.
pub struct ReadOnlyScope {
    inner: ResourceScope,
}

impl ReadOnlyScope {
    pub(crate) fn new(inner: ResourceScope) -> Self {
        debug_assert!(inner.is_read_only());
        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    pub fn owns_collection(&self) -> bool {
        self.inner.owns_collection()
    }

    pub fn collection(&self) -> &Arc<ResourceCollection> {
        self.inner.collection()
    }

    /// Cached handle for `key`, as [`ResourceScope::resource`].
    pub async fn resource(&self, key: &ResourceKey) -> Result<Arc<dyn ResourceHandle>> {
        self.inner.resource(key).await
    }

    pub fn dispose(&mut self) {
        self.inner.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::ambient;
    use crate::backend::memory::{MemoryBackend, MemoryHandle, MemoryStore};
    use crate::backend::{EntityId, IsolationLevel, ResourceHandle, ResourceKey};
    use crate::error::ScopeError;
    use crate::scope::factory::ScopeFactory;
    use crate::scope::{JoinOption, ScopeOptions};

    fn school() -> ResourceKey {
        ResourceKey::from("school")
    }

    fn rig() -> (Arc<MemoryStore>, ScopeFactory) {
        let store = MemoryStore::new();
        let factory = ScopeFactory::new(MemoryBackend::new(Arc::clone(&store)));
        (store, factory)
    }

    fn as_memory(handle: &Arc<dyn ResourceHandle>) -> &MemoryHandle {
        handle.as_any().downcast_ref().expect("memory handle")
    }

    /// Nested service method: buffers one entity and commits its own scope.
    /// Joined onto an ambient scope, the commit defers to the owner.
    async fn create_student(
        factory: &ScopeFactory,
        id: EntityId,
        name: &str,
    ) -> Result<(), ScopeError> {
        let mut scope = factory.begin()?;
        let db = scope.resource(&school()).await?;
        as_memory(&db).upsert(id, json!({ "name": name, "welcome_email_sent": false }));
        scope.commit().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_joined_scope_shares_the_ambient_collection() {
        let (_store, factory) = rig();
        ambient::flow(async {
            let outer = factory.begin().unwrap();
            let inner = factory.begin().unwrap();

            assert!(outer.owns_collection());
            assert!(!inner.owns_collection());
            assert!(Arc::ptr_eq(outer.collection(), inner.collection()));

            let a = inner.resource(&school()).await.unwrap();
            let b = outer.resource(&school()).await.unwrap();
            assert!(Arc::ptr_eq(&a, &b));
        })
        .await;
    }

    #[tokio::test]
    async fn test_forced_scope_gets_its_own_collection() {
        let (_store, factory) = rig();
        ambient::flow(async {
            let outer = factory.begin().unwrap();
            let forced = factory.begin_new().unwrap();

            assert!(forced.owns_collection());
            assert!(!Arc::ptr_eq(outer.collection(), forced.collection()));
        })
        .await;
    }

    #[tokio::test]
    async fn test_joined_chain_commits_once_at_the_owner() {
        let (store, factory) = rig();
        let alice = EntityId::random();
        let bob = EntityId::random();

        ambient::flow(async {
            let mut owner = factory.begin().unwrap();
            create_student(&factory, alice, "Alice").await.unwrap();
            create_student(&factory, bob, "Bob").await.unwrap();

            // Nothing is durable until the owner commits.
            assert_eq!(store.len(&school()), 0);
            owner.commit().await.unwrap();
        })
        .await;

        assert_eq!(store.len(&school()), 2);
        assert_eq!(store.commits().len(), 1, "one flush for the whole chain");
        assert_eq!(store.commits()[0].mutations, 2);
    }

    #[tokio::test]
    async fn test_mutations_from_a_disposed_joined_scope_survive_owner_commit() {
        let (store, factory) = rig();
        let alice = EntityId::random();

        ambient::flow(async {
            let mut owner = factory.begin().unwrap();
            {
                // Joined scope buffers a mutation and disposes without
                // calling commit at all.
                let joined = factory.begin().unwrap();
                let db = joined.resource(&school()).await.unwrap();
                as_memory(&db).upsert(alice, json!({ "name": "Alice" }));
            }
            owner.commit().await.unwrap();
        })
        .await;

        assert!(store.get(&school(), alice).is_some());
    }

    #[tokio::test]
    async fn test_failure_before_owner_commit_discards_the_whole_chain() {
        let (store, factory) = rig();

        let result: Result<(), ScopeError> = ambient::flow(async {
            let mut owner = factory.begin()?;
            create_student(&factory, EntityId::random(), "Julie").await?;
            // Mid-chain failure: the first student was already buffered.
            Err(ScopeError::NoAmbientScope)?;
            owner.commit().await?;
            Ok(())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(store.len(&school()), 0, "zero of the mutations may be durable");
    }

    #[tokio::test]
    async fn test_borrowing_commit_never_reaches_the_backend() {
        let (store, factory) = rig();
        ambient::flow(async {
            let _owner = factory.begin().unwrap();
            create_student(&factory, EntityId::random(), "Mary")
                .await
                .unwrap();
            // The joined scope committed; the owner never did.
        })
        .await;

        assert_eq!(store.len(&school()), 0);
        assert!(store.commits().is_empty());
    }

    #[tokio::test]
    async fn test_forced_commit_is_independent_of_the_ancestor() {
        let (store, factory) = rig();
        let kept = EntityId::random();
        let discarded = EntityId::random();

        ambient::flow(async {
            let owner = factory.begin().unwrap();
            let db = owner.resource(&school()).await.unwrap();
            as_memory(&db).upsert(discarded, json!({ "name": "never persisted" }));

            {
                let mut forced = factory.begin_new().unwrap();
                let forced_db = forced.resource(&school()).await.unwrap();
                as_memory(&forced_db).upsert(kept, json!({ "name": "persisted" }));
                forced.commit().await.unwrap();
            }
            // The ancestor is discarded without ever committing.
        })
        .await;

        assert!(store.get(&school(), kept).is_some());
        assert!(store.get(&school(), discarded).is_none());
    }

    #[tokio::test]
    async fn test_commit_is_idempotent_after_success() {
        let (store, factory) = rig();
        ambient::flow(async {
            let mut scope = factory.begin().unwrap();
            let db = scope.resource(&school()).await.unwrap();
            as_memory(&db).upsert(EntityId::random(), json!({ "name": "Mary" }));

            scope.commit().await.unwrap();
            scope.commit().await.unwrap();
        })
        .await;

        assert_eq!(store.commits().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_on_read_only_scope_fails() {
        let (_store, factory) = rig();
        ambient::flow(async {
            let mut scope = factory
                .begin_with(ScopeOptions {
                    read_only: true,
                    ..Default::default()
                })
                .unwrap();
            assert!(matches!(
                scope.commit().await,
                Err(ScopeError::CommitOnReadOnly)
            ));
        })
        .await;
    }

    #[tokio::test]
    async fn test_read_only_scope_joins_a_read_write_ancestor() {
        let (_store, factory) = rig();
        ambient::flow(async {
            let owner = factory.begin().unwrap();
            let reader = factory.begin_read_only().unwrap();
            assert!(!reader.owns_collection());
            assert!(Arc::ptr_eq(owner.collection(), reader.collection()));
        })
        .await;
    }

    #[tokio::test]
    async fn test_read_write_scope_cannot_join_a_read_only_ancestor() {
        let (_store, factory) = rig();
        ambient::flow(async {
            let _reader = factory.begin_read_only().unwrap();
            assert!(matches!(
                factory.begin(),
                Err(ScopeError::ReadWriteInsideReadOnly)
            ));
        })
        .await;
    }

    #[tokio::test]
    async fn test_isolation_level_cannot_join() {
        let (_store, factory) = rig();
        ambient::flow(async {
            let result = factory.begin_with(ScopeOptions {
                join: JoinOption::JoinExisting,
                read_only: false,
                isolation: Some(IsolationLevel::Serializable),
            });
            assert!(matches!(result, Err(ScopeError::IsolationRequiresNewScope)));
        })
        .await;
    }

    #[tokio::test]
    async fn test_isolated_scope_opens_handle_transactions() {
        let (_store, factory) = rig();
        ambient::flow(async {
            let scope = factory
                .begin_isolated(IsolationLevel::RepeatableRead)
                .unwrap();
            let db = scope.resource(&school()).await.unwrap();
            assert_eq!(
                as_memory(&db).isolation(),
                Some(IsolationLevel::RepeatableRead)
            );
        })
        .await;
    }

    #[tokio::test]
    async fn test_disposed_scope_rejects_resource_requests() {
        let (_store, factory) = rig();
        ambient::flow(async {
            let mut scope = factory.begin().unwrap();
            scope.dispose();
            scope.dispose(); // idempotent

            assert!(matches!(
                scope.resource(&school()).await,
                Err(ScopeError::Disposed(_))
            ));
        })
        .await;
    }

    #[tokio::test]
    async fn test_uncommitted_scope_discards_buffered_mutations() {
        let (store, factory) = rig();
        let id = EntityId::random();

        ambient::flow(async {
            let scope = factory.begin().unwrap();
            let db = scope.resource(&school()).await.unwrap();
            as_memory(&db).upsert(id, json!({ "name": "gone" }));
            // Dropped without commit: the cancellation idiom.
        })
        .await;

        assert!(store.get(&school(), id).is_none());
    }
}
