//! Error types for ambient scope management.

use uuid::Uuid;

use crate::backend::BackendError;

/// Errors surfaced by scope creation, handle resolution and commit.
///
/// Stack-discipline violations (disposing scopes out of order, releasing a
/// suppression while scopes created under it are still live) are defects in
/// the calling code, not recoverable conditions; they panic instead of
/// appearing here.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    /// A resource handle was requested with no ambient scope visible.
    #[error("no ambient resource scope; open a ResourceScope before requesting handles")]
    NoAmbientScope,

    /// The calling task never established an ambient flow.
    #[error("no ambient flow on this task; wrap the call chain in `ambient::flow`")]
    NoAmbientFlow,

    /// A read-write scope attempted to join a read-only ambient scope.
    #[error("cannot open a read-write scope inside a read-only scope")]
    ReadWriteInsideReadOnly,

    /// An explicit isolation level was combined with `JoinExisting`.
    #[error(
        "cannot join the ambient scope when an explicit isolation level is requested; \
         use ForceCreateNew"
    )]
    IsolationRequiresNewScope,

    /// Commit was called on a read-only scope.
    #[error("commit is not valid on a read-only scope")]
    CommitOnReadOnly,

    /// The scope was already disposed.
    #[error("scope {0} is disposed")]
    Disposed(Uuid),

    /// The backend factory or a resource handle failed. Propagated
    /// unchanged; the scope still releases everything it owns on unwind.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result type for scope operations.
pub type Result<T> = std::result::Result<T, ScopeError>;
