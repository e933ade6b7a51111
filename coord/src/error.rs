use crate::path::PathBuf;

/// Result alias used throughout the coordination core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by coordination operations.
///
/// Compare-exchange conflicts and transient provider failures are recovered
/// locally by retry loops and never reach callers directly; everything else is
/// surfaced without retry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A path string contained a raw separator inside a segment, an empty
    /// segment, or an unbalanced escape sequence.
    #[error("malformed path: {0}")]
    MalformedPath(String),
    /// `create` on a path that already holds an initialized entry.
    #[error("entry already exists: {0}")]
    EntryAlreadyExists(PathBuf),
    /// The addressed entry does not exist (or is tombstoned).
    #[error("entry not found: {0}")]
    EntryNotFound(PathBuf),
    /// Non-recursive delete on an entry with live children.
    #[error("entry has children: {0}")]
    HasChildren(PathBuf),
    /// Conditional write against a stale version; carries the version the
    /// entry currently has.
    #[error("version conflict, entry is at version {current}")]
    VersionConflict {
        /// The version observed in the store at the time of the conflict.
        current: u64,
    },
    /// The session the operation ran under has ended.
    #[error("session ended")]
    SessionEnded,
    /// No record exists for the addressed session.
    #[error("unknown session")]
    UnknownSession,
    /// The backing store stayed unavailable past the local retry budget.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(anyhow::Error),
    /// The transport could not provide or operate an endpoint.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(anyhow::Error),
    /// A suspension primitive was torn down underneath the waiter.
    #[error("operation canceled")]
    Canceled,
    /// Both sides of a compare-exchange carried different keys.
    #[error("compare exchange keys differ")]
    KeyMismatch,
}

impl Error {
    pub(crate) fn backend(err: impl Into<anyhow::Error>) -> Self {
        Self::BackendUnavailable(err.into())
    }

    pub(crate) fn transport(err: impl Into<anyhow::Error>) -> Self {
        Self::TransportUnavailable(err.into())
    }
}
