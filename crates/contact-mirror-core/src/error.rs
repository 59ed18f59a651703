//! Error types for the cache, snapshot persistence, and match resolution.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by [`ContactCache`](crate::cache::ContactCache) and its
/// snapshot persistence.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A record without a remote-assigned ID can never enter the cache.
    #[error("contact has no contact_id")]
    MissingContactId,

    #[error("contact has no organization_id")]
    MissingOrganizationId,

    /// The snapshot could not be parsed or failed validation. The whole
    /// load is rejected and the cache keeps its previous state.
    #[error("snapshot {path} is corrupt: {reason}")]
    SnapshotCorrupt { path: PathBuf, reason: String },

    #[error("snapshot I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub(crate) fn corrupt(path: &std::path::Path, reason: impl Into<String>) -> Self {
        CacheError::SnapshotCorrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Infrastructure failures of [`MatchResolver::resolve`](crate::matcher::MatchResolver::resolve).
///
/// "No match" is not an error; it is `MatchResult::NotFound`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// Neither a snapshot load nor a completed full sync has populated
    /// the cache yet, so a miss could not be trusted.
    #[error("contact cache is not loaded")]
    CacheNotLoaded,

    #[error("unknown organization: {0}")]
    UnknownOrganization(String),
}
