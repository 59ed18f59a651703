//! Errors surfaced by the sync engine and webhook intake.

use contact_mirror_core::CacheError;
use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("unknown organization: {0}")]
    UnknownOrganization(String),

    /// A webhook body that cannot be interpreted. Never retried.
    #[error("invalid webhook: {0}")]
    InvalidWebhook(String),

    #[error("sync engine is shutting down")]
    ShuttingDown,
}

impl SyncError {
    pub(crate) fn invalid_webhook(reason: impl Into<String>) -> Self {
        SyncError::InvalidWebhook(reason.into())
    }

    /// Worth another webhook attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_transient(),
            _ => false,
        }
    }
}
