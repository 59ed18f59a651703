//! Remote contact directory abstraction.
//!
//! The sync engine talks to the accounting system only through
//! [`RemoteDirectoryClient`]. [`HttpDirectoryClient`](crate::zoho::HttpDirectoryClient)
//! is the production implementation; tests use in-memory fakes.
//!
//! Records cross this boundary as raw JSON objects in the remote's own
//! shape. [`Contact::from_remote_record`](contact_mirror_core::Contact::from_remote_record)
//! turns a full record into a cache entry.

use std::time::Duration;

use async_trait::async_trait;
use contact_mirror_core::ContactDraft;
use serde_json::Value;
use thiserror::Error;

/// A full remote record, as returned by the detail, create, and update
/// endpoints.
pub type FullContact = Value;

/// Errors raised by a [`RemoteDirectoryClient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The remote throttled the call. `retry_after` is its hint, if any.
    #[error("rate limited by remote (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::RateLimited { .. } | RemoteError::Timeout(_) | RemoteError::Transport(_)
        )
    }

    /// Invalidates every further call in the same organization.
    pub fn is_systemic(&self) -> bool {
        matches!(self, RemoteError::NotAuthorized(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// One page of an abbreviated contact listing.
#[derive(Debug, Clone, Default)]
pub struct ContactPage {
    pub records: Vec<Value>,
    /// Opaque cursor for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

impl ContactPage {
    /// IDs of the listed contacts; entries without one are skipped.
    pub fn contact_ids(&self) -> impl Iterator<Item = &str> {
        self.records
            .iter()
            .filter_map(|r| r.get("contact_id"))
            .filter_map(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Paged listing, detail fetch, create, and update against the remote
/// directory of one organization.
#[async_trait]
pub trait RemoteDirectoryClient: Send + Sync {
    /// Fetch one page. `cursor` is `None` for the first page.
    async fn list_contacts(
        &self,
        organization_id: &str,
        cursor: Option<&str>,
    ) -> Result<ContactPage, RemoteError>;

    async fn get_contact(
        &self,
        organization_id: &str,
        contact_id: &str,
    ) -> Result<FullContact, RemoteError>;

    /// Create a contact; the returned record carries the assigned ID.
    async fn create_contact(
        &self,
        organization_id: &str,
        draft: &ContactDraft,
    ) -> Result<FullContact, RemoteError>;

    /// Apply a partial update and return the resulting record.
    async fn update_contact(
        &self,
        organization_id: &str,
        contact_id: &str,
        patch: &Value,
    ) -> Result<FullContact, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classification() {
        let limited = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(limited.is_transient());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(2)));
        assert!(RemoteError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(RemoteError::Transport("reset".into()).is_transient());

        let denied = RemoteError::NotAuthorized("token expired".into());
        assert!(!denied.is_transient());
        assert!(denied.is_systemic());
        assert!(!RemoteError::NotFound("c1".into()).is_systemic());
    }

    #[test]
    fn page_ids_skip_records_without_id() {
        let page = ContactPage {
            records: vec![
                json!({"contact_id": "1"}),
                json!({"contact_name": "no id"}),
                json!({"contact_id": ""}),
                json!({"contact_id": "2"}),
            ],
            next_cursor: None,
        };
        assert_eq!(page.contact_ids().collect::<Vec<_>>(), vec!["1", "2"]);
    }
}
