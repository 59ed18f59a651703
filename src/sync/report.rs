//! Outcome of one full sync.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A contact whose detail could not be fetched or applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub contact_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub organization_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_millis", rename = "elapsed_ms")]
    pub elapsed: Duration,
    /// Contacts seen in the remote listing.
    pub listed: usize,
    /// Contacts whose detail phase finished, successfully or not.
    pub processed: usize,
    pub upserted: usize,
    pub unchanged: usize,
    /// Fetched records older than what the cache already held.
    pub stale_skipped: usize,
    /// Contacts removed because they vanished remotely.
    pub removed: usize,
    pub failed: Vec<RecordFailure>,
    /// Set when the sync aborted on a systemic error.
    pub fatal: Option<String>,
    pub cancelled: bool,
    /// The request joined a sync that was already running; nothing was done.
    pub coalesced: bool,
}

impl SyncReport {
    pub(crate) fn begin(organization_id: &str) -> Self {
        let now = Utc::now();
        Self {
            organization_id: organization_id.to_string(),
            started_at: now,
            finished_at: now,
            elapsed: Duration::ZERO,
            listed: 0,
            processed: 0,
            upserted: 0,
            unchanged: 0,
            stale_skipped: 0,
            removed: 0,
            failed: Vec::new(),
            fatal: None,
            cancelled: false,
            coalesced: false,
        }
    }

    pub(crate) fn coalesced(organization_id: &str) -> Self {
        let mut report = Self::begin(organization_id);
        report.coalesced = true;
        report
    }

    pub(crate) fn finish(mut self, clock: std::time::Instant) -> Self {
        self.finished_at = Utc::now();
        self.elapsed = clock.elapsed();
        self
    }

    /// Ran to the end without a fatal error or cancellation.
    pub fn is_complete(&self) -> bool {
        !self.coalesced && !self.cancelled && self.fatal.is_none()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub(crate) fn record_failure(&mut self, contact_id: &str, error: impl ToString) {
        self.processed += 1;
        self.failed.push(RecordFailure {
            contact_id: contact_id.to_string(),
            error: error.to_string(),
        });
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completeness() {
        let mut report = SyncReport::begin("org");
        assert!(report.is_complete());
        report.record_failure("c1", "timed out");
        assert!(report.is_complete());
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed_count(), 1);

        report.fatal = Some("not authorized".into());
        assert!(!report.is_complete());
        assert!(!SyncReport::coalesced("org").is_complete());
    }

    #[test]
    fn serializes_elapsed_as_millis() {
        let mut report = SyncReport::begin("org");
        report.elapsed = Duration::from_millis(1500);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["elapsed_ms"], 1500);
        assert!(json.get("elapsed").is_none());
    }
}
