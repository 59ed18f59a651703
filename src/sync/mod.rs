//! Full sync, write-back, and lifecycle of the contact mirror.
//!
//! [`SyncEngine`] is the only writer of the [`ContactCache`]. Within one
//! organization every write (a full-sync record, a webhook event, a
//! write-back result) goes through that organization's writer lane, held
//! for exactly one contact at a time. Readers never wait for a whole sync.
//!
//! # Full sync
//!
//! ```text
//! Listing      page through list_contacts, collect IDs (fatal on error)
//! Detailing    get_contact per ID, bounded concurrency, retry transient
//!              errors; each result upserted if newer than the cache
//! Reconciling  remove cached contacts absent from the listing and not
//!              written since the sync began
//! ```
//!
//! Per-record failures land in [`SyncReport::failed`]; a systemic error
//! (authorization) aborts with [`SyncReport::fatal`] set. Cancellation is
//! checked between contacts, never during an upsert.

mod lanes;
mod report;

pub use lanes::SyncState;
pub use report::{RecordFailure, SyncReport};

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use contact_mirror_core::{Contact, ContactCache, ContactDraft, SnapshotSummary, UpsertOutcome};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::SyncError;
use crate::progress::{NoProgress, SyncPhase, SyncProgressEvent, SyncProgressReporter};
use crate::remote::{RemoteDirectoryClient, RemoteError};
use crate::retry::RetryPolicy;
use crate::webhook::WebhookQueues;
use lanes::{Lanes, OrgLane};

/// Detail progress is reported every this many contacts.
const PROGRESS_EVERY: usize = 50;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Concurrent `get_contact` calls during the detail phase.
    pub detail_concurrency: usize,
    pub webhook_max_attempts: u32,
    pub webhook_dedup_capacity: usize,
    /// Organizations synced by `full_sync_all` even before the cache knows them.
    pub organizations: Vec<String>,
    pub snapshot_path: Option<PathBuf>,
    /// Organizations not fully synced for this long are starved.
    pub stale_after: Duration,
    /// Snapshot cadence of the maintenance task. `None` disables it.
    pub snapshot_interval: Option<Duration>,
    pub maintenance_interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            detail_concurrency: 4,
            webhook_max_attempts: 3,
            webhook_dedup_capacity: 1024,
            organizations: Vec::new(),
            snapshot_path: None,
            stale_after: Duration::from_secs(86_400),
            snapshot_interval: None,
            maintenance_interval: Duration::from_secs(300),
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> Self {
        let snapshot_interval = (config.cache.snapshot_interval_secs > 0)
            .then(|| Duration::from_secs(config.cache.snapshot_interval_secs));
        Self {
            detail_concurrency: config.sync.detail_concurrency,
            webhook_max_attempts: config.sync.webhook_max_attempts,
            webhook_dedup_capacity: config.sync.webhook_dedup_capacity,
            organizations: config.remote.organizations.clone(),
            snapshot_path: Some(config.cache.snapshot_path.clone()),
            stale_after: Duration::from_secs(config.sync.stale_after_secs),
            snapshot_interval,
            maintenance_interval: Duration::from_secs(config.sync.maintenance_interval_secs),
        }
    }
}

pub struct SyncEngine {
    pub(crate) cache: Arc<ContactCache>,
    pub(crate) client: Arc<dyn RemoteDirectoryClient>,
    pub(crate) retry: RetryPolicy,
    pub(crate) options: SyncOptions,
    pub(crate) lanes: Lanes,
    pub(crate) webhooks: WebhookQueues,
    progress: Arc<dyn SyncProgressReporter>,
    shutting_down: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        cache: Arc<ContactCache>,
        client: Arc<dyn RemoteDirectoryClient>,
        retry: RetryPolicy,
        options: SyncOptions,
    ) -> Self {
        Self {
            lanes: Lanes::new(options.webhook_dedup_capacity),
            webhooks: WebhookQueues::default(),
            progress: Arc::new(NoProgress),
            shutting_down: AtomicBool::new(false),
            cache,
            client,
            retry,
            options,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn cache(&self) -> &Arc<ContactCache> {
        &self.cache
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub(crate) fn ensure_running(&self) -> Result<(), SyncError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(SyncError::ShuttingDown);
        }
        Ok(())
    }

    /// Pull every contact of one organization into the cache.
    ///
    /// Returns a coalesced report without doing anything if a sync of the
    /// same organization is already running.
    pub async fn full_sync(&self, organization_id: &str) -> SyncReport {
        let lane = self.lanes.get(organization_id);
        let Some(guard) = lane.try_begin_sync() else {
            debug!(organization_id, "full sync already running, coalescing");
            return SyncReport::coalesced(organization_id);
        };
        let clock = Instant::now();
        let mut report = SyncReport::begin(organization_id);
        if self.ensure_running().is_err() {
            report.cancelled = true;
            return report.finish(clock);
        }
        self.cache.register_organization(organization_id);
        info!(organization_id, "full sync started");

        let ids = match self.list_all(organization_id, &lane).await {
            Ok(Some(ids)) => ids,
            Ok(None) => {
                report.cancelled = true;
                return self.close_report(report, clock);
            }
            Err(e) => {
                warn!(organization_id, error = %e, "listing failed, aborting sync");
                report.fatal = Some(e.to_string());
                return self.close_report(report, clock);
            }
        };
        report.listed = ids.len();

        guard.set_phase(SyncPhase::Detailing);
        self.detail_all(organization_id, &lane, &ids, &mut report)
            .await;

        if report.fatal.is_none() && !report.cancelled {
            guard.set_phase(SyncPhase::Reconciling);
            self.progress.report(SyncProgressEvent::Reconciling {
                organization: organization_id.to_string(),
            });
            report.removed += self.reconcile(organization_id, &lane, &ids, &report).await;
        }

        if report.is_complete() {
            let finished = Utc::now();
            self.cache
                .update_cursor(organization_id, |c| c.last_full_sync_at = Some(finished));
            self.cache.mark_ready();
        }
        drop(guard);
        self.close_report(report, clock)
    }

    fn close_report(&self, report: SyncReport, clock: Instant) -> SyncReport {
        let report = report.finish(clock);
        self.progress.report(SyncProgressEvent::Finished {
            organization: report.organization_id.clone(),
            processed: report.processed as u64,
            failed: report.failed_count() as u64,
        });
        info!(
            organization_id = %report.organization_id,
            listed = report.listed,
            processed = report.processed,
            upserted = report.upserted,
            unchanged = report.unchanged,
            stale_skipped = report.stale_skipped,
            removed = report.removed,
            failed = report.failed_count(),
            cancelled = report.cancelled,
            fatal = report.fatal.as_deref().unwrap_or(""),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "full sync finished"
        );
        report
    }

    /// All contact IDs in listing order, deduplicated. `Ok(None)` when
    /// cancelled between pages.
    async fn list_all(
        &self,
        organization_id: &str,
        lane: &OrgLane,
    ) -> Result<Option<Vec<String>>, RemoteError> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut cursors = HashSet::new();
        let mut cursor: Option<String> = None;

        loop {
            if lane.is_cancelled() {
                return Ok(None);
            }
            let page = self
                .retry
                .run("list_contacts", || {
                    self.client.list_contacts(organization_id, cursor.as_deref())
                })
                .await?;

            for id in page.contact_ids() {
                if seen.insert(id.to_string()) {
                    ids.push(id.to_string());
                }
            }
            self.progress.report(SyncProgressEvent::Listing {
                organization: organization_id.to_string(),
                listed: ids.len() as u64,
            });

            match page.next_cursor {
                Some(next) if cursors.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    warn!(organization_id, cursor = %next, "listing cursor repeated, stopping");
                    break;
                }
                None => break,
            }
        }
        Ok(Some(ids))
    }

    async fn detail_all(
        &self,
        organization_id: &str,
        lane: &OrgLane,
        ids: &[String],
        report: &mut SyncReport,
    ) {
        let total = ids.len() as u64;
        let concurrency = self.options.detail_concurrency.max(1);
        let mut fetches = stream::iter(ids.to_vec())
            .map(|id| async move {
                let requested_at = Utc::now();
                let result = self
                    .retry
                    .run("get_contact", || self.client.get_contact(organization_id, &id))
                    .await;
                (id, result, requested_at, Utc::now())
            })
            .buffer_unordered(concurrency);

        while let Some((id, result, requested_at, observed_at)) = fetches.next().await {
            let id = id.as_str();
            if lane.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match result {
                Ok(record) => {
                    let outcome = match Contact::from_remote_record(organization_id, &record) {
                        Ok(contact) if contact.contact_id() != id => {
                            Err(format!("detail returned contact {}", contact.contact_id()))
                        }
                        Ok(contact) => {
                            let _writer = lane.writer.lock().await;
                            if lane.removed_since(id, requested_at) {
                                debug!(organization_id, contact_id = id, "removed while fetching, skipping");
                                Ok(UpsertOutcome::Stale)
                            } else {
                                self.cache
                                    .upsert_if_newer(contact.with_last_synced_at(observed_at))
                                    .map_err(|e| e.to_string())
                            }
                        }
                        Err(e) => Err(e.to_string()),
                    };
                    match outcome {
                        Ok(outcome) => {
                            report.processed += 1;
                            match outcome {
                                UpsertOutcome::Inserted | UpsertOutcome::Replaced => {
                                    report.upserted += 1
                                }
                                UpsertOutcome::Unchanged => report.unchanged += 1,
                                UpsertOutcome::Stale => report.stale_skipped += 1,
                            }
                        }
                        Err(e) => {
                            warn!(organization_id, contact_id = id, error = %e, "unusable contact record");
                            report.record_failure(id, e);
                        }
                    }
                }
                Err(RemoteError::NotFound(_)) => {
                    // Deleted between listing and detail.
                    let _writer = lane.writer.lock().await;
                    if self
                        .cache
                        .remove_if_synced_before(organization_id, id, report.started_at)
                    {
                        lane.record_removal(id, Utc::now());
                        report.removed += 1;
                    }
                    report.processed += 1;
                }
                Err(e) if e.is_systemic() => {
                    warn!(organization_id, contact_id = id, error = %e, "systemic error, aborting sync");
                    report.fatal = Some(e.to_string());
                    break;
                }
                Err(e) => {
                    warn!(organization_id, contact_id = id, error = %e, "contact detail failed");
                    report.record_failure(id, e);
                }
            }

            if report.processed % PROGRESS_EVERY == 0 || report.processed as u64 == total {
                self.progress.report(SyncProgressEvent::Detailing {
                    organization: organization_id.to_string(),
                    n: report.processed as u64,
                    total,
                });
            }
        }
    }

    async fn reconcile(
        &self,
        organization_id: &str,
        lane: &OrgLane,
        listed: &[String],
        report: &SyncReport,
    ) -> usize {
        let listed: HashSet<&str> = listed.iter().map(String::as_str).collect();
        let mut removed = 0;
        for contact in self.cache.contacts(organization_id) {
            if listed.contains(contact.contact_id()) {
                continue;
            }
            if lane.is_cancelled() {
                break;
            }
            let _writer = lane.writer.lock().await;
            if self.cache.remove_if_synced_before(
                organization_id,
                contact.contact_id(),
                report.started_at,
            ) {
                lane.record_removal(contact.contact_id(), Utc::now());
                debug!(organization_id, contact_id = contact.contact_id(), "removed vanished contact");
                removed += 1;
            }
        }
        removed
    }

    /// Full sync of every configured and every cached organization,
    /// concurrently.
    pub async fn full_sync_all(&self) -> BTreeMap<String, SyncReport> {
        let mut organizations: BTreeSet<String> =
            self.options.organizations.iter().cloned().collect();
        organizations.extend(self.cache.organizations());

        let reports =
            futures::future::join_all(organizations.iter().map(|org| self.full_sync(org))).await;
        organizations.into_iter().zip(reports).collect()
    }

    /// Ask a running sync of `organization_id` to stop. `false` if none runs.
    pub fn cancel_sync(&self, organization_id: &str) -> bool {
        self.lanes
            .existing(organization_id)
            .map(|lane| lane.request_cancel())
            .unwrap_or(false)
    }

    pub fn sync_state(&self, organization_id: &str) -> SyncState {
        self.lanes
            .existing(organization_id)
            .map(|lane| lane.state())
            .unwrap_or(SyncState::Idle)
    }

    /// Organizations whose last complete full sync is missing or older than
    /// `max_age`.
    pub fn stale_organizations(&self, max_age: Duration) -> Vec<String> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = Utc::now();
        let mut organizations: BTreeSet<String> =
            self.options.organizations.iter().cloned().collect();
        organizations.extend(self.cache.organizations());
        organizations
            .into_iter()
            .filter(|org| self.cache.cursor(org).is_starved(now, max_age))
            .collect()
    }

    /// Persist the cache to the configured snapshot path. `Ok(None)` when no
    /// path is configured.
    pub fn finalize_sync(&self) -> Result<Option<SnapshotSummary>, SyncError> {
        let Some(path) = self.options.snapshot_path.as_deref() else {
            return Ok(None);
        };
        Ok(Some(self.cache.save_snapshot(path)?))
    }

    /// Create a contact remotely and mirror the authoritative result.
    ///
    /// The create is attempted once; on any error the cache is untouched.
    pub async fn push_new_contact(
        &self,
        organization_id: &str,
        draft: &ContactDraft,
    ) -> Result<Arc<Contact>, SyncError> {
        self.ensure_running()?;
        let record = self
            .retry
            .run_once(self.client.create_contact(organization_id, draft))
            .await?;
        let contact = self.mirror_record(organization_id, &record).await?;
        info!(
            organization_id,
            contact_id = contact.contact_id(),
            name = contact.display_name(),
            "created remote contact"
        );
        Ok(contact)
    }

    /// Update a contact remotely and mirror the authoritative result.
    pub async fn push_contact_update(
        &self,
        organization_id: &str,
        contact_id: &str,
        patch: &Value,
    ) -> Result<Arc<Contact>, SyncError> {
        self.ensure_running()?;
        let record = self
            .retry
            .run("update_contact", || {
                self.client.update_contact(organization_id, contact_id, patch)
            })
            .await?;
        let contact = self.mirror_record(organization_id, &record).await?;
        info!(organization_id, contact_id, "updated remote contact");
        Ok(contact)
    }

    async fn mirror_record(
        &self,
        organization_id: &str,
        record: &Value,
    ) -> Result<Arc<Contact>, SyncError> {
        let contact = Contact::from_remote_record(organization_id, record)?;
        let contact_id = contact.contact_id().to_string();
        let fallback = Arc::new(contact.clone());

        let lane = self.lanes.get(organization_id);
        let _writer = lane.writer.lock().await;
        self.cache.register_organization(organization_id);
        self.cache.upsert_if_newer(contact)?;
        Ok(self
            .cache
            .get(organization_id, &contact_id)
            .unwrap_or(fallback))
    }

    /// Background task: saves the snapshot on its interval and fully syncs
    /// starved organizations.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.options.maintenance_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_snapshot = Instant::now();
            // The first tick fires immediately; skip it.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if engine.ensure_running().is_err() {
                    break;
                }

                for org in engine.stale_organizations(engine.options.stale_after) {
                    info!(organization_id = %org, "organization starved, running full sync");
                    engine.full_sync(&org).await;
                }

                if let Some(interval) = engine.options.snapshot_interval {
                    if last_snapshot.elapsed() >= interval {
                        match engine.finalize_sync() {
                            Ok(Some(summary)) => {
                                debug!(contacts = summary.contacts, "periodic snapshot saved")
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "periodic snapshot failed"),
                        }
                        last_snapshot = Instant::now();
                    }
                }
            }
            debug!("maintenance task stopped");
        })
    }

    /// Stop accepting work, cancel running syncs, close webhook queues.
    /// Events already queued still drain.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        for org in self.cache.organizations() {
            self.cancel_sync(&org);
        }
        self.webhooks.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ContactPage;
    use async_trait::async_trait;
    use contact_mirror_core::ContactType;
    use serde_json::json;
    use std::sync::Mutex;

    /// Two-page directory; `create` fails when `fail_create` is set.
    struct Scripted {
        records: Mutex<Vec<Value>>,
        fail_create: bool,
    }

    impl Scripted {
        fn new(n: usize) -> Self {
            let records = (0..n)
                .map(|i| {
                    json!({
                        "contact_id": format!("c{}", i),
                        "contact_name": format!("Company {}", i),
                        "cf_vat_id": format!("PL{:010}", i),
                        "last_modified_time": "2024-03-01T10:00:00+0000"
                    })
                })
                .collect();
            Self {
                records: Mutex::new(records),
                fail_create: false,
            }
        }
    }

    #[async_trait]
    impl RemoteDirectoryClient for Scripted {
        async fn list_contacts(
            &self,
            _org: &str,
            cursor: Option<&str>,
        ) -> Result<ContactPage, RemoteError> {
            let records = self.records.lock().unwrap().clone();
            let (start, next) = match cursor {
                None => (0, (records.len() > 2).then(|| "2".to_string())),
                Some(_) => (2, None),
            };
            let end = if next.is_some() { 2 } else { records.len() };
            Ok(ContactPage {
                records: records[start.min(end)..end].to_vec(),
                next_cursor: next,
            })
        }

        async fn get_contact(&self, _org: &str, id: &str) -> Result<Value, RemoteError> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r["contact_id"] == id)
                .cloned()
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))
        }

        async fn create_contact(
            &self,
            _org: &str,
            draft: &ContactDraft,
        ) -> Result<Value, RemoteError> {
            if self.fail_create {
                return Err(RemoteError::Transport("connection reset".into()));
            }
            let mut body = draft.to_remote_body();
            body["contact_id"] = json!("new-1");
            Ok(body)
        }

        async fn update_contact(
            &self,
            _org: &str,
            id: &str,
            patch: &Value,
        ) -> Result<Value, RemoteError> {
            let mut record = self.get_contact("", id).await?;
            if let (Some(r), Some(p)) = (record.as_object_mut(), patch.as_object()) {
                for (k, v) in p {
                    r.insert(k.clone(), v.clone());
                }
            }
            Ok(record)
        }
    }

    fn engine(client: Scripted) -> SyncEngine {
        SyncEngine::new(
            Arc::new(ContactCache::new()),
            Arc::new(client),
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                ..RetryPolicy::default()
            },
            SyncOptions::default(),
        )
    }

    #[tokio::test]
    async fn full_sync_fills_cache_and_cursor() {
        crate::logging::init_test_logging();
        let engine = engine(Scripted::new(5));
        let report = engine.full_sync("org").await;

        assert!(report.is_complete());
        assert_eq!(report.listed, 5);
        assert_eq!(report.processed, 5);
        assert_eq!(report.upserted, 5);
        assert_eq!(engine.cache.len("org"), 5);
        assert!(engine.cache.is_ready());
        assert!(engine.cache.cursor("org").last_full_sync_at.is_some());
        assert_eq!(engine.sync_state("org"), SyncState::Idle);

        let again = engine.full_sync("org").await;
        assert_eq!(again.unchanged, 5);
        assert_eq!(again.upserted, 0);
    }

    #[tokio::test]
    async fn reconcile_removes_contacts_gone_remotely() {
        let client = Scripted::new(4);
        let engine = engine(client);
        engine.full_sync("org").await;
        assert_eq!(engine.cache.len("org"), 4);

        // Drop c3 remotely by shrinking the scripted directory.
        let client = Scripted::new(3);
        let engine = SyncEngine::new(
            Arc::clone(&engine.cache),
            Arc::new(client),
            engine.retry.clone(),
            SyncOptions::default(),
        );
        let report = engine.full_sync("org").await;
        assert_eq!(report.removed, 1);
        assert!(engine.cache.get("org", "c3").is_none());
    }

    #[tokio::test]
    async fn failed_create_leaves_cache_untouched() {
        let engine = engine(Scripted {
            fail_create: true,
            ..Scripted::new(0)
        });
        let draft = ContactDraft::new("Nowa Firma", ContactType::Vendor);
        let err = engine.push_new_contact("org", &draft).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::Transport(_))));
        assert_eq!(engine.cache.len("org"), 0);
        assert!(engine.cache.find_by_name_exact("org", "Nowa Firma").is_none());
    }

    #[tokio::test]
    async fn created_contact_is_mirrored() {
        let engine = engine(Scripted::new(0));
        let draft = ContactDraft::new("Nowa Firma", ContactType::Vendor);
        let contact = engine.push_new_contact("org", &draft).await.unwrap();
        assert_eq!(contact.contact_id(), "new-1");
        assert_eq!(
            engine
                .cache
                .find_by_name_exact("org", "nowa firma")
                .unwrap()
                .contact_id(),
            "new-1"
        );
    }

    #[tokio::test]
    async fn update_is_mirrored() {
        let engine = engine(Scripted::new(2));
        engine.full_sync("org").await;
        let updated = engine
            .push_contact_update(
                "org",
                "c1",
                &json!({"email": "ap@company1.pl", "last_modified_time": "2024-04-01T10:00:00+0000"}),
            )
            .await
            .unwrap();
        assert_eq!(updated.email(), Some("ap@company1.pl"));
        assert_eq!(
            engine.cache.find_by_email("org", "AP@company1.pl").unwrap().contact_id(),
            "c1"
        );
    }

    #[tokio::test]
    async fn stale_organizations_include_unsynced_configured_ones() {
        let engine = SyncEngine::new(
            Arc::new(ContactCache::new()),
            Arc::new(Scripted::new(1)),
            RetryPolicy::default(),
            SyncOptions {
                organizations: vec!["a".into(), "b".into()],
                ..SyncOptions::default()
            },
        );
        engine.full_sync("a").await;
        assert_eq!(
            engine.stale_organizations(Duration::from_secs(60)),
            vec!["b".to_string()]
        );
    }

    #[tokio::test]
    async fn cancel_without_running_sync_is_false() {
        let engine = engine(Scripted::new(1));
        assert!(!engine.cancel_sync("org"));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let engine = engine(Scripted::new(1));
        engine.shutdown();
        let draft = ContactDraft::new("X", ContactType::Customer);
        assert!(matches!(
            engine.push_new_contact("org", &draft).await,
            Err(SyncError::ShuttingDown)
        ));
        assert!(engine.full_sync("org").await.cancelled);
    }
}
