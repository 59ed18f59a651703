//! In-memory contact mirror with exact and fuzzy lookup indices.
//!
//! Contacts are partitioned by organization. Each organization owns an
//! [`OrgShard`] behind its own `RwLock`, so a writer repointing the indices
//! of one contact blocks readers of that organization only for the length
//! of a single `upsert`/`remove`, and never blocks other organizations.
//!
//! # Locking
//!
//! Lock order is always the shard map first, then a shard. The shard map
//! guard is released before a shard is locked for writing, so shard
//! writers never hold the map.
//!
//! # Sharing
//!
//! Contacts are stored as `Arc<Contact>`. Callers receive clones of the
//! `Arc` and cannot mutate what the cache holds; every mutation goes
//! through [`ContactCache::upsert`] or [`ContactCache::remove`].

mod index;

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CacheError;
use crate::models::{Contact, ContactType, SyncCursor};
use crate::normalize::{normalize_email, normalize_name, normalize_tax_id};

pub use index::{DuplicateKeys, IndexFingerprint};
pub(crate) use index::OrgShard;

/// Confidence of a normalized tax-ID hit.
pub const TAX_ID_CONFIDENCE: f64 = 1.0;
/// Confidence of an exact normalized-name hit.
pub const NAME_EXACT_CONFIDENCE: f64 = 0.95;
/// Confidence of a normalized-email hit.
pub const EMAIL_CONFIDENCE: f64 = 0.85;

/// Result of [`ContactCache::upsert_if_newer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// Same revision already cached; nothing written.
    Unchanged,
    /// The cached revision is strictly newer; nothing written.
    Stale,
}

impl UpsertOutcome {
    pub fn wrote(self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Replaced)
    }
}

/// Read-only aggregate over one or all organizations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub with_tax_id: usize,
    pub customers: usize,
    pub vendors: usize,
    pub organizations: usize,
    /// Tax IDs shared by more than one contact of the same organization.
    pub duplicate_tax_ids: usize,
    /// Emails shared by more than one contact of the same organization.
    pub duplicate_emails: usize,
    /// Last completed full sync per organization (`None` = never).
    pub last_sync_times: BTreeMap<String, Option<DateTime<Utc>>>,
}

/// Exported state of one organization, as written to a snapshot.
#[derive(Debug, Clone)]
pub(crate) struct OrgExport {
    pub cursor: SyncCursor,
    pub contacts: Vec<Arc<Contact>>,
}

type ShardRef = Arc<RwLock<OrgShard>>;

/// The contact mirror. Construct once and share behind an `Arc`.
#[derive(Debug, Default)]
pub struct ContactCache {
    shards: RwLock<HashMap<String, ShardRef>>,
    cursors: RwLock<HashMap<String, SyncCursor>>,
    ready: AtomicBool,
}

impl ContactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a snapshot was loaded or a full sync completed.
    ///
    /// Until then a lookup miss says nothing about the remote directory.
    pub fn is_ready(&self) -> bool {
        self.ready.load(AtomicOrdering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, AtomicOrdering::Release);
    }

    /// Make an organization known even before it holds any contact.
    pub fn register_organization(&self, organization_id: &str) {
        self.shard_or_insert(organization_id);
    }

    pub fn has_organization(&self, organization_id: &str) -> bool {
        read(&self.shards).contains_key(organization_id)
    }

    /// Known organization IDs, sorted.
    pub fn organizations(&self) -> Vec<String> {
        let mut orgs: Vec<String> = read(&self.shards).keys().cloned().collect();
        orgs.sort();
        orgs
    }

    /// Insert or replace a contact, unconditionally.
    pub fn upsert(&self, contact: Contact) -> Result<(), CacheError> {
        validate_identity(&contact)?;
        let shard = self.shard_or_insert(contact.organization_id());
        write(&shard).insert(Arc::new(contact));
        Ok(())
    }

    /// Insert or replace a contact unless the cached revision is the same
    /// or strictly newer. Comparison and write happen under one lock.
    ///
    /// When the two revisions cannot be ordered, the one observed later
    /// (`last_synced_at`) wins; ties go to the incoming contact.
    pub fn upsert_if_newer(&self, contact: Contact) -> Result<UpsertOutcome, CacheError> {
        validate_identity(&contact)?;
        let shard = self.shard_or_insert(contact.organization_id());
        let mut shard = write(&shard);

        let outcome = match shard.get(contact.contact_id()) {
            None => UpsertOutcome::Inserted,
            Some(existing) => match contact.revision().compare(existing.revision()) {
                Some(Ordering::Equal) => return Ok(UpsertOutcome::Unchanged),
                Some(Ordering::Less) => return Ok(UpsertOutcome::Stale),
                Some(Ordering::Greater) => UpsertOutcome::Replaced,
                None if contact.last_synced_at() < existing.last_synced_at() => {
                    return Ok(UpsertOutcome::Stale)
                }
                None => UpsertOutcome::Replaced,
            },
        };
        shard.insert(Arc::new(contact));
        Ok(outcome)
    }

    /// Delete a contact and all its index entries.
    pub fn remove(&self, organization_id: &str, contact_id: &str) -> bool {
        match self.shard(organization_id) {
            Some(shard) => write(&shard).remove(contact_id).is_some(),
            None => false,
        }
    }

    /// Delete a contact only if it was last written before `cutoff`.
    ///
    /// Used by full-sync reconciliation so a contact written by a webhook
    /// while the sync was running survives.
    pub fn remove_if_synced_before(
        &self,
        organization_id: &str,
        contact_id: &str,
        cutoff: DateTime<Utc>,
    ) -> bool {
        let Some(shard) = self.shard(organization_id) else {
            return false;
        };
        let mut shard = write(&shard);
        match shard.get(contact_id) {
            Some(c) if c.last_synced_at() < cutoff => shard.remove(contact_id).is_some(),
            _ => false,
        }
    }

    pub fn get(&self, organization_id: &str, contact_id: &str) -> Option<Arc<Contact>> {
        self.shard(organization_id)
            .and_then(|shard| read(&shard).get(contact_id))
    }

    /// Exact match on the normalized tax ID (confidence [`TAX_ID_CONFIDENCE`]).
    pub fn find_by_tax_id(&self, organization_id: &str, tax_id: &str) -> Option<Arc<Contact>> {
        self.find_by_tax_id_hinted(organization_id, tax_id, None)
    }

    /// Like [`find_by_tax_id`](Self::find_by_tax_id), normalizing the query
    /// with a country hint first.
    pub fn find_by_tax_id_hinted(
        &self,
        organization_id: &str,
        tax_id: &str,
        country_hint: Option<&str>,
    ) -> Option<Arc<Contact>> {
        let key = normalize_tax_id(tax_id, country_hint)?;
        let shard = self.shard(organization_id)?;
        let guard = read(&shard);
        guard.find_by_tax_id(&key)
    }

    /// Exact match on the normalized name (confidence [`NAME_EXACT_CONFIDENCE`]).
    pub fn find_by_name_exact(&self, organization_id: &str, name: &str) -> Option<Arc<Contact>> {
        let key = normalize_name(name);
        if key.is_empty() {
            return None;
        }
        let shard = self.shard(organization_id)?;
        let guard = read(&shard);
        guard.find_by_name(&key)
    }

    /// Exact match on the normalized email (confidence [`EMAIL_CONFIDENCE`]).
    pub fn find_by_email(&self, organization_id: &str, email: &str) -> Option<Arc<Contact>> {
        let key = normalize_email(email)?;
        let shard = self.shard(organization_id)?;
        let guard = read(&shard);
        guard.find_by_email(&key)
    }

    /// Ranked fuzzy candidates with confidence in `[0.6, 0.9]`.
    ///
    /// Sorted by confidence descending, ties broken by most recently
    /// synced, then by contact ID.
    pub fn find_by_name_fuzzy(
        &self,
        organization_id: &str,
        name: &str,
        min_confidence: f64,
    ) -> Vec<(Arc<Contact>, f64)> {
        let key = normalize_name(name);
        if key.is_empty() {
            return Vec::new();
        }
        match self.shard(organization_id) {
            Some(shard) => read(&shard).find_by_name_fuzzy(&key, min_confidence),
            None => Vec::new(),
        }
    }

    /// All contacts of an organization, sorted by contact ID.
    pub fn contacts(&self, organization_id: &str) -> Vec<Arc<Contact>> {
        let Some(shard) = self.shard(organization_id) else {
            return Vec::new();
        };
        let mut all: Vec<Arc<Contact>> = read(&shard).contacts().cloned().collect();
        all.sort_by(|a, b| a.contact_id().cmp(b.contact_id()));
        all
    }

    /// Contacts of one type, sorted by contact ID.
    pub fn contacts_of_type(
        &self,
        organization_id: &str,
        contact_type: ContactType,
    ) -> Vec<Arc<Contact>> {
        let mut matching = self.contacts(organization_id);
        matching.retain(|c| c.contact_type() == contact_type);
        matching
    }

    /// Tax IDs and emails the remote directory holds on more than one
    /// contact. Lookups on such a key return the most recently synced one.
    pub fn duplicates(&self, organization_id: &str) -> DuplicateKeys {
        match self.shard(organization_id) {
            Some(shard) => read(&shard).duplicate_keys(),
            None => DuplicateKeys::default(),
        }
    }

    pub fn len(&self, organization_id: &str) -> usize {
        self.shard(organization_id)
            .map(|shard| read(&shard).len())
            .unwrap_or(0)
    }

    /// Aggregate counts. Each shard is read-locked only while it is counted.
    pub fn stats(&self, organization_id: Option<&str>) -> CacheStats {
        let shards: Vec<(String, ShardRef)> = {
            let map = read(&self.shards);
            map.iter()
                .filter(|(org, _)| organization_id.map_or(true, |wanted| wanted == org.as_str()))
                .map(|(org, shard)| (org.clone(), Arc::clone(shard)))
                .collect()
        };

        let cursors = read(&self.cursors);
        let mut stats = CacheStats {
            organizations: shards.len(),
            ..CacheStats::default()
        };
        for (org, shard) in &shards {
            let shard = read(shard);
            for c in shard.contacts() {
                stats.total += 1;
                if c.normalized_tax_id().is_some() {
                    stats.with_tax_id += 1;
                }
                match c.contact_type() {
                    ContactType::Customer => stats.customers += 1,
                    ContactType::Vendor => stats.vendors += 1,
                    ContactType::Unknown => {}
                }
            }
            let duplicates = shard.duplicate_keys();
            stats.duplicate_tax_ids += duplicates.tax_ids.len();
            stats.duplicate_emails += duplicates.emails.len();
            stats.last_sync_times.insert(
                org.clone(),
                cursors.get(org).and_then(|c| c.last_full_sync_at),
            );
        }
        stats
    }

    pub fn cursor(&self, organization_id: &str) -> SyncCursor {
        read(&self.cursors)
            .get(organization_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Mutate an organization's cursor in place, registering the
    /// organization if needed.
    pub fn update_cursor(&self, organization_id: &str, f: impl FnOnce(&mut SyncCursor)) {
        self.register_organization(organization_id);
        let mut cursors = write(&self.cursors);
        f(cursors.entry(organization_id.to_string()).or_default());
    }

    /// Snapshot of every index for one organization.
    pub fn index_fingerprint(&self, organization_id: &str) -> Option<IndexFingerprint> {
        self.shard(organization_id)
            .map(|shard| read(&shard).fingerprint())
    }

    pub(crate) fn export(&self) -> BTreeMap<String, OrgExport> {
        let shards: Vec<(String, ShardRef)> = read(&self.shards)
            .iter()
            .map(|(org, shard)| (org.clone(), Arc::clone(shard)))
            .collect();
        let cursors = read(&self.cursors).clone();

        shards
            .into_iter()
            .map(|(org, shard)| {
                let mut contacts: Vec<Arc<Contact>> = read(&shard).contacts().cloned().collect();
                contacts.sort_by(|a, b| a.contact_id().cmp(b.contact_id()));
                let cursor = cursors.get(&org).cloned().unwrap_or_default();
                (org, OrgExport { cursor, contacts })
            })
            .collect()
    }

    /// Swap in fully built state; existing contents are discarded.
    pub(crate) fn install(
        &self,
        shards: HashMap<String, OrgShard>,
        cursors: HashMap<String, SyncCursor>,
    ) {
        let shards = shards
            .into_iter()
            .map(|(org, shard)| (org, Arc::new(RwLock::new(shard))))
            .collect();
        *write(&self.shards) = shards;
        *write(&self.cursors) = cursors;
    }

    fn shard(&self, organization_id: &str) -> Option<ShardRef> {
        read(&self.shards).get(organization_id).cloned()
    }

    fn shard_or_insert(&self, organization_id: &str) -> ShardRef {
        if let Some(shard) = self.shard(organization_id) {
            return shard;
        }
        let mut map = write(&self.shards);
        Arc::clone(map.entry(organization_id.to_string()).or_default())
    }
}

fn validate_identity(contact: &Contact) -> Result<(), CacheError> {
    if contact.organization_id().trim().is_empty() {
        return Err(CacheError::MissingOrganizationId);
    }
    if contact.contact_id().trim().is_empty() {
        return Err(CacheError::MissingContactId);
    }
    Ok(())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Revision;
    use chrono::{Duration, TimeZone};

    fn contact(org: &str, id: &str, name: &str) -> Contact {
        Contact::new(org, id, name, Revision::explicit(format!("{}-r1", id), None))
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn tax_id_lookup_after_upsert() {
        let cache = ContactCache::new();
        cache
            .upsert(contact("1", "C1", "Acme Sp. z o.o.").with_tax_id("PL123", None))
            .unwrap();

        let hit = cache.find_by_tax_id("1", "pl-123").unwrap();
        assert_eq!(hit.contact_id(), "C1");
        assert!(cache.find_by_tax_id("2", "PL123").is_none());
    }

    #[test]
    fn acme_lifecycle() {
        let cache = ContactCache::new();
        cache
            .upsert(contact("1", "C1", "Acme Sp. z o.o.").with_tax_id("PL123", None))
            .unwrap();

        assert_eq!(cache.find_by_tax_id("1", "PL123").unwrap().contact_id(), "C1");
        let fuzzy = cache.find_by_name_fuzzy("1", "Acme", 0.6);
        assert_eq!(fuzzy.len(), 1);
        assert_eq!(fuzzy[0].0.contact_id(), "C1");
        assert!(fuzzy[0].1 >= 0.6 && fuzzy[0].1 <= 0.9);

        assert!(cache.remove("1", "C1"));
        assert!(cache.find_by_tax_id("1", "PL123").is_none());
        assert!(cache.find_by_name_fuzzy("1", "Acme", 0.6).is_empty());
        assert!(!cache.remove("1", "C1"));
    }

    #[test]
    fn tax_id_change_leaves_no_stale_entry() {
        let cache = ContactCache::new();
        cache
            .upsert(contact("1", "C1", "Alpha").with_tax_id("PL111", None))
            .unwrap();
        cache
            .upsert(contact("1", "C1", "Alpha").with_tax_id("PL222", None))
            .unwrap();

        assert!(cache.find_by_tax_id("1", "PL111").is_none());
        assert!(cache.find_by_tax_id("1", "111").is_none());
        assert_eq!(cache.find_by_tax_id("1", "PL222").unwrap().contact_id(), "C1");
    }

    #[test]
    fn rename_and_email_change_repoint_indices() {
        let cache = ContactCache::new();
        cache
            .upsert(contact("1", "C1", "Alpha GmbH").with_email("a@alpha.de"))
            .unwrap();
        cache
            .upsert(contact("1", "C1", "Beta GmbH").with_email("b@beta.de"))
            .unwrap();

        assert!(cache.find_by_name_exact("1", "alpha").is_none());
        assert!(cache.find_by_email("1", "a@alpha.de").is_none());
        assert_eq!(cache.find_by_name_exact("1", "BETA gmbh").unwrap().contact_id(), "C1");
        assert_eq!(cache.find_by_email("1", "B@Beta.de").unwrap().contact_id(), "C1");
    }

    #[test]
    fn digits_fallback_respects_country_prefixes() {
        let cache = ContactCache::new();
        cache
            .upsert(contact("1", "PLC", "Polish Co").with_tax_id("PL5261040828", None))
            .unwrap();
        cache
            .upsert(contact("1", "BARE", "Bare Co").with_tax_id("999888777", None))
            .unwrap();

        assert_eq!(cache.find_by_tax_id("1", "5261040828").unwrap().contact_id(), "PLC");
        assert!(cache.find_by_tax_id("1", "DE5261040828").is_none());
        assert_eq!(cache.find_by_tax_id("1", "EE999888777").unwrap().contact_id(), "BARE");
        assert_eq!(
            cache
                .find_by_tax_id_hinted("1", "526 104 08 28", Some("Poland"))
                .unwrap()
                .contact_id(),
            "PLC"
        );
    }

    #[test]
    fn digits_fallback_treats_long_prefixes_as_prefixes() {
        let cache = ContactCache::new();
        cache
            .upsert(contact("1", "SWISS", "Swiss AG").with_tax_id("CHE-123.456.789", None))
            .unwrap();

        assert!(cache.find_by_tax_id("1", "DE123456789").is_none());
        assert_eq!(cache.find_by_tax_id("1", "CHE123456789").unwrap().contact_id(), "SWISS");
        assert_eq!(cache.find_by_tax_id("1", "123456789").unwrap().contact_id(), "SWISS");
    }

    #[test]
    fn duplicates_and_type_filter() {
        let cache = ContactCache::new();
        cache
            .upsert(
                contact("1", "A", "Alpha")
                    .with_tax_id("PL111", None)
                    .with_email("office@alpha.pl")
                    .with_contact_type(ContactType::Vendor),
            )
            .unwrap();
        cache
            .upsert(
                contact("1", "B", "Alpha Branch")
                    .with_tax_id("pl 111", None)
                    .with_email("office@alpha.pl")
                    .with_contact_type(ContactType::Customer),
            )
            .unwrap();
        cache
            .upsert(
                contact("1", "C", "Gamma")
                    .with_email("OFFICE@alpha.pl")
                    .with_contact_type(ContactType::Vendor),
            )
            .unwrap();
        cache.upsert(contact("2", "D", "Delta").with_tax_id("PL111", None)).unwrap();

        let dups = cache.duplicates("1");
        assert_eq!(dups.tax_ids.len(), 1);
        assert_eq!(
            dups.tax_ids["PL111"].iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["A", "B"]
        );
        assert_eq!(dups.emails["office@alpha.pl"].len(), 3);
        assert!(cache.duplicates("2").is_empty());

        let stats = cache.stats(None);
        assert_eq!(stats.duplicate_tax_ids, 1);
        assert_eq!(stats.duplicate_emails, 1);

        cache.remove("1", "B");
        assert!(cache.duplicates("1").tax_ids.is_empty());

        let vendors: Vec<String> = cache
            .contacts_of_type("1", ContactType::Vendor)
            .iter()
            .map(|c| c.contact_id().to_string())
            .collect();
        assert_eq!(vendors, vec!["A", "C"]);
        assert!(cache.contacts_of_type("1", ContactType::Customer).is_empty());
    }

    #[test]
    fn shared_key_prefers_most_recently_synced() {
        let cache = ContactCache::new();
        cache
            .upsert(contact("1", "A", "Same Name").with_last_synced_at(at(1)))
            .unwrap();
        cache
            .upsert(contact("1", "B", "Same Name").with_last_synced_at(at(2)))
            .unwrap();
        assert_eq!(cache.find_by_name_exact("1", "same name").unwrap().contact_id(), "B");

        // Removing one leaves the other reachable.
        cache.remove("1", "B");
        assert_eq!(cache.find_by_name_exact("1", "same name").unwrap().contact_id(), "A");
    }

    #[test]
    fn fuzzy_results_are_ranked_deterministically() {
        let cache = ContactCache::new();
        cache
            .upsert(contact("1", "X", "Nordic Parts").with_last_synced_at(at(1)))
            .unwrap();
        cache
            .upsert(contact("1", "Y", "Nordic Parts Trading").with_last_synced_at(at(3)))
            .unwrap();
        cache
            .upsert(contact("1", "Z", "Nordic Parts").with_last_synced_at(at(2)))
            .unwrap();

        let ranked: Vec<String> = cache
            .find_by_name_fuzzy("1", "Nordic Parts", 0.6)
            .into_iter()
            .map(|(c, _)| c.contact_id().to_string())
            .collect();
        assert_eq!(ranked, vec!["Z", "X", "Y"]);
    }

    #[test]
    fn upsert_if_newer_enforces_revision_order() {
        let cache = ContactCache::new();
        let t1 = at(1);
        let t2 = at(2);
        let newer = Contact::new("1", "C1", "Newer", Revision::explicit("v2", Some(t2)));
        let older = Contact::new("1", "C1", "Older", Revision::explicit("v1", Some(t1)));

        assert_eq!(cache.upsert_if_newer(newer.clone()).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(cache.upsert_if_newer(newer).unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(cache.upsert_if_newer(older).unwrap(), UpsertOutcome::Stale);
        assert_eq!(cache.get("1", "C1").unwrap().display_name(), "Newer");

        let untimed = Contact::new("1", "C1", "Untimed", Revision::explicit("v3", None))
            .with_last_synced_at(at(10));
        assert_eq!(cache.upsert_if_newer(untimed).unwrap(), UpsertOutcome::Replaced);
        assert_eq!(cache.get("1", "C1").unwrap().display_name(), "Untimed");

        // Unordered revisions: the earlier observation loses.
        let observed_earlier = Contact::new("1", "C1", "Earlier", Revision::explicit("v4", None))
            .with_last_synced_at(at(9));
        assert_eq!(cache.upsert_if_newer(observed_earlier).unwrap(), UpsertOutcome::Stale);
        assert_eq!(cache.get("1", "C1").unwrap().display_name(), "Untimed");
    }

    #[test]
    fn contact_without_ids_is_rejected() {
        let cache = ContactCache::new();
        let err = cache.upsert(contact("1", "", "Ghost")).unwrap_err();
        assert!(matches!(err, CacheError::MissingContactId));
        let err = cache.upsert(contact(" ", "C1", "Ghost")).unwrap_err();
        assert!(matches!(err, CacheError::MissingOrganizationId));
        assert!(cache.organizations().is_empty());
    }

    #[test]
    fn remove_if_synced_before_spares_fresh_writes() {
        let cache = ContactCache::new();
        cache
            .upsert(contact("1", "OLD", "Old").with_last_synced_at(at(1)))
            .unwrap();
        cache
            .upsert(contact("1", "NEW", "New").with_last_synced_at(at(5)))
            .unwrap();

        assert!(cache.remove_if_synced_before("1", "OLD", at(3)));
        assert!(!cache.remove_if_synced_before("1", "NEW", at(3)));
        assert_eq!(cache.len("1"), 1);
    }

    #[test]
    fn stats_aggregate_per_org_and_overall() {
        let cache = ContactCache::new();
        cache
            .upsert(
                contact("1", "A", "A")
                    .with_tax_id("PL1", None)
                    .with_contact_type(ContactType::Vendor),
            )
            .unwrap();
        cache
            .upsert(contact("1", "B", "B").with_contact_type(ContactType::Customer))
            .unwrap();
        cache.upsert(contact("2", "C", "C")).unwrap();
        cache.update_cursor("1", |c| c.last_full_sync_at = Some(at(4)));

        let all = cache.stats(None);
        assert_eq!(all.total, 3);
        assert_eq!(all.with_tax_id, 1);
        assert_eq!(all.vendors, 1);
        assert_eq!(all.customers, 1);
        assert_eq!(all.organizations, 2);
        assert_eq!(all.last_sync_times["1"], Some(at(4)));
        assert_eq!(all.last_sync_times["2"], None);

        let one = cache.stats(Some("2"));
        assert_eq!(one.total, 1);
        assert_eq!(one.organizations, 1);

        assert_eq!(cache.stats(Some("nope")), CacheStats::default());
    }

    #[test]
    fn replayed_history_matches_snapshot_reload() {
        let names = ["Acme", "Acme Trading", "Beta Ltd", "Gamma GmbH"];
        let taxes = [Some("PL1"), Some("PL2"), None, Some("DE9")];
        let emails = [Some("x@acme.pl"), None, Some("y@beta.co.uk")];

        let replayed = ContactCache::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut step = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for round in 0..400 {
            let id = format!("C{}", step() % 6);
            if step() % 5 == 0 {
                replayed.remove("1", &id);
                continue;
            }
            let mut c = contact("1", &id, names[(step() % 4) as usize])
                .with_last_synced_at(at(1) + Duration::seconds(round));
            if let Some(t) = taxes[(step() % 4) as usize] {
                c = c.with_tax_id(t, None);
            }
            if let Some(e) = emails[(step() % 3) as usize] {
                c = c.with_email(e);
            }
            replayed.upsert(c).unwrap();
        }

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("contacts.json");
        replayed.save_snapshot(&path).unwrap();
        let reloaded = ContactCache::new();
        reloaded.load_snapshot(&path).unwrap();

        assert_eq!(
            replayed.index_fingerprint("1").unwrap(),
            reloaded.index_fingerprint("1").unwrap()
        );
    }
}
