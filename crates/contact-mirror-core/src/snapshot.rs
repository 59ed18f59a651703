//! Snapshot persistence for [`ContactCache`].
//!
//! A snapshot holds the authoritative contact records and per-organization
//! [`SyncCursor`]s of every organization, plus counts used to validate the
//! file on load. Indices are never written: a load rebuilds them from the
//! records, so a reloaded cache is always internally consistent.
//!
//! # Format
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "written_at": "2024-05-01T12:00:00Z",
//!   "contact_count": 2,
//!   "organization_count": 1,
//!   "organizations": {
//!     "20071234": { "cursor": { ... }, "contacts": [ { ... }, { ... } ] }
//!   }
//! }
//! ```
//!
//! Writes go to a temporary file in the target directory, which is synced
//! and then renamed over the previous snapshot, so readers only ever see a
//! complete file.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::cache::{ContactCache, OrgShard};
use crate::error::CacheError;
use crate::models::{Contact, SyncCursor};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    format_version: u32,
    written_at: DateTime<Utc>,
    contact_count: usize,
    organization_count: usize,
    organizations: BTreeMap<String, OrgSection>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OrgSection {
    #[serde(default)]
    cursor: SyncCursor,
    contacts: Vec<Contact>,
}

/// What a load or save touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub organizations: usize,
    pub contacts: usize,
    pub written_at: DateTime<Utc>,
}

impl ContactCache {
    /// Replace the cache contents with a snapshot file.
    ///
    /// The file is parsed and validated in full before anything is
    /// installed; on any error the cache keeps its previous state.
    pub fn load_snapshot(&self, path: &Path) -> Result<SnapshotSummary, CacheError> {
        let bytes = fs::read(path).map_err(|e| CacheError::io(path, e))?;
        let (shards, cursors, summary) = parse_snapshot(path, &bytes)?;

        self.install(shards, cursors);
        self.mark_ready();
        info!(
            path = %path.display(),
            organizations = summary.organizations,
            contacts = summary.contacts,
            "loaded contact snapshot"
        );
        Ok(summary)
    }

    /// [`load_snapshot`](Self::load_snapshot), treating a missing file as
    /// an empty start rather than an error.
    pub fn load_snapshot_if_present(
        &self,
        path: &Path,
    ) -> Result<Option<SnapshotSummary>, CacheError> {
        if !path.exists() {
            debug!(path = %path.display(), "no snapshot present, starting empty");
            return Ok(None);
        }
        self.load_snapshot(path).map(Some)
    }

    /// Atomically write every organization's contacts and cursor to `path`.
    pub fn save_snapshot(&self, path: &Path) -> Result<SnapshotSummary, CacheError> {
        let exported = self.export();
        let written_at = Utc::now();

        let organizations: BTreeMap<String, OrgSection> = exported
            .into_iter()
            .map(|(org, export)| {
                let contacts = export.contacts.iter().map(|c| Contact::clone(c)).collect();
                (
                    org,
                    OrgSection {
                        cursor: export.cursor,
                        contacts,
                    },
                )
            })
            .collect();
        let contact_count = organizations.values().map(|s| s.contacts.len()).sum();
        let file = SnapshotFile {
            format_version: SNAPSHOT_FORMAT_VERSION,
            written_at,
            contact_count,
            organization_count: organizations.len(),
            organizations,
        };

        write_atomic(path, &file)?;

        let summary = SnapshotSummary {
            organizations: file.organization_count,
            contacts: file.contact_count,
            written_at,
        };
        info!(
            path = %path.display(),
            organizations = summary.organizations,
            contacts = summary.contacts,
            "saved contact snapshot"
        );
        Ok(summary)
    }
}

/// Validate a snapshot without touching any cache.
pub fn check_snapshot(path: &Path) -> Result<SnapshotSummary, CacheError> {
    let bytes = fs::read(path).map_err(|e| CacheError::io(path, e))?;
    parse_snapshot(path, &bytes).map(|(_, _, summary)| summary)
}

type Parsed = (
    HashMap<String, OrgShard>,
    HashMap<String, SyncCursor>,
    SnapshotSummary,
);

fn parse_snapshot(path: &Path, bytes: &[u8]) -> Result<Parsed, CacheError> {
    let file: SnapshotFile = serde_json::from_slice(bytes)
        .map_err(|e| CacheError::corrupt(path, format!("invalid JSON: {}", e)))?;

    if file.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(CacheError::corrupt(
            path,
            format!("unsupported format_version {}", file.format_version),
        ));
    }
    if file.organization_count != file.organizations.len() {
        return Err(CacheError::corrupt(
            path,
            format!(
                "organization_count is {} but {} organizations are present",
                file.organization_count,
                file.organizations.len()
            ),
        ));
    }

    let mut shards = HashMap::with_capacity(file.organizations.len());
    let mut cursors = HashMap::with_capacity(file.organizations.len());
    let mut total = 0usize;

    for (org, section) in file.organizations {
        if org.trim().is_empty() {
            return Err(CacheError::corrupt(path, "empty organization id"));
        }
        let mut seen = HashSet::with_capacity(section.contacts.len());
        let mut shard = OrgShard::default();

        for mut contact in section.contacts {
            if contact.contact_id().trim().is_empty() {
                return Err(CacheError::corrupt(
                    path,
                    format!("contact without contact_id in organization {}", org),
                ));
            }
            if contact.organization_id() != org {
                return Err(CacheError::corrupt(
                    path,
                    format!(
                        "contact {} filed under {} but belongs to {}",
                        contact.contact_id(),
                        org,
                        contact.organization_id()
                    ),
                ));
            }
            if !seen.insert(contact.contact_id().to_string()) {
                return Err(CacheError::corrupt(
                    path,
                    format!("duplicate contact {} in organization {}", contact.contact_id(), org),
                ));
            }
            contact.refresh_derived();
            shard.insert(std::sync::Arc::new(contact));
            total += 1;
        }

        cursors.insert(org.clone(), section.cursor);
        shards.insert(org, shard);
    }

    if total != file.contact_count {
        return Err(CacheError::corrupt(
            path,
            format!(
                "contact_count is {} but {} contacts are present",
                file.contact_count, total
            ),
        ));
    }

    let summary = SnapshotSummary {
        organizations: shards.len(),
        contacts: total,
        written_at: file.written_at,
    };
    Ok((shards, cursors, summary))
}

fn write_atomic(path: &Path, file: &SnapshotFile) -> Result<(), CacheError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;

    let tmp = NamedTempFile::new_in(dir).map_err(|e| CacheError::io(dir, e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer(&mut writer, file)
            .map_err(|e| CacheError::io(tmp.path(), e.into()))?;
        writer.flush().map_err(|e| CacheError::io(tmp.path(), e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| CacheError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| CacheError::io(path, e.error))?;

    // Make the rename itself durable; not every platform allows this.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContactType, Revision};
    use tempfile::TempDir;

    fn seeded_cache() -> ContactCache {
        let cache = ContactCache::new();
        cache
            .upsert(
                Contact::new("1", "C1", "Acme Sp. z o.o.", Revision::explicit("r1", None))
                    .with_tax_id("526-104-08-28", Some("PL"))
                    .with_email("Billing@Acme.pl")
                    .with_contact_type(ContactType::Vendor),
            )
            .unwrap();
        cache
            .upsert(Contact::new("1", "C2", "Nordic Parts OÜ", Revision::explicit("r2", None)))
            .unwrap();
        cache
            .upsert(Contact::new("2", "C9", "Gamma GmbH", Revision::explicit("r9", None)))
            .unwrap();
        cache.update_cursor("1", |c| {
            c.last_full_sync_at = Some(Utc::now());
            c.last_webhook_event_id = Some("evt-7".into());
        });
        cache
    }

    #[test]
    fn save_then_load_rebuilds_identical_indices() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snap").join("contacts.json");
        let original = seeded_cache();

        let saved = original.save_snapshot(&path).unwrap();
        assert_eq!(saved.contacts, 3);
        assert_eq!(saved.organizations, 2);

        let loaded = ContactCache::new();
        assert!(!loaded.is_ready());
        let summary = loaded.load_snapshot(&path).unwrap();
        assert_eq!(summary.contacts, 3);
        assert!(loaded.is_ready());

        for org in ["1", "2"] {
            assert_eq!(original.index_fingerprint(org), loaded.index_fingerprint(org));
        }
        assert_eq!(loaded.cursor("1"), original.cursor("1"));
        assert_eq!(
            loaded.find_by_tax_id("1", "PL5261040828").unwrap().contact_id(),
            "C1"
        );
        assert_eq!(loaded.find_by_email("1", "billing@acme.pl").unwrap().contact_id(), "C1");
    }

    #[test]
    fn corrupt_snapshot_leaves_cache_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.json");
        fs::write(&path, b"{\"format_version\": 1, \"organizations\": ").unwrap();

        let cache = seeded_cache();
        let before = cache.index_fingerprint("1");
        let err = cache.load_snapshot(&path).unwrap_err();
        assert!(matches!(err, CacheError::SnapshotCorrupt { .. }));
        assert_eq!(cache.index_fingerprint("1"), before);
    }

    #[test]
    fn count_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.json");
        seeded_cache().save_snapshot(&path).unwrap();

        let mut raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        raw["contact_count"] = serde_json::json!(99);
        fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        let err = check_snapshot(&path).unwrap_err();
        assert!(err.to_string().contains("contact_count"), "{}", err);
    }

    #[test]
    fn misfiled_and_duplicate_contacts_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.json");
        seeded_cache().save_snapshot(&path).unwrap();
        let pristine: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();

        let mut misfiled = pristine.clone();
        misfiled["organizations"]["2"]["contacts"][0]["organization_id"] = serde_json::json!("1");
        fs::write(&path, serde_json::to_vec(&misfiled).unwrap()).unwrap();
        assert!(check_snapshot(&path).unwrap_err().to_string().contains("belongs to"));

        let mut duplicated = pristine;
        let first = duplicated["organizations"]["1"]["contacts"][0].clone();
        duplicated["organizations"]["1"]["contacts"][1] = first;
        fs::write(&path, serde_json::to_vec(&duplicated).unwrap()).unwrap();
        assert!(check_snapshot(&path).unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn missing_snapshot_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let cache = ContactCache::new();
        let loaded = cache
            .load_snapshot_if_present(&dir.path().join("absent.json"))
            .unwrap();
        assert!(loaded.is_none());
        assert!(!cache.is_ready());
    }

    #[test]
    fn save_replaces_previous_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.json");
        let cache = seeded_cache();
        cache.save_snapshot(&path).unwrap();
        cache.remove("2", "C9");
        cache.save_snapshot(&path).unwrap();

        assert_eq!(check_snapshot(&path).unwrap().contacts, 2);
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
