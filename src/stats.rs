//! Cache statistics overview.
//!
//! Loads the snapshot and summarizes what is mirrored: contact counts,
//! tax-ID coverage, customer/vendor split, and per-organization sync
//! recency. Used by `cmirror stats` to confirm syncs are landing.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use contact_mirror_core::ContactCache;

use crate::config::Config;

/// Run the stats command: load the snapshot and print a summary.
pub fn run_stats(config: &Config, organization_id: Option<&str>) -> Result<()> {
    let path = &config.cache.snapshot_path;
    let cache = ContactCache::new();
    cache
        .load_snapshot_if_present(path)
        .with_context(|| format!("failed to load snapshot {}", path.display()))?;

    print!("{}", render_stats(&cache, path, organization_id));
    Ok(())
}

pub fn render_stats(cache: &ContactCache, snapshot: &Path, organization_id: Option<&str>) -> String {
    let stats = cache.stats(organization_id);
    let size = std::fs::metadata(snapshot).map(|m| m.len()).unwrap_or(0);
    let mut out = String::new();

    let _ = writeln!(out, "Contact Mirror — Cache Stats");
    let _ = writeln!(out, "============================");
    let _ = writeln!(out);
    let _ = writeln!(out, "  Snapshot:      {}", snapshot.display());
    let _ = writeln!(out, "  Size:          {}", format_bytes(size));
    let _ = writeln!(out);
    let _ = writeln!(out, "  Organizations: {}", stats.organizations);
    let _ = writeln!(out, "  Contacts:      {}", stats.total);
    let _ = writeln!(
        out,
        "  With tax ID:   {} / {} ({}%)",
        stats.with_tax_id,
        stats.total,
        if stats.total > 0 {
            stats.with_tax_id * 100 / stats.total
        } else {
            0
        }
    );
    let _ = writeln!(out, "  Customers:     {}", stats.customers);
    let _ = writeln!(out, "  Vendors:       {}", stats.vendors);
    let _ = writeln!(out, "  Shared tax ID: {}", stats.duplicate_tax_ids);
    let _ = writeln!(out, "  Shared email:  {}", stats.duplicate_emails);

    if let Some(org) = organization_id {
        let duplicates = cache.duplicates(org);
        if !duplicates.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "  Keys on more than one contact:");
            for (kind, keys) in [("tax ID", &duplicates.tax_ids), ("email", &duplicates.emails)] {
                for (key, ids) in keys {
                    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
                    let _ = writeln!(out, "    {:<7} {:<32} {}", kind, key, ids.join(", "));
                }
            }
        }
    }

    if !stats.last_sync_times.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  By organization:");
        let _ = writeln!(
            out,
            "  {:<24} {:>8}   {:<18} {}",
            "ORGANIZATION", "CONTACTS", "LAST FULL SYNC", "LAST WEBHOOK"
        );
        let _ = writeln!(out, "  {}", "-".repeat(76));

        for (org, last_sync) in &stats.last_sync_times {
            let cursor = cache.cursor(org);
            let _ = writeln!(
                out,
                "  {:<24} {:>8}   {:<18} {}",
                org,
                cache.len(org),
                last_sync.map(format_ts_relative).unwrap_or_else(|| "never".into()),
                cursor
                    .last_webhook_at
                    .map(format_ts_relative)
                    .unwrap_or_else(|| "never".into()),
            );
        }
    }

    let _ = writeln!(out);
    out
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use contact_mirror_core::{Contact, Revision};

    #[test]
    fn bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn relative_times() {
        let now = Utc::now();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - chrono::Duration::minutes(1)), "1 min ago");
        assert_eq!(format_ts_relative(now - chrono::Duration::hours(5)), "5 hours ago");
        let old = now - chrono::Duration::days(90);
        assert_eq!(format_ts_relative(old), format_ts_iso(old));
    }

    #[test]
    fn renders_per_organization_rows() {
        let cache = ContactCache::new();
        cache
            .upsert(
                Contact::new("20071234", "c1", "Acme Sp. z o.o.", Revision::explicit("1", None))
                    .with_tax_id("PL1234567890", None),
            )
            .unwrap();
        cache
            .upsert(Contact::new("20071234", "c2", "Beta", Revision::explicit("1", None)))
            .unwrap();

        let out = render_stats(&cache, Path::new("/nonexistent/contacts.json"), None);
        assert!(out.contains("Contacts:      2"));
        assert!(out.contains("With tax ID:   1 / 2 (50%)"));
        assert!(out.contains("20071234"));
        assert!(out.contains("never"));
        assert!(out.contains("Shared tax ID: 0"));
    }

    #[test]
    fn lists_shared_keys_for_one_organization() {
        let cache = ContactCache::new();
        for id in ["c1", "c2"] {
            cache
                .upsert(
                    Contact::new("20071234", id, "Acme", Revision::explicit("1", None))
                        .with_tax_id("PL5261040828", None),
                )
                .unwrap();
        }

        let out = render_stats(&cache, Path::new("/nonexistent/contacts.json"), Some("20071234"));
        assert!(out.contains("Shared tax ID: 1"));
        assert!(out.contains("PL5261040828"));
        assert!(out.contains("c1, c2"));

        let all = render_stats(&cache, Path::new("/nonexistent/contacts.json"), None);
        assert!(!all.contains("Keys on more than one contact"));
    }
}
