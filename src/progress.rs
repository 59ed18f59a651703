//! Full-sync progress reporting.
//!
//! Reports observable progress during `cmirror sync` so operators see which
//! organization is in which phase and how many contacts are left.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use serde::Serialize;

/// Sub-phase of an in-flight full sync.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Paging through the remote listing. Total unknown.
    Listing,
    /// Fetching full detail per contact and upserting. Counts known.
    Detailing,
    /// Removing contacts that disappeared remotely.
    Reconciling,
}

/// A single progress event for sync.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    Listing { organization: String, listed: u64 },
    Detailing {
        organization: String,
        n: u64,
        total: u64,
    },
    Reconciling { organization: String },
    Finished {
        organization: String,
        processed: u64,
        failed: u64,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the sync engine.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync 20071234  detailing  250 / 503 contacts".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Listing {
                organization,
                listed,
            } => format!(
                "sync {}  listing...  {} contacts\n",
                organization,
                format_number(*listed)
            ),
            SyncProgressEvent::Detailing {
                organization,
                n,
                total,
            } => format!(
                "sync {}  detailing  {} / {} contacts\n",
                organization,
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Reconciling { organization } => {
                format!("sync {}  reconciling...\n", organization)
            }
            SyncProgressEvent::Finished {
                organization,
                processed,
                failed,
            } => format!(
                "sync {}  done  {} processed, {} failed\n",
                organization,
                format_number(*processed),
                format_number(*failed)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Listing {
                organization,
                listed,
            } => serde_json::json!({
                "event": "progress",
                "organization": organization,
                "phase": "listing",
                "listed": listed
            }),
            SyncProgressEvent::Detailing {
                organization,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "organization": organization,
                "phase": "detailing",
                "n": n,
                "total": total
            }),
            SyncProgressEvent::Reconciling { organization } => serde_json::json!({
                "event": "progress",
                "organization": organization,
                "phase": "reconciling"
            }),
            SyncProgressEvent::Finished {
                organization,
                processed,
                failed,
            } => serde_json::json!({
                "event": "finished",
                "organization": organization,
                "processed": processed,
                "failed": failed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
