//! # Contact Mirror
//!
//! A local, indexed mirror of an accounting system's contact directory.
//!
//! Documents arriving in a processing pipeline name a counterparty by tax
//! ID, name, or email. Contact Mirror answers "which remote contact is this"
//! from memory, keeps the mirror current through full syncs and webhooks,
//! and writes newly confirmed contacts back to the remote directory.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Remote API   │──▶│ SyncEngine  │──▶│ ContactCache │
//! │ list/detail  │   │ sync+hooks  │   │   + indices  │
//! └──────────────┘   └─────────────┘   └──────┬───────┘
//!        ▲                  ▲                 │
//!        │ create/update    │ webhooks        ▼
//!        └──────────────────┤          ┌──────────────┐
//!                      ┌────┴─────┐    │MatchResolver │
//!                      │ HTTP/CLI │───▶│ tax>name>    │
//!                      │(cmirror) │    │ email>fuzzy  │
//!                      └──────────┘    └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cmirror sync all              # mirror every configured organization
//! cmirror stats                 # what is cached
//! cmirror resolve --org 20071234 --tax-id PL1234567890
//! cmirror serve                 # HTTP API + webhook intake
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`remote`] | Remote directory client trait and errors |
//! | [`zoho`] | HTTP implementation of the remote client |
//! | [`retry`] | Backoff with jitter |
//! | [`sync`] | Full sync, write-back, lifecycle |
//! | [`webhook`] | Webhook parsing, verification, queues |
//! | [`progress`] | Sync progress reporting |
//! | [`server`] | HTTP API |
//! | [`stats`] | `cmirror stats` output |
//!
//! The cache, indices, snapshot format and matcher live in
//! [`contact_mirror_core`], re-exported here as [`core`].

pub mod config;
pub mod error;
pub mod logging;
pub mod progress;
pub mod remote;
pub mod retry;
pub mod server;
pub mod stats;
pub mod sync;
pub mod webhook;
pub mod zoho;

pub use contact_mirror_core as core;
pub use error::SyncError;
pub use sync::{SyncEngine, SyncOptions, SyncReport, SyncState};
