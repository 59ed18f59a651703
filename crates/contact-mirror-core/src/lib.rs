//! # Contact Mirror Core
//!
//! Network-free building blocks of the contact mirror: the contact data
//! model, key normalization, fuzzy name scoring, the indexed in-memory
//! cache with its snapshot persistence, and match resolution.
//!
//! This crate contains no tokio, HTTP client, or other async runtime
//! dependencies. Synchronization with the remote directory lives in the
//! `contact-mirror` crate, which drives the cache through
//! [`ContactCache::upsert_if_newer`] and [`ContactCache::remove`].

pub mod cache;
pub mod error;
pub mod fuzzy;
pub mod matcher;
pub mod models;
pub mod normalize;
pub mod snapshot;

pub use cache::{CacheStats, ContactCache, DuplicateKeys, UpsertOutcome};
pub use error::{CacheError, ResolveError};
pub use matcher::{MatchResolver, MatchResult, MatchedBy};
pub use models::{Contact, ContactDraft, ContactType, PartialSupplier, Revision, SyncCursor};
pub use snapshot::{check_snapshot, SnapshotSummary};
