use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use contact_mirror_core::fuzzy::{FUZZY_CONFIDENCE_MAX, FUZZY_CONFIDENCE_MIN};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    /// Seconds between timed snapshot writes; 0 disables the timer.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("./data/contacts.json")
}
fn default_snapshot_interval_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Scheme sent before the token in the `Authorization` header.
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Organizations synced by `sync all` and the maintenance task.
    #[serde(default)]
    pub organizations: Vec<String>,
}

fn default_base_url() -> String {
    "https://www.zohoapis.eu/books/v3".to_string()
}
fn default_token_env() -> String {
    "CMIRROR_REMOTE_TOKEN".to_string()
}
fn default_auth_scheme() -> String {
    "Zoho-oauthtoken".to_string()
}
fn default_page_size() -> u32 {
    200
}
fn default_timeout_secs() -> u64 {
    30
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Read the access token from the configured environment variable.
    pub fn token(&self) -> Result<String> {
        std::env::var(&self.token_env).with_context(|| {
            format!(
                "Remote access token not set: export {} before syncing",
                self.token_env
            )
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_detail_concurrency")]
    pub detail_concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_webhook_max_attempts")]
    pub webhook_max_attempts: u32,
    /// Applied `(contact_id, event_id)` pairs remembered per organization.
    #[serde(default = "default_webhook_dedup_capacity")]
    pub webhook_dedup_capacity: usize,
    /// An organization not fully synced for this long counts as starved.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            detail_concurrency: default_detail_concurrency(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            webhook_max_attempts: default_webhook_max_attempts(),
            webhook_dedup_capacity: default_webhook_dedup_capacity(),
            stale_after_secs: default_stale_after_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

fn default_detail_concurrency() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_webhook_max_attempts() -> u32 {
    3
}
fn default_webhook_dedup_capacity() -> usize {
    1024
}
fn default_stale_after_secs() -> u64 {
    86_400
}
fn default_maintenance_interval_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    #[serde(default = "default_fuzzy_floor")]
    pub fuzzy_floor: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            fuzzy_floor: default_fuzzy_floor(),
        }
    }
}

fn default_fuzzy_floor() -> f64 {
    FUZZY_CONFIDENCE_MIN
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Environment variable holding the webhook signing secret. When it
    /// names a variable that is set, unsigned webhooks are rejected.
    #[serde(default)]
    pub webhook_secret_env: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            webhook_secret_env: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl ServerConfig {
    pub fn webhook_secret(&self) -> Option<String> {
        self.webhook_secret_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|s| !s.is_empty())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate remote
    if config.remote.page_size == 0 {
        anyhow::bail!("remote.page_size must be > 0");
    }
    if config.remote.timeout_secs == 0 {
        anyhow::bail!("remote.timeout_secs must be > 0");
    }
    if config.remote.base_url.trim().is_empty() {
        anyhow::bail!("remote.base_url must not be empty");
    }

    // Validate sync
    if config.sync.detail_concurrency == 0 {
        anyhow::bail!("sync.detail_concurrency must be > 0");
    }
    if config.sync.max_attempts == 0 || config.sync.webhook_max_attempts == 0 {
        anyhow::bail!("sync.max_attempts and sync.webhook_max_attempts must be >= 1");
    }
    if config.sync.base_delay_ms > config.sync.max_delay_ms {
        anyhow::bail!("sync.base_delay_ms must not exceed sync.max_delay_ms");
    }

    // Validate matching
    if !(FUZZY_CONFIDENCE_MIN..=FUZZY_CONFIDENCE_MAX).contains(&config.matching.fuzzy_floor) {
        anyhow::bail!(
            "matching.fuzzy_floor must be in [{}, {}]",
            FUZZY_CONFIDENCE_MIN,
            FUZZY_CONFIDENCE_MAX
        );
    }

    Ok(config)
}
