//! # Contact Mirror CLI (`cmirror`)
//!
//! ## Usage
//!
//! ```bash
//! cmirror --config ./config/cmirror.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cmirror sync <org\|all>` | Full sync from the remote directory, then save the snapshot |
//! | `cmirror stats [--org]` | Summarize the cached contacts |
//! | `cmirror resolve --org ...` | Match a supplier against the snapshot |
//! | `cmirror serve` | Start the HTTP API and webhook intake |
//! | `cmirror check-snapshot <path>` | Validate a snapshot file |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use contact_mirror::config::{self, Config};
use contact_mirror::core::{
    check_snapshot, CacheError, ContactCache, MatchResolver, PartialSupplier,
};
use contact_mirror::logging::{init_logging, LogFormat};
use contact_mirror::progress::ProgressMode;
use contact_mirror::retry::RetryPolicy;
use contact_mirror::server::{run_server, AppState};
use contact_mirror::stats;
use contact_mirror::zoho::HttpDirectoryClient;
use contact_mirror::{SyncEngine, SyncOptions, SyncReport};
use tracing::warn;

/// Contact Mirror CLI: a local, indexed mirror of a remote contact directory.
///
/// All commands except `check-snapshot` read a TOML configuration file.
/// See `config/cmirror.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cmirror",
    about = "Contact Mirror — a local, indexed mirror of a remote contact directory",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cmirror.toml")]
    config: PathBuf,

    /// Log output format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fully sync one organization, or `all` configured and cached ones.
    ///
    /// The snapshot is saved afterwards. Exits non-zero if any
    /// organization's sync aborted.
    Sync {
        /// Organization ID or `all`.
        #[arg(default_value = "all")]
        target: String,

        /// Progress on stderr. Defaults to human when stderr is a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Print the reports as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Summarize the cached contacts.
    Stats {
        /// Restrict to one organization.
        #[arg(long)]
        org: Option<String>,
    },

    /// Resolve a supplier against the snapshot and print the match as JSON.
    Resolve {
        #[arg(long)]
        org: String,
        #[arg(long)]
        tax_id: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        /// ISO code or country name, used as the tax-ID prefix hint.
        #[arg(long)]
        country: Option<String>,
    },

    /// Serve the HTTP API until interrupted.
    Serve,

    /// Validate a snapshot file without loading it into a cache.
    CheckSnapshot {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging("info", cli.log_format)?;

    match cli.command {
        Commands::CheckSnapshot { path } => {
            let summary = check_snapshot(&path)
                .with_context(|| format!("snapshot {} is not usable", path.display()))?;
            println!(
                "{}: ok ({} organizations, {} contacts, written {})",
                path.display(),
                summary.organizations,
                summary.contacts,
                summary.written_at.to_rfc3339()
            );
        }
        Commands::Sync {
            target,
            progress,
            json,
        } => {
            let cfg = config::load_config(&cli.config)?;
            run_sync(&cfg, &target, progress, json).await?
        }
        Commands::Stats { org } => {
            let cfg = config::load_config(&cli.config)?;
            stats::run_stats(&cfg, org.as_deref())?
        }
        Commands::Resolve {
            org,
            tax_id,
            name,
            email,
            country,
        } => {
            let cfg = config::load_config(&cli.config)?;
            let cache = Arc::new(load_cache(&cfg)?);
            let resolver =
                MatchResolver::new(cache).with_fuzzy_floor(cfg.matching.fuzzy_floor);
            let supplier = PartialSupplier {
                tax_id,
                name,
                email,
                country,
            };
            let result = resolver.resolve(&org, &supplier)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Serve => {
            let cfg = config::load_config(&cli.config)?;
            run_serve(&cfg).await?
        }
    }

    Ok(())
}

fn load_cache(cfg: &Config) -> Result<ContactCache> {
    let cache = ContactCache::new();
    cache
        .load_snapshot_if_present(&cfg.cache.snapshot_path)
        .with_context(|| {
            format!(
                "failed to load snapshot {}; run `cmirror sync all` to rebuild it",
                cfg.cache.snapshot_path.display()
            )
        })?;
    Ok(cache)
}

/// Cache for commands that repopulate it from the remote.
///
/// A corrupt snapshot is moved aside and the cache starts empty and not
/// ready, so matches stay unavailable until a full sync completes.
fn load_cache_or_rebuild(cfg: &Config) -> Result<ContactCache> {
    let path = &cfg.cache.snapshot_path;
    let cache = ContactCache::new();
    match cache.load_snapshot_if_present(path) {
        Ok(_) => Ok(cache),
        Err(CacheError::SnapshotCorrupt { reason, .. }) => {
            warn!(
                path = %path.display(),
                %reason,
                "snapshot is corrupt, starting from an empty cache until a full sync completes"
            );
            set_aside(path);
            Ok(ContactCache::new())
        }
        Err(e) => {
            Err(e).with_context(|| format!("failed to load snapshot {}", path.display()))
        }
    }
}

fn set_aside(path: &Path) {
    let mut aside = path.as_os_str().to_owned();
    aside.push(".corrupt");
    let aside = PathBuf::from(aside);
    match std::fs::rename(path, &aside) {
        Ok(()) => warn!(moved_to = %aside.display(), "corrupt snapshot kept for inspection"),
        Err(e) => warn!(path = %path.display(), error = %e, "could not move corrupt snapshot aside"),
    }
}

fn build_engine(cfg: &Config, cache: Arc<ContactCache>) -> Result<SyncEngine> {
    let client = HttpDirectoryClient::from_config(&cfg.remote)?;
    Ok(SyncEngine::new(
        cache,
        Arc::new(client),
        RetryPolicy::from_config(&cfg.sync, &cfg.remote),
        SyncOptions::from_config(cfg),
    ))
}

async fn run_sync(
    cfg: &Config,
    target: &str,
    progress: Option<ProgressMode>,
    json: bool,
) -> Result<()> {
    let cache = Arc::new(load_cache_or_rebuild(cfg)?);
    let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
    let engine = build_engine(cfg, cache)?.with_progress(Arc::from(progress.reporter()));

    let reports = if target == "all" {
        if cfg.remote.organizations.is_empty() && engine.cache().organizations().is_empty() {
            bail!("no organizations configured in [remote].organizations and none cached");
        }
        engine.full_sync_all().await
    } else {
        let report = engine.full_sync(target).await;
        std::iter::once((target.to_string(), report)).collect()
    };

    engine.finalize_sync()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in reports.values() {
            print_report(report);
        }
    }

    let aborted: Vec<&str> = reports
        .values()
        .filter(|r| r.fatal.is_some())
        .map(|r| r.organization_id.as_str())
        .collect();
    if !aborted.is_empty() {
        bail!("sync aborted for: {}", aborted.join(", "));
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    let status = if let Some(fatal) = &report.fatal {
        format!("aborted: {}", fatal)
    } else if report.cancelled {
        "cancelled".to_string()
    } else {
        "ok".to_string()
    };
    println!("sync {}", report.organization_id);
    println!("  status:        {}", status);
    println!("  listed:        {}", report.listed);
    println!("  processed:     {}", report.processed);
    println!("  upserted:      {}", report.upserted);
    println!("  unchanged:     {}", report.unchanged);
    println!("  stale skipped: {}", report.stale_skipped);
    println!("  removed:       {}", report.removed);
    println!("  failed:        {}", report.failed_count());
    for failure in report.failed.iter().take(10) {
        println!("    {}  {}", failure.contact_id, failure.error);
    }
    if report.failed_count() > 10 {
        println!("    ... and {} more", report.failed_count() - 10);
    }
    println!("  elapsed:       {:.1}s", report.elapsed.as_secs_f64());
}

async fn run_serve(cfg: &Config) -> Result<()> {
    let cache = Arc::new(load_cache_or_rebuild(cfg)?);
    let engine = Arc::new(build_engine(cfg, Arc::clone(&cache))?);
    let resolver = Arc::new(
        MatchResolver::new(Arc::clone(&cache)).with_fuzzy_floor(cfg.matching.fuzzy_floor),
    );

    let maintenance = engine.spawn_maintenance();
    if !cache.is_ready() {
        warn!("no snapshot loaded; matches are unavailable until the first full sync completes");
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine.full_sync_all().await;
        });
    }

    let state = AppState {
        engine: Arc::clone(&engine),
        resolver,
        webhook_secret: cfg.server.webhook_secret().map(Arc::from),
    };
    let served = run_server(&cfg.server.bind, state).await;

    maintenance.abort();
    if let Err(e) = engine.finalize_sync() {
        warn!(error = %e, "final snapshot failed");
    }
    served
}
