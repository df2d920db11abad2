//! Rollcall - command-line front end for the offline-first task cache.
//!
//! Each invocation restores the persisted cache, runs one command against it,
//! waits for background status commits, and writes the cache back.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rollcall_core::api::ApiClient;
use rollcall_core::cache::{
    CacheEntry, CacheKey, CacheManager, DurableStore, FileStore, HistoryFetch, MemoryStore,
};
use rollcall_core::config::Config;
use rollcall_core::models::{TaskItem, TaskStatus};

/// Environment variable holding the bearer token for the backend
const TOKEN_ENV: &str = "ROLLCALL_API_TOKEN";

/// Log file prefix inside the cache directory
const LOG_FILE_PREFIX: &str = "rollcall.log";

#[derive(Parser, Debug)]
#[command(name = "rollcall")]
#[command(about = "Offline-first task cache for the attendance app")]
#[command(version)]
struct Cli {
    /// Path to config file (default: $XDG_CONFIG_HOME/rollcall/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Company to act for
    #[arg(long)]
    company: Option<String>,

    /// Employee to act as
    #[arg(long)]
    employee: Option<String>,

    /// Backend base URL
    #[arg(long)]
    api_url: Option<String>,

    /// Keep the cache in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the task list for a project on a date
    Tasks {
        date: NaiveDate,
        project: String,
        /// Fetch from the server even when cached
        #[arg(short, long)]
        refresh: bool,
    },
    /// Change a task's status
    Status {
        date: NaiveDate,
        project: String,
        task: String,
        /// pending, in-progress, done or blocked
        status: TaskStatus,
    },
    /// Load attendance history for a date range
    History { start: NaiveDate, end: NaiveDate },
    /// List cached task lists
    Cached,
    /// Drop every cached task list
    Clear,
    /// Write the effective settings (config file plus flags) to the config file
    Init,
}

/// Initialize the tracing subscriber for logging.
/// The returned guard flushes the log file on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn apply_overrides(config: Config, cli: &Cli) -> Config {
    Config {
        company: cli.company.clone().or(config.company),
        employee: cli.employee.clone().or(config.employee),
        api_base_url: cli.api_url.clone().or(config.api_base_url),
        ..config
    }
}

fn print_tasks(key: &CacheKey, items: &[TaskItem], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(items)?);
        return Ok(());
    }
    println!("{} ({} tasks)", key, items.len());
    for task in items {
        println!("  {:<12} {:<12} {}", task.id, task.status.display_name(), task.name);
    }
    Ok(())
}

/// Why `ensure` came back empty: the recorded fetch error, if any.
fn load_failure(cache: &CacheManager, key: &CacheKey) -> String {
    cache
        .get(key)
        .and_then(|entry| entry.error)
        .unwrap_or_else(|| "no data".to_string())
}

/// JSON form of `cached`: one object per key, failed entries included.
fn cached_listing(entries: &[(CacheKey, CacheEntry)]) -> serde_json::Value {
    let listing: serde_json::Map<String, serde_json::Value> = entries
        .iter()
        .map(|(key, entry)| {
            let value = serde_json::json!({
                "items": entry.items,
                "loading": entry.loading,
                "error": entry.error,
                "timestamp": entry.timestamp,
            });
            (key.to_string(), value)
        })
        .collect();
    serde_json::Value::Object(listing)
}

async fn run(cache: &CacheManager, command: Command, json: bool) -> Result<()> {
    match command {
        Command::Tasks { date, project, refresh } => {
            let key = CacheKey::new(date, project)?;
            match cache.ensure(&key, refresh).await {
                Some(items) => {
                    print_tasks(&key, &items, json)?;
                    if let Some(entry) = cache.get(&key) {
                        eprintln!("Updated {}", entry.age_display());
                    }
                }
                None => {
                    anyhow::bail!("Could not load tasks for {}: {}", key, load_failure(cache, &key));
                }
            }
        }
        Command::Status {
            date,
            project,
            task,
            status,
        } => {
            let key = CacheKey::new(date, project)?;
            // Edits need a cached list to apply to
            if cache.ensure(&key, false).await.is_none() {
                anyhow::bail!("Could not load tasks for {}: {}", key, load_failure(cache, &key));
            }
            cache.update_status(&key, &task, status).await?;
            cache.settle().await;

            if cache.unconfirmed(&key).is_empty() {
                println!("{} -> {}", task, status.display_name());
            } else {
                println!(
                    "{} -> {} (saved locally, server did not confirm)",
                    task,
                    status.display_name()
                );
            }
        }
        Command::History { start, end } => {
            if end < start {
                anyhow::bail!("End date {} is before start date {}", end, start);
            }
            match cache.fetch_range(start, end).await {
                HistoryFetch::Fetched { .. } => {
                    let days = cache.history().map(|range| range.days).unwrap_or_default();
                    if json {
                        println!("{}", serde_json::to_string_pretty(&days)?);
                    } else {
                        for day in &days {
                            println!("  {}  {:<10} {}", day.date, day.status, day.punch_display());
                        }
                    }
                }
                HistoryFetch::SuppressedInFlight | HistoryFetch::SuppressedCooldown => {
                    info!("History request suppressed");
                }
                HistoryFetch::Failed(message) => {
                    anyhow::bail!("Could not load history: {}", message);
                }
            }
        }
        Command::Cached => {
            let entries: Vec<(CacheKey, CacheEntry)> = cache
                .keys()
                .into_iter()
                .filter_map(|key| cache.get(&key).map(|entry| (key, entry)))
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&cached_listing(&entries))?);
            } else {
                for (key, entry) in &entries {
                    let count = entry.items.as_ref().map_or(0, Vec::len);
                    println!("  {:<40} {:>4} tasks  {}", key, count, entry.age_display());
                }
            }
        }
        Command::Clear => {
            cache.clear_all().await;
            println!("Cache cleared");
        }
        Command::Init => anyhow::bail!("init runs without opening the cache"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let config = apply_overrides(config, &cli);

    if let Command::Init = cli.command {
        match cli.config {
            Some(ref path) => config.save_to(path)?,
            None => config.save()?,
        }
        println!("Config written");
        return Ok(());
    }

    let cache_dir = config.cache_dir()?;
    let log_dir = if cli.ephemeral { None } else { Some(cache_dir.as_path()) };
    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create cache directory: {}", dir.display()))?;
    }
    let _log_guard = init_tracing(log_dir);
    info!("Rollcall starting");

    let session = config.session()?;
    let base_url = config
        .api_base_url
        .clone()
        .context("No API URL configured (set \"api_base_url\" in config or pass --api-url)")?;

    let mut client = ApiClient::new(base_url)?;
    match std::env::var(TOKEN_ENV) {
        Ok(token) if !token.is_empty() => client.set_token(token),
        _ => warn!("{} not set; sending unauthenticated requests", TOKEN_ENV),
    }

    let store: Arc<dyn DurableStore> = if cli.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        let store = FileStore::new(cache_dir)?;
        info!(dir = %store.dir().display(), "Using on-disk task cache");
        Arc::new(store)
    };

    let cache = CacheManager::with_client(client, store, session, config.cache_options());
    cache.load().await;

    let result = run(&cache, cli.command, cli.json).await;
    cache.close().await;

    info!("Rollcall shutting down");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rollcall_core::cache::{CacheOptions, SessionContext};

    fn key() -> CacheKey {
        CacheKey::new(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(), "SiteA").unwrap()
    }

    fn unreachable_cache() -> CacheManager {
        // Nothing listens on port 1, so every fetch fails fast
        CacheManager::with_client(
            ApiClient::new("http://127.0.0.1:1").unwrap(),
            Arc::new(MemoryStore::new()),
            SessionContext::new("acme", "E-1001"),
            CacheOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_status_reports_fetch_error() {
        let cache = unreachable_cache();
        let command = Command::Status {
            date: key().date(),
            project: "SiteA".to_string(),
            task: "t1".to_string(),
            status: TaskStatus::Done,
        };

        let err = run(&cache, command, false).await.unwrap_err().to_string();
        assert!(err.starts_with("Could not load tasks for 2024-01-05|SiteA"));
        assert!(!err.contains("No task list cached"));
        assert!(err.contains(&cache.get(&key()).unwrap().error.unwrap()));
    }

    #[test]
    fn test_cached_listing_json() {
        let now = Utc::now();
        let loaded = CacheEntry::loaded(
            vec![TaskItem::new("t1", "Inspection", TaskStatus::Pending)],
            now,
        );
        let failed = CacheEntry::failed("Server error: down", now);
        let other = CacheKey::new(key().date(), "SiteB").unwrap();

        let listing = cached_listing(&[(key(), loaded), (other, failed)]);
        assert_eq!(
            listing["2024-01-05|SiteA"]["items"],
            serde_json::json!([{"id": "t1", "name": "Inspection", "status": "pending"}])
        );
        assert_eq!(listing["2024-01-05|SiteA"]["loading"], false);
        assert_eq!(listing["2024-01-05|SiteB"]["items"], serde_json::Value::Null);
        assert_eq!(listing["2024-01-05|SiteB"]["error"], "Server error: down");
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "rollcall", "--company", "globex", "--api-url", "http://localhost:8080", "cached", "--json",
        ]);
        let config = Config {
            company: Some("acme".to_string()),
            employee: Some("E-1001".to_string()),
            ..Config::default()
        };
        let config = apply_overrides(config, &cli);
        assert_eq!(config.company.as_deref(), Some("globex"));
        assert_eq!(config.employee.as_deref(), Some("E-1001"));
        assert_eq!(config.api_base_url.as_deref(), Some("http://localhost:8080"));
        assert!(cli.json);
    }
}
