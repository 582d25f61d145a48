mod cache;
mod config;
mod http;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use cache::{CacheStore, SqliteCacheStore};
use config::Config;
use http::{HttpFetcher, Request};
use worker::{Notification, NotificationSink, SqlitePendingStore, Worker};

#[derive(Parser, Debug)]
#[command(name = "pilot-sw")]
#[command(about = "Offline-first caching worker for the RankPilot web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pilot-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-populate the static cache and retire stale cache versions
  Install,
  /// Run one request through the worker and print the outcome
  Fetch {
    /// Root-relative path or absolute URL
    path: String,
  },
  /// Replay a pending offline queue (e.g. content-analysis-sync)
  Sync { tag: String },
  /// List caches and their entries
  Status,
}

/// Host-side notification sink: the CLI has no notification surface, so
/// surfaced notifications go to the log.
struct LogSink;

impl NotificationSink for LogSink {
  fn show(&self, notification: &Notification) -> Result<()> {
    info!("Notification [{}] {}: {}", notification.tag, notification.title, notification.body);
    Ok(())
  }
}

/// File-based logging; the guard must live until exit so buffered lines
/// are flushed.
fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("pilot-sw");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let appender = tracing_appender::rolling::never(log_dir, "pilot-sw.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing()?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let caches = Arc::new(SqliteCacheStore::open(&config.cache_db_path()?)?);
  let fetcher = Arc::new(HttpFetcher::new(config.network_timeout())?);
  let worker = Worker::new(config.clone(), Arc::clone(&caches), fetcher)?;

  match args.command {
    Command::Install => {
      let report = worker.on_install().await?;
      let deleted = worker.on_activate()?;

      println!(
        "Cached {} assets ({} failed), deleted {} stale caches",
        report.cached.len(),
        report.failed.len(),
        deleted.len()
      );
      for path in &report.failed {
        println!("  failed: {}", path);
      }
    }
    Command::Fetch { path } => {
      let url = if path.starts_with("http://") || path.starts_with("https://") {
        Url::parse(&path).map_err(|e| eyre!("Invalid URL '{}': {}", path, e))?
      } else {
        config
          .origin_url()?
          .join(&path)
          .map_err(|e| eyre!("Invalid path '{}': {}", path, e))?
      };

      let request = Request::get(url);
      match worker.on_fetch(&request).await {
        Some(response) => println!(
          "{} {} ({} bytes)",
          response.status,
          request.url,
          response.body.len()
        ),
        None => println!("{} not intercepted", request.url),
      }
    }
    Command::Sync { tag } => {
      let store = SqlitePendingStore::open(&config.sync_db_path()?)?;
      let report = worker.on_sync(&tag, &store, &LogSink).await?;

      println!(
        "{} replayed, {} dead-lettered, {} deferred",
        report.replayed, report.dead_lettered, report.deferred
      );
    }
    Command::Status => {
      let names = caches.cache_names()?;
      if names.is_empty() {
        println!("No caches");
      }
      for name in names {
        let keys = caches.keys(&name)?;
        println!("{} ({} entries)", name, keys.len());
        for url in keys {
          println!("  {}", url);
        }
      }
    }
  }

  // Extend-lifetime contract: background refreshes must settle before the
  // process goes away.
  worker.drain().await?;

  Ok(())
}
