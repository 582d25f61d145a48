//! The worker itself: lifecycle handlers, fetch routing and the background
//! work registry.
//!
//! The worker is host-agnostic. A host adapter (see `main.rs`) constructs it
//! with a cache store and a fetcher, then forwards lifecycle and fetch
//! events to the `on_*` handlers. Every handler returns before its
//! background work necessarily finishes; the host must await [`Worker::drain`]
//! before tearing the process down, otherwise in-flight cache refreshes are
//! killed mid-write.

mod push;
mod strategy;
mod sync;
#[cfg(test)]
mod testing;

pub use push::{
  Notification, NotificationAction, NotificationClick, NotificationSink, WindowClient,
  WindowRegistry,
};
pub use strategy::{select_strategy, RoutePolicy, Strategy};
pub use sync::{
  MemoryPendingStore, PendingRequest, PendingStore, SqlitePendingStore, SyncQueue, SyncReport,
  MAX_REPLAY_ATTEMPTS,
};

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{request_key, CacheStore};
use crate::config::Config;
use crate::http::{Fetcher, Request};

/// Lifecycle states, driven by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  Installed,
  Activating,
  Activated,
}

/// Outcome of pre-populating the static cache on install.
///
/// Failures are per-URL and never abort the rest of the list.
#[derive(Debug, Default)]
pub struct InstallReport {
  /// Paths successfully cached
  pub cached: Vec<String>,
  /// Paths that failed to fetch or store
  pub failed: Vec<String>,
}

/// The caching worker.
pub struct Worker<C: CacheStore + 'static, F: Fetcher + 'static> {
  caches: Arc<C>,
  fetcher: Arc<F>,
  config: Config,
  routes: RoutePolicy,
  state: Mutex<WorkerState>,
  /// Background refreshes not yet awaited; drained by the host.
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: CacheStore + 'static, F: Fetcher + 'static> Worker<C, F> {
  pub fn new(config: Config, caches: Arc<C>, fetcher: Arc<F>) -> Result<Self> {
    let routes = RoutePolicy::from_config(&config)?;

    Ok(Self {
      caches,
      fetcher,
      config,
      routes,
      state: Mutex::new(WorkerState::Installing),
      tasks: Mutex::new(Vec::new()),
    })
  }

  pub fn state(&self) -> WorkerState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(WorkerState::Installing)
  }

  fn set_state(&self, state: WorkerState) {
    if let Ok(mut s) = self.state.lock() {
      *s = state;
    }
  }

  pub(crate) fn config(&self) -> &Config {
    &self.config
  }

  pub(crate) fn routes(&self) -> &RoutePolicy {
    &self.routes
  }

  pub(crate) fn fetcher(&self) -> &Arc<F> {
    &self.fetcher
  }

  pub(crate) fn caches(&self) -> &Arc<C> {
    &self.caches
  }

  /// Install: pre-populate the static cache from the configured asset list.
  ///
  /// Each URL is fetched and stored independently; one missing asset must
  /// not abort the others, so the joins are all-settled rather than
  /// fail-fast. Finishes by skipping the waiting phase, so a new version
  /// replaces the previous worker immediately.
  pub async fn on_install(&self) -> Result<InstallReport> {
    let origin = self.config.origin_url()?;
    let static_cache = self.config.static_cache_name();

    let attempts = self.config.precache.iter().map(|path| {
      let origin = origin.clone();
      let static_cache = static_cache.clone();
      async move {
        let result = self.precache_one(&origin, &static_cache, path).await;
        (path.clone(), result)
      }
    });

    let mut report = InstallReport::default();
    for (path, result) in futures::future::join_all(attempts).await {
      match result {
        Ok(()) => report.cached.push(path),
        Err(e) => {
          warn!("Failed to pre-cache {}: {}", path, e);
          report.failed.push(path);
        }
      }
    }

    info!(
      "Install complete: {} cached, {} failed",
      report.cached.len(),
      report.failed.len()
    );

    // Skip waiting: replace any previous worker without waiting for
    // open tabs to close.
    self.set_state(WorkerState::Installed);

    Ok(report)
  }

  async fn precache_one(&self, origin: &url::Url, cache: &str, path: &str) -> Result<()> {
    let url = origin
      .join(path)
      .map_err(|e| eyre!("Invalid precache path '{}': {}", path, e))?;

    let request = Request::get(url);
    let response = self.fetcher.fetch(&request).await?;
    if !response.is_ok() {
      return Err(eyre!("Unexpected status {}", response.status));
    }

    self
      .caches
      .put(cache, &request_key(&request), request.url.as_str(), &response)
  }

  /// Activate: evict every cache that is not one of the two current names,
  /// then take control of open clients immediately.
  ///
  /// This is the sole eviction mechanism; entries have no TTL. Running it
  /// twice in a row deletes nothing the second time.
  pub fn on_activate(&self) -> Result<Vec<String>> {
    self.set_state(WorkerState::Activating);

    let keep = [
      self.config.static_cache_name(),
      self.config.dynamic_cache_name(),
    ];

    let mut deleted = Vec::new();
    for name in self.caches.cache_names()? {
      if !keep.contains(&name) {
        self.caches.delete_cache(&name)?;
        info!("Deleted stale cache {}", name);
        deleted.push(name);
      }
    }

    // Claim clients: control all open tabs without waiting for a reload.
    self.set_state(WorkerState::Activated);
    debug!("Worker activated, controlling clients");

    Ok(deleted)
  }

  /// Register background work the host must not outlive.
  pub(crate) fn spawn_background(&self, fut: impl Future<Output = ()> + Send + 'static) {
    let handle = tokio::spawn(fut);
    if let Ok(mut tasks) = self.tasks.lock() {
      tasks.push(handle);
    }
  }

  /// Await all outstanding background work.
  ///
  /// This is the extend-lifetime contract: the host adapter calls it before
  /// teardown so that background cache refreshes and sync replays complete.
  pub async fn drain(&self) -> Result<()> {
    let handles = {
      let mut tasks = self
        .tasks
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      std::mem::take(&mut *tasks)
    };

    for handle in handles {
      if let Err(e) = handle.await {
        warn!("Background task panicked: {}", e);
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::testing::MockFetcher;
  use super::*;
  use crate::cache::MemoryCacheStore;
  use crate::http::Response;

  fn test_config() -> Config {
    Config {
      origin: "https://rankpilot.app".to_string(),
      precache: vec![
        "/".to_string(),
        "/dashboard".to_string(),
        "/favicon.ico".to_string(),
        "/manifest.json".to_string(),
      ],
      ..Config::default()
    }
  }

  fn worker(fetcher: MockFetcher) -> Worker<MemoryCacheStore, MockFetcher> {
    Worker::new(
      test_config(),
      Arc::new(MemoryCacheStore::new()),
      Arc::new(fetcher),
    )
    .unwrap()
  }

  #[tokio::test]
  async fn test_install_populates_static_cache() {
    let fetcher = MockFetcher::new();
    for path in ["/", "/dashboard", "/favicon.ico", "/manifest.json"] {
      fetcher.respond(path, Response::new(200).with_body(path));
    }

    let worker = worker(fetcher);
    let report = worker.on_install().await.unwrap();

    assert_eq!(report.cached.len(), 4);
    assert!(report.failed.is_empty());
    assert_eq!(worker.state(), WorkerState::Installed);

    let keys = worker.caches().keys("rankpilot-static-v1").unwrap();
    assert_eq!(keys.len(), 4);
  }

  #[tokio::test]
  async fn test_install_isolates_per_asset_failures() {
    let fetcher = MockFetcher::new();
    fetcher.respond("/", Response::new(200).with_body("home"));
    fetcher.respond("/dashboard", Response::new(200).with_body("dash"));
    fetcher.respond("/favicon.ico", Response::new(404));
    fetcher.respond("/manifest.json", Response::new(200).with_body("{}"));

    let worker = worker(fetcher);
    let report = worker.on_install().await.unwrap();

    assert_eq!(report.failed, vec!["/favicon.ico".to_string()]);

    let mut keys = worker.caches().keys("rankpilot-static-v1").unwrap();
    keys.sort();
    assert_eq!(
      keys,
      vec![
        "https://rankpilot.app/".to_string(),
        "https://rankpilot.app/dashboard".to_string(),
        "https://rankpilot.app/manifest.json".to_string(),
      ]
    );
  }

  #[tokio::test]
  async fn test_install_network_errors_do_not_abort() {
    let fetcher = MockFetcher::new();
    fetcher.respond("/", Response::new(200).with_body("home"));
    fetcher.fail("/dashboard");
    fetcher.respond("/favicon.ico", Response::new(200));
    fetcher.respond("/manifest.json", Response::new(200));

    let worker = worker(fetcher);
    let report = worker.on_install().await.unwrap();

    assert_eq!(report.cached.len(), 3);
    assert_eq!(report.failed, vec!["/dashboard".to_string()]);
  }

  #[tokio::test]
  async fn test_activate_deletes_only_stale_caches() {
    let worker = worker(MockFetcher::new());
    let resp = Response::new(200).with_body("x");
    let caches = worker.caches();
    caches.put("rankpilot-static-v1", "a", "/a", &resp).unwrap();
    caches.put("rankpilot-dynamic-v1", "b", "/b", &resp).unwrap();
    caches.put("rankpilot-static-v0", "c", "/c", &resp).unwrap();
    caches.put("other-app-cache", "d", "/d", &resp).unwrap();

    let deleted = worker.on_activate().unwrap();
    assert_eq!(
      deleted,
      vec!["other-app-cache".to_string(), "rankpilot-static-v0".to_string()]
    );
    assert_eq!(worker.state(), WorkerState::Activated);

    let names = caches.cache_names().unwrap();
    assert_eq!(
      names,
      vec![
        "rankpilot-dynamic-v1".to_string(),
        "rankpilot-static-v1".to_string(),
      ]
    );

    // Idempotent: a second activation finds nothing to delete
    assert!(worker.on_activate().unwrap().is_empty());
  }
}
