//! Background-sync replay of mutations attempted while offline.
//!
//! The host queues failed mutations into a [`PendingStore`] and later
//! dispatches a sync event with a queue tag. Replay is bounded: a 4xx reply
//! is treated as permanent and dead-letters the record immediately, and a
//! record that fails transiently [`MAX_REPLAY_ATTEMPTS`] times is
//! dead-lettered as well, so a poisoned record cannot be retried forever.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::http::{Fetcher, Method, Request};

use super::push::{Notification, NotificationSink};
use super::Worker;

/// Transient failures tolerated before a record is dead-lettered.
pub const MAX_REPLAY_ATTEMPTS: u32 = 5;

/// The two offline queues, identified by their sync tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncQueue {
  /// Content-analysis submissions, replayed with POST
  ContentAnalysis,
  /// User preference updates, replayed with PUT
  Preferences,
}

impl SyncQueue {
  pub fn from_tag(tag: &str) -> Option<Self> {
    match tag {
      "content-analysis-sync" => Some(SyncQueue::ContentAnalysis),
      "preferences-sync" => Some(SyncQueue::Preferences),
      _ => None,
    }
  }

  pub fn tag(&self) -> &'static str {
    match self {
      SyncQueue::ContentAnalysis => "content-analysis-sync",
      SyncQueue::Preferences => "preferences-sync",
    }
  }

  fn replay_method(&self) -> Method {
    match self {
      SyncQueue::ContentAnalysis => Method::Post,
      SyncQueue::Preferences => Method::Put,
    }
  }
}

/// A mutation captured while offline, waiting to be replayed.
#[derive(Debug, Clone)]
pub struct PendingRequest {
  pub id: i64,
  /// Target endpoint; root-relative paths are resolved against the origin
  pub url: String,
  pub body: serde_json::Value,
  /// Transient failures so far
  pub attempts: u32,
}

/// Persistence for pending offline requests, injected by the host.
pub trait PendingStore: Send + Sync {
  /// Queue a new mutation for later replay. Returns its id.
  fn enqueue(&self, queue: SyncQueue, url: &str, body: serde_json::Value) -> Result<i64>;

  /// All records currently waiting in a queue, oldest first.
  fn pending(&self, queue: SyncQueue) -> Result<Vec<PendingRequest>>;

  /// Delete a record after successful replay.
  fn remove(&self, queue: SyncQueue, id: i64) -> Result<()>;

  /// Count a transient failure. Returns the updated attempt count.
  fn record_attempt(&self, queue: SyncQueue, id: i64) -> Result<u32>;

  /// Dead-letter a record that will never succeed.
  fn discard(&self, queue: SyncQueue, id: i64) -> Result<()>;
}

/// Outcome of one sync event.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Successfully replayed and removed
  pub replayed: usize,
  /// Dropped permanently (4xx or attempt limit)
  pub dead_lettered: usize,
  /// Left queued for the next sync opportunity
  pub deferred: usize,
}

enum Replay {
  Delivered,
  Permanent(String),
  Transient(String),
}

impl<C: CacheStore + 'static, F: Fetcher + 'static> Worker<C, F> {
  /// Sync handler. Replays every pending record of the tagged queue;
  /// unknown tags are ignored.
  pub async fn on_sync(
    &self,
    tag: &str,
    store: &dyn PendingStore,
    notifications: &dyn NotificationSink,
  ) -> Result<SyncReport> {
    let Some(queue) = SyncQueue::from_tag(tag) else {
      warn!("Ignoring sync event with unknown tag '{}'", tag);
      return Ok(SyncReport::default());
    };

    let origin = self.config().origin_url()?;
    let mut report = SyncReport::default();

    for pending in store.pending(queue)? {
      match self.replay_one(&origin, queue, &pending).await {
        Replay::Delivered => {
          store.remove(queue, pending.id)?;
          if let Err(e) = notifications.show(&Notification::sync_complete(queue)) {
            warn!("Failed to show sync notification: {}", e);
          }
          report.replayed += 1;
        }
        Replay::Permanent(reason) => {
          warn!(
            "Dead-lettering {} request {} ({}): {}",
            queue.tag(),
            pending.id,
            pending.url,
            reason
          );
          store.discard(queue, pending.id)?;
          report.dead_lettered += 1;
        }
        Replay::Transient(reason) => {
          let attempts = store.record_attempt(queue, pending.id)?;
          if attempts >= MAX_REPLAY_ATTEMPTS {
            warn!(
              "Dead-lettering {} request {} after {} attempts: {}",
              queue.tag(),
              pending.id,
              attempts,
              reason
            );
            store.discard(queue, pending.id)?;
            report.dead_lettered += 1;
          } else {
            report.deferred += 1;
          }
        }
      }
    }

    info!(
      "Sync '{}': {} replayed, {} dead-lettered, {} deferred",
      tag, report.replayed, report.dead_lettered, report.deferred
    );

    Ok(report)
  }

  async fn replay_one(
    &self,
    origin: &url::Url,
    queue: SyncQueue,
    pending: &PendingRequest,
  ) -> Replay {
    let url = if pending.url.starts_with('/') {
      origin.join(&pending.url)
    } else {
      url::Url::parse(&pending.url)
    };
    let url = match url {
      Ok(u) => u,
      Err(e) => return Replay::Permanent(format!("invalid url: {}", e)),
    };

    let body = match serde_json::to_vec(&pending.body) {
      Ok(b) => b,
      Err(e) => return Replay::Permanent(format!("unserializable body: {}", e)),
    };

    let request = match queue.replay_method() {
      Method::Put => Request::put(url, body),
      _ => Request::post(url, body),
    };

    match self.fetcher().fetch(&request).await {
      Ok(resp) if resp.is_ok() => Replay::Delivered,
      Ok(resp) if (400..500).contains(&resp.status) => {
        Replay::Permanent(format!("rejected with status {}", resp.status))
      }
      Ok(resp) => Replay::Transient(format!("server status {}", resp.status)),
      Err(e) => Replay::Transient(e.to_string()),
    }
  }
}

/// In-memory pending store for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryPendingStore {
  queues: Mutex<HashMap<SyncQueue, Vec<PendingRequest>>>,
  dead: Mutex<Vec<(SyncQueue, PendingRequest)>>,
  next_id: AtomicI64,
}

#[allow(dead_code)]
impl MemoryPendingStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Dead-lettered records, in discard order.
  pub fn dead_letters(&self) -> Vec<(SyncQueue, PendingRequest)> {
    self.dead.lock().map(|d| d.clone()).unwrap_or_default()
  }
}

impl PendingStore for MemoryPendingStore {
  fn enqueue(&self, queue: SyncQueue, url: &str, body: serde_json::Value) -> Result<i64> {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let mut queues = self
      .queues
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    queues.entry(queue).or_default().push(PendingRequest {
      id,
      url: url.to_string(),
      body,
      attempts: 0,
    });

    Ok(id)
  }

  fn pending(&self, queue: SyncQueue) -> Result<Vec<PendingRequest>> {
    let queues = self
      .queues
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(queues.get(&queue).cloned().unwrap_or_default())
  }

  fn remove(&self, queue: SyncQueue, id: i64) -> Result<()> {
    let mut queues = self
      .queues
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(q) = queues.get_mut(&queue) {
      q.retain(|p| p.id != id);
    }
    Ok(())
  }

  fn record_attempt(&self, queue: SyncQueue, id: i64) -> Result<u32> {
    let mut queues = self
      .queues
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let pending = queues
      .get_mut(&queue)
      .and_then(|q| q.iter_mut().find(|p| p.id == id))
      .ok_or_else(|| eyre!("No pending request {} in {}", id, queue.tag()))?;

    pending.attempts += 1;
    Ok(pending.attempts)
  }

  fn discard(&self, queue: SyncQueue, id: i64) -> Result<()> {
    let mut queues = self
      .queues
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(q) = queues.get_mut(&queue) {
      if let Some(pos) = q.iter().position(|p| p.id == id) {
        let record = q.remove(pos);
        self
          .dead
          .lock()
          .map_err(|e| eyre!("Lock poisoned: {}", e))?
          .push((queue, record));
      }
    }
    Ok(())
  }
}

/// SQLite-backed pending store used by the host adapter.
pub struct SqlitePendingStore {
  conn: Mutex<Connection>,
}

const SYNC_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    url TEXT NOT NULL,
    body BLOB NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_pending_queue ON pending_requests(queue, id);

-- Records that will never be replayed, kept for inspection
CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER NOT NULL,
    queue TEXT NOT NULL,
    url TEXT NOT NULL,
    body BLOB NOT NULL,
    attempts INTEGER NOT NULL,
    failed_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqlitePendingStore {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create sync directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open sync database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory sync database: {}", e))?;

    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(SYNC_SCHEMA)
      .map_err(|e| eyre!("Failed to run sync migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

impl PendingStore for SqlitePendingStore {
  fn enqueue(&self, queue: SyncQueue, url: &str, body: serde_json::Value) -> Result<i64> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let body = serde_json::to_vec(&body).map_err(|e| eyre!("Failed to serialize body: {}", e))?;

    conn
      .execute(
        "INSERT INTO pending_requests (queue, url, body) VALUES (?, ?, ?)",
        params![queue.tag(), url, body],
      )
      .map_err(|e| eyre!("Failed to enqueue request: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn pending(&self, queue: SyncQueue) -> Result<Vec<PendingRequest>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, url, body, attempts FROM pending_requests
         WHERE queue = ? ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(i64, String, Vec<u8>, u32)> = stmt
      .query_map(params![queue.tag()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to query pending requests: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut pending = Vec::with_capacity(rows.len());
    for (id, url, body, attempts) in rows {
      let body = serde_json::from_slice(&body)
        .map_err(|e| eyre!("Corrupt pending body for request {}: {}", id, e))?;
      pending.push(PendingRequest {
        id,
        url,
        body,
        attempts,
      });
    }

    Ok(pending)
  }

  fn remove(&self, _queue: SyncQueue, id: i64) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM pending_requests WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove pending request {}: {}", id, e))?;

    Ok(())
  }

  fn record_attempt(&self, _queue: SyncQueue, id: i64) -> Result<u32> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "UPDATE pending_requests SET attempts = attempts + 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to record attempt for {}: {}", id, e))?;

    let attempts: u32 = conn
      .query_row(
        "SELECT attempts FROM pending_requests WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("No pending request {}: {}", id, e))?;

    Ok(attempts)
  }

  fn discard(&self, _queue: SyncQueue, id: i64) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT INTO dead_letters (id, queue, url, body, attempts)
         SELECT id, queue, url, body, attempts FROM pending_requests WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to dead-letter request {}: {}", id, e))?;

    conn
      .execute("DELETE FROM pending_requests WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove dead-lettered request {}: {}", id, e))?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::super::testing::{MockFetcher, RecordingSink};
  use super::*;
  use crate::cache::MemoryCacheStore;
  use crate::config::Config;
  use crate::http::Response;
  use serde_json::json;
  use std::sync::Arc;

  fn test_worker(fetcher: MockFetcher) -> Worker<MemoryCacheStore, MockFetcher> {
    Worker::new(
      Config::default(),
      Arc::new(MemoryCacheStore::new()),
      Arc::new(fetcher),
    )
    .unwrap()
  }

  #[tokio::test]
  async fn test_replay_success_removes_and_notifies() {
    let fetcher = MockFetcher::new();
    fetcher.respond("/api/analyze", Response::new(200).with_body("{}"));
    let worker = test_worker(fetcher);

    let store = MemoryPendingStore::new();
    store
      .enqueue(
        SyncQueue::ContentAnalysis,
        "/api/analyze",
        json!({"text": "draft"}),
      )
      .unwrap();

    let sink = RecordingSink::new();
    let report = worker
      .on_sync("content-analysis-sync", &store, &sink)
      .await
      .unwrap();

    assert_eq!(report.replayed, 1);
    assert!(store.pending(SyncQueue::ContentAnalysis).unwrap().is_empty());
    assert_eq!(sink.shown().len(), 1);
    assert_eq!(sink.shown()[0].title, "RankPilot");

    // Content analysis replays with POST
    assert_eq!(
      worker.fetcher().log(),
      vec![(Method::Post, "/api/analyze".to_string())]
    );
  }

  #[tokio::test]
  async fn test_preferences_replay_uses_put() {
    let fetcher = MockFetcher::new();
    fetcher.respond("/api/preferences", Response::new(204));
    let worker = test_worker(fetcher);

    let store = MemoryPendingStore::new();
    store
      .enqueue(SyncQueue::Preferences, "/api/preferences", json!({"theme": "dark"}))
      .unwrap();

    let report = worker
      .on_sync("preferences-sync", &store, &RecordingSink::new())
      .await
      .unwrap();

    assert_eq!(report.replayed, 1);
    assert_eq!(
      worker.fetcher().log(),
      vec![(Method::Put, "/api/preferences".to_string())]
    );
  }

  #[tokio::test]
  async fn test_client_error_dead_letters_immediately() {
    let fetcher = MockFetcher::new();
    fetcher.respond("/api/analyze", Response::new(422));
    let worker = test_worker(fetcher);

    let store = MemoryPendingStore::new();
    store
      .enqueue(SyncQueue::ContentAnalysis, "/api/analyze", json!({}))
      .unwrap();

    let sink = RecordingSink::new();
    let report = worker
      .on_sync("content-analysis-sync", &store, &sink)
      .await
      .unwrap();

    assert_eq!(report.dead_lettered, 1);
    assert!(store.pending(SyncQueue::ContentAnalysis).unwrap().is_empty());
    assert_eq!(store.dead_letters().len(), 1);
    assert!(sink.shown().is_empty());
  }

  #[tokio::test]
  async fn test_transient_failure_defers_then_dead_letters() {
    let fetcher = MockFetcher::new();
    fetcher.fail("/api/analyze");
    let worker = test_worker(fetcher);

    let store = MemoryPendingStore::new();
    store
      .enqueue(SyncQueue::ContentAnalysis, "/api/analyze", json!({}))
      .unwrap();

    // Four transient failures leave the record queued
    for _ in 0..(MAX_REPLAY_ATTEMPTS - 1) {
      let report = worker
        .on_sync("content-analysis-sync", &store, &RecordingSink::new())
        .await
        .unwrap();
      assert_eq!(report.deferred, 1);
      assert_eq!(store.pending(SyncQueue::ContentAnalysis).unwrap().len(), 1);
    }

    // The fifth attempt gives up on it
    let report = worker
      .on_sync("content-analysis-sync", &store, &RecordingSink::new())
      .await
      .unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert!(store.pending(SyncQueue::ContentAnalysis).unwrap().is_empty());
    assert_eq!(store.dead_letters().len(), 1);
  }

  #[tokio::test]
  async fn test_server_error_is_transient() {
    let fetcher = MockFetcher::new();
    fetcher.respond("/api/analyze", Response::new(503));
    let worker = test_worker(fetcher);

    let store = MemoryPendingStore::new();
    store
      .enqueue(SyncQueue::ContentAnalysis, "/api/analyze", json!({}))
      .unwrap();

    let report = worker
      .on_sync("content-analysis-sync", &store, &RecordingSink::new())
      .await
      .unwrap();

    assert_eq!(report.deferred, 1);
    let pending = store.pending(SyncQueue::ContentAnalysis).unwrap();
    assert_eq!(pending[0].attempts, 1);
  }

  #[tokio::test]
  async fn test_unknown_tag_is_ignored() {
    let worker = test_worker(MockFetcher::new());
    let report = worker
      .on_sync("bogus-sync", &MemoryPendingStore::new(), &RecordingSink::new())
      .await
      .unwrap();

    assert_eq!(report, SyncReport::default());
    assert_eq!(worker.fetcher().total_calls(), 0);
  }

  #[test]
  fn test_sqlite_pending_store_roundtrip() {
    let store = SqlitePendingStore::open_in_memory().unwrap();

    let id = store
      .enqueue(SyncQueue::ContentAnalysis, "/api/analyze", json!({"a": 1}))
      .unwrap();
    store
      .enqueue(SyncQueue::Preferences, "/api/preferences", json!({"b": 2}))
      .unwrap();

    // Queues are isolated
    let pending = store.pending(SyncQueue::ContentAnalysis).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].body, json!({"a": 1}));

    assert_eq!(store.record_attempt(SyncQueue::ContentAnalysis, id).unwrap(), 1);
    assert_eq!(store.record_attempt(SyncQueue::ContentAnalysis, id).unwrap(), 2);

    store.remove(SyncQueue::ContentAnalysis, id).unwrap();
    assert!(store.pending(SyncQueue::ContentAnalysis).unwrap().is_empty());
  }

  #[test]
  fn test_sqlite_discard_moves_to_dead_letters() {
    let store = SqlitePendingStore::open_in_memory().unwrap();
    let id = store
      .enqueue(SyncQueue::ContentAnalysis, "/api/analyze", json!({}))
      .unwrap();

    store.discard(SyncQueue::ContentAnalysis, id).unwrap();
    assert!(store.pending(SyncQueue::ContentAnalysis).unwrap().is_empty());

    let conn = store.conn.lock().unwrap();
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))
      .unwrap();
    assert_eq!(count, 1);
  }
}
