//! Cache store implementations: SQLite for the host adapter, in-memory
//! for tests and ephemeral runs.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::http::Response;

use super::traits::{CacheStore, CachedResponse};

/// In-memory cache store: a map of cache name to keyed entries.
///
/// Used by unit tests and by hosts that do not want persistence across
/// restarts.
#[derive(Default)]
pub struct MemoryCacheStore {
  caches: Mutex<HashMap<String, HashMap<String, CachedResponse>>>,
}

impl MemoryCacheStore {
  #[allow(dead_code)]
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStore for MemoryCacheStore {
  fn get(&self, cache: &str, key: &str) -> Result<Option<CachedResponse>> {
    let caches = self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(caches.get(cache).and_then(|c| c.get(key)).cloned())
  }

  fn put(&self, cache: &str, key: &str, url: &str, response: &Response) -> Result<()> {
    let mut caches = self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    caches.entry(cache.to_string()).or_default().insert(
      key.to_string(),
      CachedResponse {
        response: response.clone(),
        url: url.to_string(),
        cached_at: Utc::now(),
      },
    );

    Ok(())
  }

  fn keys(&self, cache: &str) -> Result<Vec<String>> {
    let caches = self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      caches
        .get(cache)
        .map(|c| c.values().map(|e| e.url.clone()).collect())
        .unwrap_or_default(),
    )
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let caches = self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut names: Vec<String> = caches.keys().cloned().collect();
    names.sort();
    Ok(names)
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    let mut caches = self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(caches.remove(name).is_some())
  }
}

/// SQLite-based cache store.
pub struct SqliteCacheStore {
  conn: Mutex<Connection>,
}

/// Schema for the response cache. One row per (cache, key); a cache
/// "exists" iff it has at least one row, which gives the lazy-creation
/// semantics for free.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS response_cache (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers BLOB NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key)
);

CREATE INDEX IF NOT EXISTS idx_response_cache_name
    ON response_cache(cache_name);
"#;

impl SqliteCacheStore {
  /// Open or create the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// In-memory database, handy for tests and one-shot runs.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

impl CacheStore for SqliteCacheStore {
  fn get(&self, cache: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT url, status, headers, body, cached_at FROM response_cache
         WHERE cache_name = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(String, u16, Vec<u8>, Vec<u8>, String)> = stmt
      .query_row(params![cache, key], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      })
      .ok();

    match row {
      Some((url, status, headers, body, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_slice(&headers)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;

        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          url,
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, cache: &str, key: &str, url: &str, response: &Response) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_vec(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO response_cache
           (cache_name, request_key, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
        params![cache, key, url, response.status, headers, response.body],
      )
      .map_err(|e| eyre!("Failed to store response: {}", e))?;

    Ok(())
  }

  fn keys(&self, cache: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT url FROM response_cache WHERE cache_name = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls: Vec<String> = stmt
      .query_map(params![cache], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query cache keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(urls)
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM response_cache ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query cache names: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let deleted = conn
      .execute("DELETE FROM response_cache WHERE cache_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    Ok(deleted > 0)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheStore;

  fn resp(body: &str) -> Response {
    Response::new(200)
      .with_header("content-type", "text/html")
      .with_body(body)
  }

  fn roundtrip(store: &dyn CacheStore) {
    assert!(store.get("static-v1", "k1").unwrap().is_none());

    store.put("static-v1", "k1", "/", &resp("home")).unwrap();
    let hit = store.get("static-v1", "k1").unwrap().unwrap();
    assert_eq!(hit.response.status, 200);
    assert_eq!(hit.response.text(), "home");
    assert_eq!(hit.url, "/");

    // Overwrite replaces the whole entry
    store.put("static-v1", "k1", "/", &resp("home-v2")).unwrap();
    let hit = store.get("static-v1", "k1").unwrap().unwrap();
    assert_eq!(hit.response.text(), "home-v2");
    assert_eq!(store.keys("static-v1").unwrap().len(), 1);
  }

  fn lazy_creation_and_delete(store: &dyn CacheStore) {
    assert!(store.cache_names().unwrap().is_empty());

    store.put("static-v1", "a", "/a", &resp("a")).unwrap();
    store.put("dynamic-v1", "b", "/b", &resp("b")).unwrap();
    assert_eq!(
      store.cache_names().unwrap(),
      vec!["dynamic-v1".to_string(), "static-v1".to_string()]
    );

    assert!(store.delete_cache("static-v1").unwrap());
    assert!(!store.delete_cache("static-v1").unwrap());
    assert_eq!(store.cache_names().unwrap(), vec!["dynamic-v1".to_string()]);
    assert!(store.get("static-v1", "a").unwrap().is_none());
  }

  #[test]
  fn test_memory_roundtrip() {
    roundtrip(&MemoryCacheStore::new());
  }

  #[test]
  fn test_memory_lazy_creation_and_delete() {
    lazy_creation_and_delete(&MemoryCacheStore::new());
  }

  #[test]
  fn test_sqlite_roundtrip() {
    roundtrip(&SqliteCacheStore::open_in_memory().unwrap());
  }

  #[test]
  fn test_sqlite_lazy_creation_and_delete() {
    lazy_creation_and_delete(&SqliteCacheStore::open_in_memory().unwrap());
  }

  #[test]
  fn test_sqlite_preserves_headers() {
    let store = SqliteCacheStore::open_in_memory().unwrap();
    store.put("dynamic-v1", "k", "/api/x", &resp("{}")).unwrap();

    let hit = store.get("dynamic-v1", "k").unwrap().unwrap();
    assert_eq!(hit.response.header("content-type"), Some("text/html"));
  }
}
