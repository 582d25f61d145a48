//! Core trait and types for the response cache.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};

use crate::http::{Request, Response};

/// A response held in a named cache, together with when it was stored.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored response
  pub response: Response,
  /// Original request URL, kept for introspection and listing
  pub url: String,
  /// When the response was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// The store is shared between concurrent fetch handlers; implementations
/// must serialize individual operations internally. A `put` for an existing
/// key overwrites the whole entry.
pub trait CacheStore: Send + Sync {
  /// Look up a response by cache name and request key.
  fn get(&self, cache: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Write a response, creating the named cache if it does not exist yet.
  fn put(&self, cache: &str, key: &str, url: &str, response: &Response) -> Result<()>;

  /// URLs of all entries in a cache, for listing. Empty if the cache
  /// does not exist.
  fn keys(&self, cache: &str) -> Result<Vec<String>>;

  /// Names of all caches currently in storage.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Drop an entire cache. Returns whether it existed.
  fn delete_cache(&self, name: &str) -> Result<bool>;
}

/// Stable, fixed-length lookup key for a request.
///
/// SHA256 over method and full URL, so query strings produce distinct
/// entries and keys are safe to use as primary keys.
pub fn request_key(request: &Request) -> String {
  let input = format!("{}:{}", request.method.as_str(), request.url);

  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Request;
  use url::Url;

  #[test]
  fn test_request_key_is_stable() {
    let a = Request::get(Url::parse("https://rankpilot.app/dashboard").unwrap());
    let b = Request::get(Url::parse("https://rankpilot.app/dashboard").unwrap());
    assert_eq!(request_key(&a), request_key(&b));
  }

  #[test]
  fn test_request_key_distinguishes_query_strings() {
    let a = Request::get(Url::parse("https://rankpilot.app/api/keywords?page=1").unwrap());
    let b = Request::get(Url::parse("https://rankpilot.app/api/keywords?page=2").unwrap());
    assert_ne!(request_key(&a), request_key(&b));
  }
}
