//! Request routing and the three fetch strategies.
//!
//! Strategy selection is pure and runs per intercepted request; the
//! strategies themselves never fail: cache-store errors degrade to a cache
//! miss (or a dropped write) with a warning, and network errors end in a
//! synthesized offline response. The caller always gets a `Response` or an
//! explicit pass-through, never a raw error.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{request_key, CacheStore, CachedResponse};
use crate::config::Config;
use crate::http::{Fetcher, Request, Response};

use super::Worker;

/// File extensions served cache-first from the static cache.
const STATIC_EXTENSIONS: &[&str] = &[
  "css", "js", "mjs", "png", "jpg", "jpeg", "svg", "gif", "webp", "ico", "woff", "woff2", "ttf",
];

/// How an intercepted request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Network first, dynamic-cache fallback (API data)
  NetworkFirst,
  /// Static cache first, network fallback (shell assets)
  CacheFirst,
  /// Cached copy immediately, refresh in the background (app routes)
  StaleWhileRevalidate,
  /// Not intercepted; the native fetch proceeds
  Bypass,
}

/// The routing configuration a selector decision needs, precomputed once.
pub struct RoutePolicy {
  origin: String,
  api_prefix: String,
  app_routes: Vec<String>,
}

impl RoutePolicy {
  pub fn from_config(config: &Config) -> Result<Self> {
    let origin = config.origin_url()?.origin().ascii_serialization();
    if config.api_prefix.is_empty() {
      return Err(eyre!("api_prefix must not be empty"));
    }

    Ok(Self {
      origin,
      api_prefix: config.api_prefix.clone(),
      app_routes: config.app_routes.clone(),
    })
  }
}

/// Decide the strategy for a request. First match wins:
/// non-GET and cross-origin are bypassed, then API prefix, then static
/// asset extensions, then the app-route allowlist; everything else is
/// bypassed.
pub fn select_strategy(request: &Request, routes: &RoutePolicy) -> Strategy {
  if !request.is_get() || request.origin() != routes.origin {
    return Strategy::Bypass;
  }

  let path = request.path();

  if path.starts_with(&routes.api_prefix) {
    return Strategy::NetworkFirst;
  }

  if let Some(ext) = request.extension() {
    if STATIC_EXTENSIONS.contains(&ext) {
      return Strategy::CacheFirst;
    }
  }

  let is_app_route = routes
    .app_routes
    .iter()
    .any(|route| path == route || path.starts_with(&format!("{}/", route)));
  if is_app_route {
    return Strategy::StaleWhileRevalidate;
  }

  Strategy::Bypass
}

impl<C: CacheStore + 'static, F: Fetcher + 'static> Worker<C, F> {
  /// Fetch handler. `None` leaves the request unintercepted.
  pub async fn on_fetch(&self, request: &Request) -> Option<Response> {
    match select_strategy(request, self.routes()) {
      Strategy::Bypass => None,
      Strategy::NetworkFirst => Some(self.network_first(request).await),
      Strategy::CacheFirst => Some(self.cache_first(request).await),
      Strategy::StaleWhileRevalidate => Some(self.stale_while_revalidate(request).await),
    }
  }

  /// Cache lookup that degrades storage failures to a miss.
  fn cache_lookup(&self, cache: &str, key: &str) -> Option<CachedResponse> {
    match self.caches().get(cache, key) {
      Ok(hit) => hit,
      Err(e) => {
        warn!("Cache read failed in {}, treating as miss: {}", cache, e);
        None
      }
    }
  }

  /// Cache write that degrades storage failures to a dropped update.
  fn cache_write(&self, cache: &str, key: &str, url: &str, response: &Response) {
    if let Err(e) = self.caches().put(cache, key, url, response) {
      warn!("Cache write failed in {}: {}", cache, e);
    }
  }

  /// Static assets: cache hit wins outright, no network call. On a miss the
  /// network response is cached (2xx only) before being returned.
  async fn cache_first(&self, request: &Request) -> Response {
    let cache = self.config().static_cache_name();
    let key = request_key(request);

    if let Some(hit) = self.cache_lookup(&cache, &key) {
      return hit.response;
    }

    match self.fetcher().fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          self.cache_write(&cache, &key, request.url.as_str(), &response);
        }
        response
      }
      Err(e) => {
        debug!("Cache-first fetch failed for {}: {}", request.url, e);
        Response::offline_asset()
      }
    }
  }

  /// API data: the network is authoritative when reachable; the dynamic
  /// cache is an opportunistic copy used only when the fetch itself fails.
  async fn network_first(&self, request: &Request) -> Response {
    let cache = self.config().dynamic_cache_name();
    let key = request_key(request);

    match self.fetcher().fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          self.cache_write(&cache, &key, request.url.as_str(), &response);
        }
        response
      }
      Err(e) => {
        debug!("Network-first fetch failed for {}: {}", request.url, e);
        match self.cache_lookup(&cache, &key) {
          Some(hit) => hit.response,
          None => Response::offline_json(),
        }
      }
    }
  }

  /// App routes: return whatever is cached immediately and refresh the
  /// cache in the background. The refresh is never awaited by this caller;
  /// its result is visible only to the next request for the same key.
  async fn stale_while_revalidate(&self, request: &Request) -> Response {
    let cache = self.config().dynamic_cache_name();
    let key = request_key(request);
    let cached = self.cache_lookup(&cache, &key);

    let caches = Arc::clone(self.caches());
    let fetcher = Arc::clone(self.fetcher());
    let req = request.clone();
    let refresh_cache = cache.clone();
    let refresh_key = key.clone();
    let refresh = async move {
      match fetcher.fetch(&req).await {
        Ok(response) => {
          if response.is_ok() {
            if let Err(e) = caches.put(&refresh_cache, &refresh_key, req.url.as_str(), &response)
            {
              warn!("Cache write failed in {}: {}", refresh_cache, e);
            }
          }
          Some(response)
        }
        Err(e) => {
          debug!("Revalidation fetch failed for {}: {}", req.url, e);
          None
        }
      }
    };

    match cached {
      Some(hit) => {
        self.spawn_background(async move {
          refresh.await;
        });
        hit.response
      }
      None => refresh.await.unwrap_or_else(Response::offline_json),
    }
  }
}
