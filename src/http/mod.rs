//! Request/response types shared by the worker and its host adapter.
//!
//! These mirror the subset of HTTP the worker actually routes on: method,
//! URL, headers and an opaque body. Responses are cheap to clone because a
//! cached copy and the live copy returned to the caller must coexist.

mod client;

pub use client::{Fetcher, HttpFetcher};

use url::Url;

/// HTTP methods the worker can intercept or replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
  Head,
  Options,
  Patch,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
      Method::Head => "HEAD",
      Method::Options => "OPTIONS",
      Method::Patch => "PATCH",
    }
  }
}

/// An intercepted (or replayed) outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn post(url: Url, body: Vec<u8>) -> Self {
    Self {
      method: Method::Post,
      url,
      headers: vec![("content-type".into(), "application/json".into())],
      body: Some(body),
    }
  }

  pub fn put(url: Url, body: Vec<u8>) -> Self {
    Self {
      method: Method::Put,
      url,
      headers: vec![("content-type".into(), "application/json".into())],
      body: Some(body),
    }
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::Get
  }

  /// URL path component (always starts with `/`).
  pub fn path(&self) -> &str {
    self.url.path()
  }

  /// File extension of the last path segment, if any.
  pub fn extension(&self) -> Option<&str> {
    let segment = self.path().rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() {
      None
    } else {
      Some(ext)
    }
  }

  /// Scheme + host + port, for same-origin checks.
  pub fn origin(&self) -> String {
    self.url.origin().ascii_serialization()
  }
}

/// A response as seen by the worker: either live from the network, read
/// back from a cache, or synthesized when neither is available.
#[derive(Debug, Clone)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_lowercase(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  /// 2xx check; only ok responses are ever written into a cache.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup, first match wins.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// Synthesized reply for API/page requests with no network and no cache.
  pub fn offline_json() -> Self {
    let body = serde_json::json!({
      "error": "Offline",
      "message": "This feature requires an internet connection",
    });
    Response::new(503)
      .with_header("content-type", "application/json")
      .with_body(body.to_string())
  }

  /// Synthesized reply for a static asset that was never cached.
  pub fn offline_asset() -> Self {
    Response::new(503)
      .with_header("content-type", "text/plain")
      .with_body("Asset unavailable offline")
  }
}
