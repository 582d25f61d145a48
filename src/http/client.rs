//! Network side of the worker: the `Fetcher` seam and its reqwest impl.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use super::{Method, Request, Response};

/// Performs the actual network fetch for a request.
///
/// The worker only ever talks to the network through this trait, so tests
/// substitute scripted fetchers and count calls.
#[async_trait]
pub trait Fetcher: Send + Sync {
  /// Resolve a request against the network.
  ///
  /// A non-2xx status is still an `Ok` response; `Err` means the fetch
  /// itself failed (offline, DNS, timeout).
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// reqwest-backed fetcher used by the host adapter.
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
      Method::Head => reqwest::Method::HEAD,
      Method::Options => reqwest::Method::OPTIONS,
      Method::Patch => reqwest::Method::PATCH,
    };

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let resp = builder
      .send()
      .await
      .map_err(|e| eyre!("Fetch failed for {}: {}", request.url, e))?;

    let status = resp.status().as_u16();
    let headers = resp
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = resp
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
