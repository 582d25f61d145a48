//! Scripted fetcher and recording sinks for worker tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::http::{Fetcher, Method, Request, Response};

use super::push::{Notification, NotificationSink};

enum Script {
  Respond(Response),
  Fail,
}

/// A fetcher scripted per path, counting every call.
///
/// Responses can be re-scripted mid-test through `&self`, so a shared
/// `Arc<MockFetcher>` lets a test change what the "network" serves between
/// requests.
#[derive(Default)]
pub struct MockFetcher {
  scripts: Mutex<HashMap<String, Script>>,
  calls: Mutex<HashMap<String, usize>>,
  log: Mutex<Vec<(Method, String)>>,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Script a successful fetch for a path (replacing any prior script).
  pub fn respond(&self, path: &str, response: Response) {
    self
      .scripts
      .lock()
      .unwrap()
      .insert(path.to_string(), Script::Respond(response));
  }

  /// Script a network failure for a path.
  pub fn fail(&self, path: &str) {
    self
      .scripts
      .lock()
      .unwrap()
      .insert(path.to_string(), Script::Fail);
  }

  /// How many times a path was fetched.
  pub fn calls(&self, path: &str) -> usize {
    self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().values().sum()
  }

  /// Every fetch in order, as (method, path).
  pub fn log(&self) -> Vec<(Method, String)> {
    self.log.lock().unwrap().clone()
  }
}

#[async_trait]
impl Fetcher for MockFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let path = request.path().to_string();
    *self.calls.lock().unwrap().entry(path.clone()).or_insert(0) += 1;
    self
      .log
      .lock()
      .unwrap()
      .push((request.method, path.clone()));

    match self.scripts.lock().unwrap().get(&path) {
      Some(Script::Respond(response)) => Ok(response.clone()),
      Some(Script::Fail) => Err(eyre!("network unreachable (scripted)")),
      None => Err(eyre!("no script for path {}", path)),
    }
  }
}

/// Notification sink that records what was shown.
#[derive(Default)]
pub struct RecordingSink {
  shown: Mutex<Vec<Notification>>,
}

impl RecordingSink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn shown(&self) -> Vec<Notification> {
    self.shown.lock().unwrap().clone()
  }
}

impl NotificationSink for RecordingSink {
  fn show(&self, notification: &Notification) -> Result<()> {
    self.shown.lock().unwrap().push(notification.clone());
    Ok(())
  }
}
