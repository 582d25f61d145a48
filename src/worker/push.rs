//! Push notifications and notification-click routing.
//!
//! Push payloads arrive as untrusted JSON; parsing is a single validated
//! step that fills defaults for missing fields and rejects anything
//! malformed. A rejected payload shows nothing and never propagates an
//! error to the host.

use color_eyre::Result;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::http::Fetcher;

use super::sync::SyncQueue;
use super::Worker;

/// Route opened when a notification is clicked without a deep link.
const DEFAULT_CLICK_URL: &str = "/dashboard";

const DEFAULT_TITLE: &str = "RankPilot";
const DEFAULT_ICON: &str = "/icons/icon-192.png";
const DEFAULT_BADGE: &str = "/icons/badge-72.png";
const DEFAULT_TAG: &str = "rankpilot";

/// A button on a displayed notification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// Recognized fields of a push payload; everything is optional on the wire.
#[derive(Debug, Deserialize)]
struct RawPayload {
  title: Option<String>,
  body: Option<String>,
  tag: Option<String>,
  url: Option<String>,
  actions: Option<Vec<NotificationAction>>,
}

/// A fully-defaulted notification ready to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: String,
  /// Deep link attached to the notification, consulted on click
  pub url: Option<String>,
  pub actions: Vec<NotificationAction>,
}

impl Notification {
  /// Parse a push payload, defaulting missing fields. `None` for anything
  /// that is not a JSON object with the recognized shape.
  pub fn parse(payload: &[u8]) -> Option<Self> {
    let raw: RawPayload = serde_json::from_slice(payload).ok()?;

    Some(Self {
      title: raw.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
      body: raw.body.unwrap_or_default(),
      icon: DEFAULT_ICON.to_string(),
      badge: DEFAULT_BADGE.to_string(),
      tag: raw.tag.unwrap_or_else(|| DEFAULT_TAG.to_string()),
      url: raw.url,
      actions: raw.actions.unwrap_or_else(default_actions),
    })
  }

  /// Notification shown after a queued offline request replays.
  pub fn sync_complete(queue: SyncQueue) -> Self {
    let body = match queue {
      SyncQueue::ContentAnalysis => "Your content analysis has been submitted",
      SyncQueue::Preferences => "Your preferences have been saved",
    };

    Self {
      title: DEFAULT_TITLE.to_string(),
      body: body.to_string(),
      icon: DEFAULT_ICON.to_string(),
      badge: DEFAULT_BADGE.to_string(),
      tag: queue.tag().to_string(),
      url: None,
      actions: default_actions(),
    }
  }
}

fn default_actions() -> Vec<NotificationAction> {
  vec![
    NotificationAction {
      action: "view".to_string(),
      title: "View".to_string(),
    },
    NotificationAction {
      action: "dismiss".to_string(),
      title: "Dismiss".to_string(),
    },
  ]
}

/// Displays notifications to the user; provided by the host.
pub trait NotificationSink: Send + Sync {
  fn show(&self, notification: &Notification) -> Result<()>;
}

/// An open application window known to the host.
#[derive(Debug, Clone)]
pub struct WindowClient {
  pub id: u64,
  pub url: String,
}

/// The host's view of open windows, for click routing.
pub trait WindowRegistry: Send + Sync {
  fn windows(&self) -> Vec<WindowClient>;
  fn focus(&self, id: u64) -> Result<()>;
  fn open(&self, url: &str) -> Result<()>;
}

/// A click on a displayed notification.
#[derive(Debug, Clone, Default)]
pub struct NotificationClick {
  /// Action button chosen, if any
  pub action: Option<String>,
  /// Deep link carried by the notification
  pub url: Option<String>,
}

impl<C: CacheStore + 'static, F: Fetcher + 'static> Worker<C, F> {
  /// Push handler. Absent or malformed payloads show nothing.
  pub fn on_push(&self, payload: Option<&[u8]>, notifications: &dyn NotificationSink) {
    let Some(bytes) = payload else {
      debug!("Push event without payload");
      return;
    };

    match Notification::parse(bytes) {
      Some(notification) => {
        if let Err(e) = notifications.show(&notification) {
          warn!("Failed to show notification: {}", e);
        }
      }
      None => warn!("Ignoring malformed push payload"),
    }
  }

  /// Notification-click handler: dismiss is a no-op, anything else focuses
  /// an existing window already showing the target URL or opens a new one.
  pub fn on_notification_click(
    &self,
    click: &NotificationClick,
    windows: &dyn WindowRegistry,
  ) -> Result<()> {
    if click.action.as_deref() == Some("dismiss") {
      return Ok(());
    }

    let target = click
      .url
      .clone()
      .unwrap_or_else(|| DEFAULT_CLICK_URL.to_string());

    if let Some(window) = windows.windows().iter().find(|w| w.url.contains(&target)) {
      return windows.focus(window.id);
    }

    windows.open(&target)
  }
}
