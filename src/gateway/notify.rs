//! Push notifications and background sync.
//!
//! Neither touches the cache. They are here because the same host delivers
//! them to the gateway.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Values used when a push payload leaves a field out.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationDefaults {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub url: String,
}

impl Default for NotificationDefaults {
  fn default() -> Self {
    Self {
      title: "Static Nav".to_string(),
      body: "There are new updates".to_string(),
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/icon-72x72.png".to_string(),
      url: "/".to_string(),
    }
  }
}

#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  url: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// A user-visible notification built from a push message.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  /// URL opened when the user picks the `open` action
  pub data: String,
  pub actions: Vec<NotificationAction>,
}

/// Build the notification for a push event.
///
/// A missing or unparseable payload produces the default notification.
pub fn notification_for_push(
  payload: Option<&str>,
  defaults: &NotificationDefaults,
) -> Notification {
  let payload: PushPayload = payload
    .and_then(|raw| serde_json::from_str(raw).ok())
    .unwrap_or_default();

  Notification {
    title: payload.title.unwrap_or_else(|| defaults.title.clone()),
    body: payload.body.unwrap_or_else(|| defaults.body.clone()),
    icon: defaults.icon.clone(),
    badge: defaults.badge.clone(),
    data: payload.url.unwrap_or_else(|| defaults.url.clone()),
    actions: vec![
      NotificationAction {
        action: "open".to_string(),
        title: "Open".to_string(),
      },
      NotificationAction {
        action: "close".to_string(),
        title: "Close".to_string(),
      },
    ],
  }
}

/// URL to open after the user interacts with a notification, if any.
pub fn click_target(action: Option<&str>, notification: &Notification) -> Option<String> {
  match action {
    Some("open") => Some(notification.data.clone()),
    _ => None,
  }
}

/// Handle a background sync tag. Returns whether the tag was recognised.
pub fn handle_sync(tag: &str) -> bool {
  match tag {
    "sync-bookmarks" | "update-bookmarks" => {
      // Bookmarks live in a static data file; there is no server to sync with.
      info!("background sync {}", tag);
      true
    }
    _ => {
      debug!("ignoring background sync tag {}", tag);
      false
    }
  }
}
