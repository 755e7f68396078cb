//! Push notifications and notification-click routing.

use async_trait::async_trait;
use color_eyre::Result;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::config::{ControllerConfig, NotificationDefaults};
use crate::http::normalize_url;

/// A notification to display. Built and consumed within one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationIntent {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub tag: String,
  pub target_url: String,
}

impl NotificationIntent {
  pub fn from_defaults(defaults: &NotificationDefaults) -> Self {
    Self {
      title: defaults.title.clone(),
      body: defaults.body.clone(),
      icon: defaults.icon.clone(),
      tag: defaults.tag.clone(),
      target_url: defaults.url.clone(),
    }
  }
}

/// Wire shape of a push payload; every field is optional.
#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  tag: Option<String>,
  url: Option<String>,
}

/// Parse a push payload into an intent.
///
/// A missing payload, a non-JSON body, or JSON that is not an object all
/// produce the default notification.
pub fn parse_push(payload: Option<&[u8]>, defaults: &NotificationDefaults) -> NotificationIntent {
  let parsed = match payload {
    Some(bytes) if !bytes.is_empty() => match serde_json::from_slice::<PushPayload>(bytes) {
      Ok(p) => p,
      Err(e) => {
        debug!(error = %e, "malformed push payload, using defaults");
        PushPayload::default()
      }
    },
    _ => PushPayload::default(),
  };

  let fallback = NotificationIntent::from_defaults(defaults);
  NotificationIntent {
    title: parsed.title.unwrap_or(fallback.title),
    body: parsed.body.unwrap_or(fallback.body),
    icon: parsed.icon.unwrap_or(fallback.icon),
    tag: parsed.tag.unwrap_or(fallback.tag),
    target_url: parsed.url.unwrap_or(fallback.target_url),
  }
}

/// Displays notifications to the user.
#[async_trait]
pub trait Notifier: Send + Sync {
  async fn show(&self, intent: &NotificationIntent) -> Result<()>;
}

/// An open client window controlled (or controllable) by this controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientWindow {
  pub id: String,
  pub url: Url,
}

/// Access to the host's client windows.
#[async_trait]
pub trait Clients: Send + Sync {
  async fn windows(&self) -> Result<Vec<ClientWindow>>;

  async fn focus(&self, id: &str) -> Result<()>;

  async fn open_window(&self, url: &Url) -> Result<()>;

  /// Take control of every open client; returns how many were claimed.
  async fn claim(&self) -> Result<usize>;
}

/// What a notification click did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  Focused { client_id: String },
  Opened { url: Url },
}

/// Turns push payloads and sync outcomes into notifications, and routes clicks.
pub struct NotificationDispatcher {
  config: Arc<ControllerConfig>,
  notifier: Arc<dyn Notifier>,
  clients: Arc<dyn Clients>,
}

impl NotificationDispatcher {
  pub fn new(
    config: Arc<ControllerConfig>,
    notifier: Arc<dyn Notifier>,
    clients: Arc<dyn Clients>,
  ) -> Self {
    Self {
      config,
      notifier,
      clients,
    }
  }

  /// Handle an inbound push message.
  pub async fn on_push(&self, payload: Option<&[u8]>) -> Result<NotificationIntent> {
    let intent = parse_push(payload, &self.config.notifications);
    self.notifier.show(&intent).await?;
    Ok(intent)
  }

  /// Show an intent built elsewhere (e.g. a replay success).
  pub async fn show(&self, intent: &NotificationIntent) -> Result<()> {
    self.notifier.show(intent).await
  }

  /// Focus a window already showing the target, or open a new one.
  pub async fn on_click(&self, target_url: &str) -> Result<ClickOutcome> {
    let target = self.config.resolve(target_url)?;
    let wanted = normalize_url(&target);

    let windows = self.clients.windows().await?;
    if let Some(window) = windows.iter().find(|w| normalize_url(&w.url) == wanted) {
      self.clients.focus(&window.id).await?;
      info!(client = %window.id, url = %target, "focused existing window");
      return Ok(ClickOutcome::Focused {
        client_id: window.id.clone(),
      });
    }

    self.clients.open_window(&target).await?;
    info!(url = %target, "opened new window");
    Ok(ClickOutcome::Opened { url: target })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{FakeClients, RecordingNotifier};

  fn defaults() -> NotificationDefaults {
    NotificationDefaults::default()
  }

  #[test]
  fn test_full_payload() {
    let payload = br#"{"title":"Low stock","body":"Only 2 left","icon":"/i.png","tag":"stock","url":"/products/9"}"#;
    let intent = parse_push(Some(payload), &defaults());
    assert_eq!(intent.title, "Low stock");
    assert_eq!(intent.body, "Only 2 left");
    assert_eq!(intent.icon, "/i.png");
    assert_eq!(intent.tag, "stock");
    assert_eq!(intent.target_url, "/products/9");
  }

  #[test]
  fn test_partial_payload_fills_defaults() {
    let intent = parse_push(Some(br#"{"title":"Hi"}"#), &defaults());
    assert_eq!(intent.title, "Hi");
    assert_eq!(intent.body, defaults().body);
    assert_eq!(intent.target_url, "/");
  }

  #[test]
  fn test_missing_and_malformed_payloads_degrade_to_defaults() {
    let expected = NotificationIntent::from_defaults(&defaults());
    assert_eq!(parse_push(None, &defaults()), expected);
    assert_eq!(parse_push(Some(b""), &defaults()), expected);
    assert_eq!(parse_push(Some(b"not json at all"), &defaults()), expected);
    assert_eq!(parse_push(Some(b"[1,2,3]"), &defaults()), expected);
  }

  fn dispatcher(
    windows: &[(&str, &str)],
  ) -> (NotificationDispatcher, Arc<RecordingNotifier>, Arc<FakeClients>) {
    let config = ControllerConfig::for_origin("https://shop.example.com", 1).unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let clients = Arc::new(FakeClients::with_windows(windows));
    let d = NotificationDispatcher::new(config, notifier.clone(), clients.clone());
    (d, notifier, clients)
  }

  #[tokio::test]
  async fn test_push_is_displayed() {
    let (d, notifier, _) = dispatcher(&[]);
    d.on_push(Some(b"{\"title\":\"Order shipped\"}")).await.unwrap();
    let shown = notifier.shown();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].title, "Order shipped");
  }

  #[tokio::test]
  async fn test_click_focuses_matching_window() {
    let (d, _, clients) = dispatcher(&[
      ("a", "https://shop.example.com/"),
      ("b", "https://shop.example.com/orders#latest"),
    ]);

    let outcome = d.on_click("/orders").await.unwrap();
    assert_eq!(
      outcome,
      ClickOutcome::Focused {
        client_id: "b".to_string()
      }
    );
    assert_eq!(clients.focused(), vec!["b".to_string()]);
    assert!(clients.opened().is_empty());
  }

  #[tokio::test]
  async fn test_click_opens_window_when_none_match() {
    let (d, _, clients) = dispatcher(&[("a", "https://shop.example.com/")]);

    let outcome = d.on_click("/products/9").await.unwrap();
    let expected = Url::parse("https://shop.example.com/products/9").unwrap();
    assert_eq!(outcome, ClickOutcome::Opened { url: expected.clone() });
    assert_eq!(clients.opened(), vec![expected]);
  }
}
