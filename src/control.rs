//! Control channel: commands sent by the hosting application.

use serde::Deserialize;
use tracing::debug;

/// A control message, tagged by its `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
  /// Activate the waiting controller without waiting for clients to close
  #[serde(rename = "SKIP_WAITING")]
  SkipWaiting,
  /// Add URLs to the static cache on demand
  #[serde(rename = "CACHE_URLS")]
  CacheUrls {
    #[serde(default)]
    urls: Vec<String>,
  },
}

impl ControlMessage {
  /// Parse a raw message. Unknown types and malformed input yield `None`.
  pub fn parse(raw: &[u8]) -> Option<Self> {
    match serde_json::from_slice(raw) {
      Ok(message) => Some(message),
      Err(e) => {
        debug!(error = %e, "ignoring control message");
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_skip_waiting() {
    assert_eq!(
      ControlMessage::parse(br#"{"type":"SKIP_WAITING"}"#),
      Some(ControlMessage::SkipWaiting)
    );
  }

  #[test]
  fn test_cache_urls() {
    let msg = ControlMessage::parse(br#"{"type":"CACHE_URLS","urls":["/a.css","/b.js"]}"#);
    assert_eq!(
      msg,
      Some(ControlMessage::CacheUrls {
        urls: vec!["/a.css".to_string(), "/b.js".to_string()]
      })
    );
  }

  #[test]
  fn test_unknown_or_malformed_is_ignored() {
    assert_eq!(ControlMessage::parse(br#"{"type":"RELOAD"}"#), None);
    assert_eq!(ControlMessage::parse(br#"{"urls":[]}"#), None);
    assert_eq!(ControlMessage::parse(b"SKIP_WAITING"), None);
    assert_eq!(ControlMessage::parse(br#"{"type":"CACHE_URLS","urls":"nope"}"#), None);
  }
}
