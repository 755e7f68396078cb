//! Request and response primitives the controller intercepts.
//!
//! These stand in for the browser's `Request`/`Response` objects so the
//! strategies can run outside a browser runtime.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// HTTP request method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[default]
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Head => "HEAD",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
      Self::Options => "OPTIONS",
    }
  }

  /// Idempotent reads are the only requests the controller caches.
  pub fn is_cacheable_read(&self) -> bool {
    matches!(self, Self::Get | Self::Head)
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Self::Get),
      "HEAD" => Ok(Self::Head),
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "PATCH" => Ok(Self::Patch),
      "DELETE" => Ok(Self::Delete),
      "OPTIONS" => Ok(Self::Options),
      other => Err(eyre!("Unsupported HTTP method: {}", other)),
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Declared destination of a request (what the client intends to do with it)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  #[default]
  Empty,
  Document,
  Image,
  Script,
  Style,
  Font,
  Manifest,
}

/// Request mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  SameOrigin,
  #[default]
  Cors,
  NoCors,
}

/// Response type, mirroring the fetch standard's tainting rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
  /// Same-origin response
  Basic,
  /// Cross-origin response with CORS headers exposed
  Cors,
  /// Cross-origin no-cors response; status and body are hidden
  Opaque,
  /// Produced locally by the controller
  Synthesized,
}

impl ResponseType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
      Self::Synthesized => "synthesized",
    }
  }

  pub fn parse(s: &str) -> Self {
    match s {
      "basic" => Self::Basic,
      "cors" => Self::Cors,
      "opaque" => Self::Opaque,
      _ => Self::Synthesized,
    }
  }
}

pub type Headers = BTreeMap<String, String>;

/// An outbound request seen by the controller.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub mode: RequestMode,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
}

impl Request {
  /// A plain `GET` with no declared destination.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      destination: Destination::Empty,
      mode: RequestMode::Cors,
      headers: Headers::new(),
      body: None,
    }
  }

  /// A top-level page navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      destination: Destination::Document,
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  /// An `<img>` load.
  pub fn image(url: Url) -> Self {
    Self {
      destination: Destination::Image,
      mode: RequestMode::NoCors,
      ..Self::get(url)
    }
  }

  /// A JSON write, as used when replaying deferred writes.
  pub fn json(method: Method, url: Url, payload: &serde_json::Value) -> Result<Self> {
    let body = serde_json::to_vec(payload).map_err(|e| eyre!("Failed to encode payload: {}", e))?;
    let mut headers = Headers::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    Ok(Self {
      method,
      url,
      destination: Destination::Empty,
      mode: RequestMode::Cors,
      headers,
      body: Some(body),
    })
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  pub fn cache_key(&self) -> CacheKey {
    CacheKey::derive(self.method, &self.url)
  }
}

/// A response, either from the network, from a cache, or synthesized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub url: Option<Url>,
  pub kind: ResponseType,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
      url: None,
      kind: ResponseType::Synthesized,
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_url(mut self, url: Url) -> Self {
    self.url = Some(url);
    self
  }

  pub fn with_kind(mut self, kind: ResponseType) -> Self {
    self.kind = kind;
    self
  }

  /// Status in the 2xx range.
  pub fn ok(&self) -> bool {
    (200..=299).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  /// Minimal placeholder returned when nothing better is available.
  pub fn not_found() -> Self {
    Self::new(404, "Not Found").with_header("content-type", "text/plain")
  }

  /// Structured offline response for API calls with no cached fallback.
  pub fn offline_json(message: &str) -> Self {
    let body = serde_json::json!({
      "error": "Offline",
      "message": message,
    });
    Self::new(503, body.to_string()).with_header("content-type", "application/json")
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Identity of a cached request: method plus normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
  /// Derive the key for a request.
  ///
  /// `HEAD` shares the `GET` key. The URL keeps its query verbatim; the
  /// fragment and an empty `?` are dropped. Scheme/host case and default
  /// ports are already normalized by the `url` parser.
  pub fn derive(method: Method, url: &Url) -> Self {
    let method = match method {
      Method::Head => Method::Get,
      other => other,
    };
    Self(format!("{} {}", method.as_str(), normalize_url(url)))
  }

  /// Rebuild a key from its stored string form.
  pub fn from_stored(raw: impl Into<String>) -> Self {
    Self(raw.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Normalize a URL for cache matching and client-window comparison.
pub fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  if url.query() == Some("") {
    url.set_query(None);
  }
  url.to_string()
}
