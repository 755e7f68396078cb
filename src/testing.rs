//! Test doubles for the network, notifier and client windows.

use async_trait::async_trait;
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use url::Url;

use crate::http::{normalize_url, Request, Response, ResponseType};
use crate::network::{FetchError, Network};
use crate::notify::{ClientWindow, Clients, NotificationIntent, Notifier};

/// Scriptable network that records every request it sees.
pub struct FakeNetwork {
  origin: Url,
  routes: Mutex<HashMap<String, Response>>,
  failure: Mutex<Option<FetchError>>,
  seen: Mutex<Vec<Request>>,
}

impl FakeNetwork {
  pub fn new(origin: &str) -> Self {
    Self {
      origin: Url::parse(origin).expect("valid origin"),
      routes: Mutex::new(HashMap::new()),
      failure: Mutex::new(None),
      seen: Mutex::new(Vec::new()),
    }
  }

  /// Serve `status`/`body` for a URL, tainted the way a browser would.
  pub fn respond(&self, url: &Url, status: u16, body: &str) {
    let kind = if url.origin() == self.origin.origin() {
      ResponseType::Basic
    } else {
      ResponseType::Cors
    };
    let response = Response::new(status, body)
      .with_url(url.clone())
      .with_kind(kind);
    self.respond_with(url, response);
  }

  pub fn respond_with(&self, url: &Url, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(normalize_url(url), response);
  }

  /// Fail every request with a connection error.
  pub fn set_offline(&self, offline: bool) {
    let failure = offline.then(|| FetchError::ConnectionRefused("network disabled".into()));
    *self.failure.lock().unwrap() = failure;
  }

  pub fn fail_with(&self, error: FetchError) {
    *self.failure.lock().unwrap() = Some(error);
  }

  pub fn calls_to(&self, url: &Url) -> usize {
    let wanted = normalize_url(url);
    self
      .seen
      .lock()
      .unwrap()
      .iter()
      .filter(|r| normalize_url(&r.url) == wanted)
      .count()
  }

  pub fn total_calls(&self) -> usize {
    self.seen.lock().unwrap().len()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.seen.lock().unwrap().clone()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.seen.lock().unwrap().push(request.clone());

    if let Some(err) = self.failure.lock().unwrap().clone() {
      return Err(err);
    }

    let routes = self.routes.lock().unwrap();
    Ok(
      routes
        .get(&normalize_url(&request.url))
        .cloned()
        .unwrap_or_else(|| Response::not_found().with_url(request.url.clone())),
    )
  }
}

/// Notifier that remembers what it was asked to show.
#[derive(Default)]
pub struct RecordingNotifier {
  shown: Mutex<Vec<NotificationIntent>>,
}

impl RecordingNotifier {
  pub fn shown(&self) -> Vec<NotificationIntent> {
    self.shown.lock().unwrap().clone()
  }
}

#[async_trait]
impl Notifier for RecordingNotifier {
  async fn show(&self, intent: &NotificationIntent) -> Result<()> {
    self.shown.lock().unwrap().push(intent.clone());
    Ok(())
  }
}

/// Client windows held in memory.
#[derive(Default)]
pub struct FakeClients {
  windows: Mutex<Vec<ClientWindow>>,
  focused: Mutex<Vec<String>>,
  opened: Mutex<Vec<Url>>,
  claims: Mutex<usize>,
}

impl FakeClients {
  pub fn with_windows(windows: &[(&str, &str)]) -> Self {
    let windows = windows
      .iter()
      .map(|(id, url)| ClientWindow {
        id: id.to_string(),
        url: Url::parse(url).expect("valid window url"),
      })
      .collect();
    Self {
      windows: Mutex::new(windows),
      ..Self::default()
    }
  }

  pub fn focused(&self) -> Vec<String> {
    self.focused.lock().unwrap().clone()
  }

  pub fn opened(&self) -> Vec<Url> {
    self.opened.lock().unwrap().clone()
  }

  pub fn claims(&self) -> usize {
    *self.claims.lock().unwrap()
  }
}

#[async_trait]
impl Clients for FakeClients {
  async fn windows(&self) -> Result<Vec<ClientWindow>> {
    Ok(self.windows.lock().unwrap().clone())
  }

  async fn focus(&self, id: &str) -> Result<()> {
    self.focused.lock().unwrap().push(id.to_string());
    Ok(())
  }

  async fn open_window(&self, url: &Url) -> Result<()> {
    self.opened.lock().unwrap().push(url.clone());
    Ok(())
  }

  async fn claim(&self) -> Result<usize> {
    *self.claims.lock().unwrap() += 1;
    Ok(self.windows.lock().unwrap().len())
  }
}
