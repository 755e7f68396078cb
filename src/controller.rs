//! One controller version: routes events to handlers and tracks its lifecycle.
//!
//! Every event runs on its own task. [`Controller::dispatch`] hands back an
//! [`EventHandle`] whose outcome is available as soon as the handler has one,
//! while [`EventHandle::settled`] waits for the durable writes it started.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheNamespace, CacheStore, PendingWrite};
use crate::config::ControllerConfig;
use crate::control::ControlMessage;
use crate::http::{Request, Response};
use crate::lifecycle::{self, Lifecycle, LifecycleState};
use crate::network::{FetchError, Network};
use crate::notify::{ClickOutcome, Clients, NotificationDispatcher, NotificationIntent, Notifier};
use crate::queue::{DeferredWriteItem, WriteQueue};
use crate::registry::Registrations;
use crate::strategy::{classify, ServedFrom, Strategies};
use crate::sync::{SyncCoordinator, SyncReport};

/// Platform services a controller talks to.
#[derive(Clone)]
pub struct Host {
  pub network: Arc<dyn Network>,
  pub notifier: Arc<dyn Notifier>,
  pub clients: Arc<dyn Clients>,
}

#[derive(Debug, Clone)]
pub enum ControllerEvent {
  Install,
  Activate,
  Fetch(Request),
  Message(Vec<u8>),
  Sync { tag: String },
  Push(Option<Vec<u8>>),
  NotificationClick { target_url: String },
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// The controller answered the request
  Responded {
    response: Response,
    source: ServedFrom,
  },
  /// Not intercepted; the network's own result, failure included
  Passthrough(Result<Response, FetchError>),
}

impl FetchOutcome {
  pub fn response(&self) -> Option<&Response> {
    match self {
      Self::Responded { response, .. } => Some(response),
      Self::Passthrough(Ok(response)) => Some(response),
      Self::Passthrough(Err(_)) => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
  SkippedWaiting { activated: bool },
  CachedUrls { count: usize },
  CacheUrlsFailed { reason: String },
  Ignored,
}

#[derive(Debug, Clone)]
pub enum EventOutcome {
  Installed { cached: usize },
  InstallFailed { reason: String },
  Activated { deleted: Vec<CacheNamespace> },
  Fetch(FetchOutcome),
  Message(MessageOutcome),
  Synced(Option<SyncReport>),
  Notified(NotificationIntent),
  Clicked(ClickOutcome),
  Failed(String),
}

/// Completion handle for one dispatched event.
pub struct EventHandle {
  outcome: Option<oneshot::Receiver<EventOutcome>>,
  task: JoinHandle<()>,
}

impl EventHandle {
  /// Wait for the handler's result. Can be taken once.
  pub async fn outcome(&mut self) -> Result<EventOutcome> {
    let rx = self
      .outcome
      .take()
      .ok_or_else(|| eyre!("Event outcome already taken"))?;
    rx.await
      .map_err(|e| eyre!("Event handler ended without an outcome: {}", e))
  }

  /// Wait until every write the handler started has committed.
  pub async fn settled(self) -> Result<()> {
    self
      .task
      .await
      .map_err(|e| eyre!("Event task failed: {}", e))
  }

  /// Outcome, then settle.
  pub async fn finish(mut self) -> Result<EventOutcome> {
    let outcome = self.outcome().await?;
    self.settled().await?;
    Ok(outcome)
  }
}

/// The version currently in charge, shared by every controller over one store.
///
/// Kept in memory so checking it never touches the database.
#[derive(Clone)]
pub struct ActiveVersion(Arc<watch::Sender<Option<u32>>>);

impl ActiveVersion {
  pub fn new(version: Option<u32>) -> Self {
    Self(Arc::new(watch::channel(version).0))
  }

  pub fn get(&self) -> Option<u32> {
    *self.0.borrow()
  }

  pub fn set(&self, version: Option<u32>) {
    self.0.send_replace(version);
  }
}

struct Inner<S: CacheStore> {
  config: Arc<ControllerConfig>,
  cache: CacheLayer<S>,
  strategies: Strategies<S>,
  sync: SyncCoordinator,
  notifications: Arc<NotificationDispatcher>,
  network: Arc<dyn Network>,
  clients: Arc<dyn Clients>,
  registrations: Arc<dyn Registrations>,
  active: ActiveVersion,
  lifecycle: Mutex<Lifecycle>,
  /// Held across install and activate so they never interleave
  transitions: tokio::sync::Mutex<()>,
}

/// A controller version. Cloning shares the same instance.
pub struct Controller<S: CacheStore> {
  inner: Arc<Inner<S>>,
}

impl<S: CacheStore> Clone for Controller<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: CacheStore> Controller<S> {
  pub fn new(
    config: Arc<ControllerConfig>,
    store: Arc<S>,
    queue: Arc<dyn WriteQueue>,
    registrations: Arc<dyn Registrations>,
    host: Host,
    active: ActiveVersion,
    lifecycle: Lifecycle,
  ) -> Self {
    let cache = CacheLayer::from_shared(store).with_stale_time(config.stale_after);
    let strategies = Strategies::new(
      Arc::clone(&config),
      cache.clone(),
      Arc::clone(&host.network),
    );
    let notifications = Arc::new(NotificationDispatcher::new(
      Arc::clone(&config),
      host.notifier,
      Arc::clone(&host.clients),
    ));
    let sync = SyncCoordinator::new(
      Arc::clone(&config),
      queue,
      Arc::clone(&host.network),
      Arc::clone(&notifications),
    );

    Self {
      inner: Arc::new(Inner {
        config,
        cache,
        strategies,
        sync,
        notifications,
        network: host.network,
        clients: host.clients,
        registrations,
        active,
        lifecycle: Mutex::new(lifecycle),
        transitions: tokio::sync::Mutex::new(()),
      }),
    }
  }

  pub fn version(&self) -> u32 {
    self.inner.config.version
  }

  pub fn config(&self) -> &Arc<ControllerConfig> {
    &self.inner.config
  }

  fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
    // Lifecycle holds plain data; a panic mid-update leaves nothing half-written
    self
      .inner
      .lifecycle
      .lock()
      .unwrap_or_else(|e| e.into_inner())
  }

  /// Current state. An active controller notices when another version has
  /// taken over; a version still installing or waiting is never retired here.
  pub fn state(&self) -> LifecycleState {
    let mut lifecycle = self.lifecycle();
    if lifecycle.state() == LifecycleState::Active {
      let version = self.version();
      if self.inner.active.get().is_some_and(|active| active != version) {
        if let Err(e) = lifecycle.transition(LifecycleState::Redundant) {
          warn!(version, error = %e, "cannot retire controller");
        }
      }
    }
    lifecycle.state()
  }

  fn transition(&self, to: LifecycleState) -> Result<()> {
    self.lifecycle().transition(to)?;
    Ok(())
  }

  /// Pre-warm the static cache and advance to `Installed`.
  ///
  /// On failure the version stays `Installing` and install may be retried.
  /// If skip-waiting was requested meanwhile, activation follows at once.
  pub async fn install(&self) -> Result<usize> {
    let version = self.version();
    let (cached, skip_waiting) = {
      let _guard = self.inner.transitions.lock().await;
      let state = self.state();
      if state != LifecycleState::Installing {
        return Err(eyre!("Cannot install version {} while {}", version, state));
      }
      self
        .inner
        .registrations
        .set_state(version, LifecycleState::Installing)?;

      let cached = match lifecycle::prewarm(&self.inner.cache, self.inner.network.as_ref(), &self.inner.config).await {
        Ok(count) => count,
        Err(e) => {
          warn!(version, error = %e, "install failed; will retry on next registration");
          return Err(e);
        }
      };

      self.transition(LifecycleState::Installed)?;
      self
        .inner
        .registrations
        .set_state(version, LifecycleState::Installed)?;
      info!(version, cached, "installed");

      let skip_waiting = self.lifecycle().skip_waiting_requested();
      (cached, skip_waiting)
    };

    if skip_waiting {
      self.activate().await?;
    }
    Ok(cached)
  }

  /// Delete other versions' namespaces, become active and claim clients.
  ///
  /// Cleanup and claim failures are logged; they do not stop activation.
  pub async fn activate(&self) -> Result<Vec<CacheNamespace>> {
    let _guard = self.inner.transitions.lock().await;
    let version = self.version();
    if self.state() == LifecycleState::Active {
      return Ok(Vec::new());
    }

    self.transition(LifecycleState::Activating)?;

    let deleted = match lifecycle::collect_garbage(&self.inner.cache, &self.inner.config) {
      Ok(deleted) => deleted,
      Err(e) => {
        warn!(version, error = %e, "old cache cleanup failed");
        Vec::new()
      }
    };

    self.inner.registrations.activate(version)?;
    self.inner.active.set(Some(version));
    self.transition(LifecycleState::Active)?;
    info!(version, deleted = deleted.len(), "activated");

    match self.inner.clients.claim().await {
      Ok(claimed) => info!(version, claimed, "claimed open clients"),
      Err(e) => warn!(version, error = %e, "failed to claim clients"),
    }

    Ok(deleted)
  }

  /// Activate without waiting for the previous version's clients.
  ///
  /// Returns whether activation happened now. Before install completes the
  /// request is remembered and honoured once installed.
  pub async fn skip_waiting(&self) -> Result<bool> {
    let state = {
      let mut lifecycle = self.lifecycle();
      lifecycle.request_skip_waiting();
      lifecycle.state()
    };

    if state != LifecycleState::Installed {
      debug!(version = self.version(), %state, "skip waiting noted");
      return Ok(false);
    }
    self.activate().await?;
    Ok(true)
  }

  /// Answer a request, or let it through untouched.
  ///
  /// Only cacheable reads are intercepted, and only while active.
  pub async fn handle_fetch(&self, request: &Request) -> (FetchOutcome, Vec<PendingWrite>) {
    let state = self.state();
    if state != LifecycleState::Active || !request.method.is_cacheable_read() {
      debug!(url = %request.url, method = %request.method, %state, "passing request through");
      let result = self.inner.network.fetch(request).await;
      return (FetchOutcome::Passthrough(result), Vec::new());
    }

    let class = classify(request, &self.inner.config);
    let served = self.inner.strategies.execute(class, request).await;
    (
      FetchOutcome::Responded {
        response: served.response,
        source: served.source,
      },
      served.writes,
    )
  }

  pub async fn handle_message(&self, raw: &[u8]) -> Result<MessageOutcome> {
    match ControlMessage::parse(raw) {
      None => Ok(MessageOutcome::Ignored),
      Some(ControlMessage::SkipWaiting) => {
        let activated = self.skip_waiting().await?;
        Ok(MessageOutcome::SkippedWaiting { activated })
      }
      Some(ControlMessage::CacheUrls { urls }) => Ok(self.cache_urls(&urls).await),
    }
  }

  async fn cache_urls(&self, urls: &[String]) -> MessageOutcome {
    let resolved: Result<Vec<Url>> = urls.iter().map(|u| self.inner.config.resolve(u)).collect();
    let result = match resolved {
      Ok(urls) => {
        lifecycle::add_all(
          &self.inner.cache,
          self.inner.network.as_ref(),
          &self.inner.config.static_namespace(),
          &urls,
        )
        .await
      }
      Err(e) => Err(e),
    };

    match result {
      Ok(count) => {
        info!(count, "cached URLs on request");
        MessageOutcome::CachedUrls { count }
      }
      Err(e) => {
        warn!(error = %e, "CACHE_URLS failed; nothing stored");
        MessageOutcome::CacheUrlsFailed {
          reason: e.to_string(),
        }
      }
    }
  }

  /// Replay the queue. Only the active version replays; the queue is shared.
  pub async fn handle_sync(&self, tag: &str) -> Result<Option<SyncReport>> {
    let state = self.state();
    if state != LifecycleState::Active {
      debug!(version = self.version(), %state, tag, "ignoring sync trigger");
      return Ok(None);
    }
    self.inner.sync.on_sync(tag).await
  }

  pub async fn handle_push(&self, payload: Option<&[u8]>) -> Result<NotificationIntent> {
    self.inner.notifications.on_push(payload).await
  }

  pub async fn handle_click(&self, target_url: &str) -> Result<ClickOutcome> {
    self.inner.notifications.on_click(target_url).await
  }

  /// Queue a write for replay on the next sync trigger.
  pub fn enqueue_write(&self, item: DeferredWriteItem) -> Result<DeferredWriteItem> {
    self.inner.sync.enqueue(item)
  }

  pub fn pending_writes(&self) -> Result<Vec<DeferredWriteItem>> {
    self.inner.sync.pending()
  }

  pub fn namespaces(&self) -> Result<BTreeSet<CacheNamespace>> {
    self.inner.cache.list_namespaces()
  }

  /// Run an event on its own task.
  pub fn dispatch(&self, event: ControllerEvent) -> EventHandle {
    let (tx, rx) = oneshot::channel();
    let controller = self.clone();

    let task = tokio::spawn(async move {
      let (outcome, writes) = controller.handle(event).await;
      let _ = tx.send(outcome);

      let committed = join_all(writes.into_iter().map(PendingWrite::wait)).await;
      let failed = committed.iter().filter(|ok| !**ok).count();
      if failed > 0 {
        warn!(failed, "some cache writes did not commit");
      }
    });

    EventHandle {
      outcome: Some(rx),
      task,
    }
  }

  async fn handle(&self, event: ControllerEvent) -> (EventOutcome, Vec<PendingWrite>) {
    let outcome = match event {
      ControllerEvent::Install => match self.install().await {
        Ok(cached) => EventOutcome::Installed { cached },
        Err(e) => EventOutcome::InstallFailed {
          reason: e.to_string(),
        },
      },
      ControllerEvent::Activate => match self.activate().await {
        Ok(deleted) => EventOutcome::Activated { deleted },
        Err(e) => EventOutcome::Failed(e.to_string()),
      },
      ControllerEvent::Fetch(request) => {
        let (outcome, writes) = self.handle_fetch(&request).await;
        return (EventOutcome::Fetch(outcome), writes);
      }
      ControllerEvent::Message(raw) => match self.handle_message(&raw).await {
        Ok(outcome) => EventOutcome::Message(outcome),
        Err(e) => EventOutcome::Failed(e.to_string()),
      },
      ControllerEvent::Sync { tag } => match self.handle_sync(&tag).await {
        Ok(report) => EventOutcome::Synced(report),
        Err(e) => EventOutcome::Failed(e.to_string()),
      },
      ControllerEvent::Push(payload) => match self.handle_push(payload.as_deref()).await {
        Ok(intent) => EventOutcome::Notified(intent),
        Err(e) => EventOutcome::Failed(e.to_string()),
      },
      ControllerEvent::NotificationClick { target_url } => {
        match self.handle_click(&target_url).await {
          Ok(outcome) => EventOutcome::Clicked(outcome),
          Err(e) => EventOutcome::Failed(e.to_string()),
        }
      }
    };
    (outcome, Vec::new())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStore;
  use crate::http::{CacheKey, Method};
  use crate::queue::MemoryQueue;
  use crate::registry::MemoryRegistrations;
  use crate::testing::{FakeClients, FakeNetwork, RecordingNotifier};
  use serde_json::json;

  const ORIGIN: &str = "https://shop.example.com";

  struct Fixture {
    controller: Controller<MemoryStore>,
    network: Arc<FakeNetwork>,
    notifier: Arc<RecordingNotifier>,
    clients: Arc<FakeClients>,
    store: Arc<MemoryStore>,
  }

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn fixture(version: u32) -> Fixture {
    let config = ControllerConfig::for_origin(ORIGIN, version).unwrap();
    let network = Arc::new(FakeNetwork::new(ORIGIN));
    for u in &config.manifest {
      network.respond(u, 200, &format!("shell {}", u.path()));
    }
    let notifier = Arc::new(RecordingNotifier::default());
    let clients = Arc::new(FakeClients::with_windows(&[("w1", "https://shop.example.com/orders")]));
    let store = Arc::new(MemoryStore::new());

    let controller = Controller::new(
      config,
      Arc::clone(&store),
      Arc::new(MemoryQueue::new()),
      Arc::new(MemoryRegistrations::new()),
      Host {
        network: network.clone(),
        notifier: notifier.clone(),
        clients: clients.clone(),
      },
      ActiveVersion::new(None),
      Lifecycle::new(),
    );

    Fixture {
      controller,
      network,
      notifier,
      clients,
      store,
    }
  }

  async fn active_fixture() -> Fixture {
    let f = fixture(1);
    f.controller.dispatch(ControllerEvent::Install).finish().await.unwrap();
    f.controller.dispatch(ControllerEvent::Activate).finish().await.unwrap();
    assert_eq!(f.controller.state(), LifecycleState::Active);
    f
  }

  async fn fetch(f: &Fixture, request: Request) -> FetchOutcome {
    match f.controller.dispatch(ControllerEvent::Fetch(request)).finish().await.unwrap() {
      EventOutcome::Fetch(outcome) => outcome,
      other => panic!("unexpected outcome: {:?}", other),
    }
  }

  fn responded(outcome: FetchOutcome) -> (Response, ServedFrom) {
    match outcome {
      FetchOutcome::Responded { response, source } => (response, source),
      other => panic!("expected a controller response, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_install_then_activate_claims_clients() {
    let f = fixture(1);
    match f.controller.dispatch(ControllerEvent::Install).finish().await.unwrap() {
      EventOutcome::Installed { cached } => assert_eq!(cached, 3),
      other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(f.controller.state(), LifecycleState::Installed);

    f.controller.dispatch(ControllerEvent::Activate).finish().await.unwrap();
    assert_eq!(f.controller.state(), LifecycleState::Active);
    assert_eq!(f.clients.claims(), 1);
  }

  #[tokio::test]
  async fn test_failed_install_can_be_retried() {
    let f = fixture(1);
    f.network.set_offline(true);

    let outcome = f.controller.dispatch(ControllerEvent::Install).finish().await.unwrap();
    assert!(matches!(outcome, EventOutcome::InstallFailed { .. }));
    assert_eq!(f.controller.state(), LifecycleState::Installing);

    f.network.set_offline(false);
    let outcome = f.controller.dispatch(ControllerEvent::Install).finish().await.unwrap();
    assert!(matches!(outcome, EventOutcome::Installed { cached: 3 }));
  }

  #[tokio::test]
  async fn test_requests_pass_through_until_active() {
    let f = fixture(1);
    let api = url("/api/products");
    f.network.respond(&api, 200, "[1]");

    let outcome = fetch(&f, Request::get(api.clone())).await;
    assert!(matches!(outcome, FetchOutcome::Passthrough(Ok(_))));
    assert!(f.store.keys(&f.controller.config().api_namespace()).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_non_read_methods_are_never_intercepted() {
    let f = active_fixture().await;
    let api = url("/api/orders");
    f.network.respond(&api, 201, "{}");

    let request = Request::json(Method::Post, api.clone(), &json!({"qty": 1})).unwrap();
    assert!(matches!(fetch(&f, request.clone()).await, FetchOutcome::Passthrough(Ok(_))));
    assert!(f.store.keys(&f.controller.config().api_namespace()).unwrap().is_empty());

    f.network.set_offline(true);
    assert!(matches!(fetch(&f, request).await, FetchOutcome::Passthrough(Err(_))));
  }

  #[tokio::test]
  async fn test_api_read_falls_back_to_cached_copy_offline() {
    let f = active_fixture().await;
    let api = url("/api/products");
    f.network.respond(&api, 200, r#"[{"id":1}]"#);

    let (online, source) = responded(fetch(&f, Request::get(api.clone())).await);
    assert_eq!(source, ServedFrom::Network);

    f.network.set_offline(true);
    let (offline, source) = responded(fetch(&f, Request::get(api)).await);
    assert_eq!(source, ServedFrom::Offline);
    assert_eq!(offline.body, online.body);
  }

  #[tokio::test]
  async fn test_api_read_offline_without_cache_is_synthesized() {
    let f = active_fixture().await;
    f.network.set_offline(true);

    let (response, source) = responded(fetch(&f, Request::get(url("/api/cart"))).await);
    assert_eq!(source, ServedFrom::Synthesized);
    assert_eq!(response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["error"], "Offline");
  }

  #[tokio::test]
  async fn test_image_is_fetched_once() {
    let f = active_fixture().await;
    let img = url("/img/logo.png");
    f.network.respond(&img, 200, "png");

    let (_, first) = responded(fetch(&f, Request::image(img.clone())).await);
    let (_, second) = responded(fetch(&f, Request::image(img.clone())).await);
    assert_eq!(first, ServedFrom::Network);
    assert_eq!(second, ServedFrom::Cache);
    assert_eq!(f.network.calls_to(&img), 1);
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_offline_page() {
    let f = active_fixture().await;
    f.network.set_offline(true);

    let (response, _) = responded(fetch(&f, Request::navigate(url("/checkout"))).await);
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "shell /offline.html");
  }

  #[tokio::test]
  async fn test_outcome_arrives_before_write_settles() {
    let f = active_fixture().await;
    let api = url("/api/products");
    f.network.respond(&api, 200, "[]");

    let mut handle = f.controller.dispatch(ControllerEvent::Fetch(Request::get(api.clone())));
    let outcome = handle.outcome().await.unwrap();
    assert!(matches!(outcome, EventOutcome::Fetch(FetchOutcome::Responded { .. })));
    assert!(handle.outcome().await.is_err());
    handle.settled().await.unwrap();

    let key = CacheKey::derive(Method::Get, &api);
    let ns = f.controller.config().api_namespace();
    assert!(f.store.get(&ns, &key).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_cache_urls_message() {
    let f = active_fixture().await;
    f.network.respond(&url("/css/app.css"), 200, "body{}");
    f.network.respond(&url("/js/app.js"), 200, "main()");

    let msg = br#"{"type":"CACHE_URLS","urls":["/css/app.css","/js/app.js"]}"#.to_vec();
    match f.controller.dispatch(ControllerEvent::Message(msg)).finish().await.unwrap() {
      EventOutcome::Message(MessageOutcome::CachedUrls { count }) => assert_eq!(count, 2),
      other => panic!("unexpected outcome: {:?}", other),
    }
    let keys = f.store.keys(&f.controller.config().static_namespace()).unwrap();
    assert_eq!(keys.len(), 5);
  }

  #[tokio::test]
  async fn test_cache_urls_with_a_missing_url_stores_nothing() {
    let f = active_fixture().await;
    f.network.respond(&url("/css/app.css"), 200, "body{}");

    let msg = br#"{"type":"CACHE_URLS","urls":["/css/app.css","/js/missing.js"]}"#.to_vec();
    let outcome = f.controller.dispatch(ControllerEvent::Message(msg)).finish().await.unwrap();
    assert!(matches!(
      outcome,
      EventOutcome::Message(MessageOutcome::CacheUrlsFailed { .. })
    ));
    let keys = f.store.keys(&f.controller.config().static_namespace()).unwrap();
    assert_eq!(keys.len(), 3);
  }

  #[tokio::test]
  async fn test_unknown_message_is_ignored() {
    let f = active_fixture().await;
    let outcome = f
      .controller
      .dispatch(ControllerEvent::Message(b"{\"type\":\"PING\"}".to_vec()))
      .finish()
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Message(MessageOutcome::Ignored)));
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_installed_version_and_collects_garbage() {
    let f = fixture(2);
    f.store.open_namespace(&CacheNamespace::new("static", 1)).unwrap();
    f.controller.dispatch(ControllerEvent::Install).finish().await.unwrap();

    let msg = br#"{"type":"SKIP_WAITING"}"#.to_vec();
    let outcome = f.controller.dispatch(ControllerEvent::Message(msg)).finish().await.unwrap();
    assert!(matches!(
      outcome,
      EventOutcome::Message(MessageOutcome::SkippedWaiting { activated: true })
    ));
    assert_eq!(f.controller.state(), LifecycleState::Active);
    assert!(!f
      .store
      .list_namespaces()
      .unwrap()
      .contains(&CacheNamespace::new("static", 1)));
    assert_eq!(f.clients.claims(), 1);
  }

  #[tokio::test]
  async fn test_skip_waiting_before_install_activates_after_install() {
    let f = fixture(1);
    assert!(!f.controller.skip_waiting().await.unwrap());

    f.controller.dispatch(ControllerEvent::Install).finish().await.unwrap();
    assert_eq!(f.controller.state(), LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_sync_replays_queue_and_notifies() {
    let f = active_fixture().await;
    f.network.respond(&url("/api/orders"), 200, "{}");
    let item = f
      .controller
      .enqueue_write(DeferredWriteItem::new("/api/orders", json!({"qty": 2})))
      .unwrap();

    let ignored = f
      .controller
      .dispatch(ControllerEvent::Sync { tag: "other".into() })
      .finish()
      .await
      .unwrap();
    assert!(matches!(ignored, EventOutcome::Synced(None)));
    assert_eq!(f.controller.pending_writes().unwrap().len(), 1);

    let outcome = f
      .controller
      .dispatch(ControllerEvent::Sync {
        tag: "sync-deferred-writes".into(),
      })
      .finish()
      .await
      .unwrap();
    match outcome {
      EventOutcome::Synced(Some(report)) => assert_eq!(report.delivered, vec![item.id.clone()]),
      other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(f.controller.pending_writes().unwrap().is_empty());
    assert_eq!(f.notifier.shown()[0].tag, format!("sync-{}", item.id));
  }

  #[tokio::test]
  async fn test_sync_is_ignored_until_active() {
    let f = fixture(1);
    f.controller.dispatch(ControllerEvent::Install).finish().await.unwrap();
    f.network.respond(&url("/api/orders"), 200, "{}");
    f.controller
      .enqueue_write(DeferredWriteItem::new("/api/orders", json!({"qty": 1})))
      .unwrap();

    let outcome = f
      .controller
      .dispatch(ControllerEvent::Sync {
        tag: "sync-deferred-writes".into(),
      })
      .finish()
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Synced(None)));
    assert_eq!(f.controller.pending_writes().unwrap().len(), 1);
    assert_eq!(f.network.calls_to(&url("/api/orders")), 0);
  }

  #[tokio::test]
  async fn test_push_without_payload_uses_defaults() {
    let f = active_fixture().await;
    match f.controller.dispatch(ControllerEvent::Push(None)).finish().await.unwrap() {
      EventOutcome::Notified(intent) => {
        assert_eq!(intent.title, "Notification");
        assert_eq!(intent.target_url, "/");
      }
      other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(f.notifier.shown().len(), 1);
  }

  #[tokio::test]
  async fn test_click_focuses_matching_window_or_opens_one() {
    let f = active_fixture().await;

    let focused = f
      .controller
      .dispatch(ControllerEvent::NotificationClick {
        target_url: "/orders".into(),
      })
      .finish()
      .await
      .unwrap();
    assert!(matches!(focused, EventOutcome::Clicked(ClickOutcome::Focused { .. })));

    let opened = f
      .controller
      .dispatch(ControllerEvent::NotificationClick {
        target_url: "/deals".into(),
      })
      .finish()
      .await
      .unwrap();
    assert!(matches!(opened, EventOutcome::Clicked(ClickOutcome::Opened { .. })));
    assert_eq!(f.clients.opened(), vec![url("/deals")]);
  }
}
