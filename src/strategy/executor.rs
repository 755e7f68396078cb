//! Strategy executors: cache-vs-network precedence per request class.

use std::sync::Arc;
use tracing::{debug, warn};

use super::selector::RequestClass;
use crate::cache::{CacheEntry, CacheLayer, CacheNamespace, CacheStore, PendingWrite};
use crate::config::ControllerConfig;
use crate::http::{CacheKey, Method, Request, Response, ResponseType};
use crate::network::Network;

const OFFLINE_MESSAGE: &str = "You are offline and this data is not available in the cache.";

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
  /// Fresh data from network
  Network,
  /// Cache hit on a cache-first strategy
  Cache,
  /// Network failed, serving a previously cached entry
  Offline,
  /// Produced by the controller (offline JSON, placeholder)
  Synthesized,
}

/// A response plus the cache writes it started.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ServedFrom,
  /// Background writes that must commit before the event is settled
  pub writes: Vec<PendingWrite>,
}

impl Served {
  fn new(response: Response, source: ServedFrom) -> Self {
    Self {
      response,
      source,
      writes: Vec::new(),
    }
  }

  fn with_write(mut self, write: PendingWrite) -> Self {
    self.writes.push(write);
    self
  }
}

/// The three strategy executors, sharing one cache and one network.
pub struct Strategies<S: CacheStore> {
  config: Arc<ControllerConfig>,
  cache: CacheLayer<S>,
  network: Arc<dyn Network>,
}

impl<S: CacheStore> Strategies<S> {
  pub fn new(config: Arc<ControllerConfig>, cache: CacheLayer<S>, network: Arc<dyn Network>) -> Self {
    Self {
      config,
      cache,
      network,
    }
  }

  /// Run the strategy for a class. Always produces a response.
  pub async fn execute(&self, class: RequestClass, request: &Request) -> Served {
    debug!(url = %request.url, ?class, "executing strategy");
    match class {
      RequestClass::Api => self.network_first(request).await,
      RequestClass::Image => self.cache_first_populate(request).await,
      RequestClass::Static | RequestClass::Unclassified => self.cache_first_static(request).await,
    }
  }

  /// Network-first with cache fallback (API data).
  ///
  /// 1. Try the network; on success refresh the API cache in the background
  /// 2. On network failure serve the cached entry untouched, stale or not
  /// 3. With nothing cached, synthesize a 503 offline response
  pub async fn network_first(&self, request: &Request) -> Served {
    let namespace = self.config.api_namespace();
    let key = request.cache_key();

    match self.network.fetch(request).await {
      Ok(response) => {
        let served = Served::new(response.clone(), ServedFrom::Network);
        if stores_body(request) && response.ok() {
          let entry = CacheEntry::from_response(key, &response);
          served.with_write(self.cache.put_detached(&namespace, entry))
        } else {
          served
        }
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "network failed, falling back to API cache");
        match self.cache.get(&namespace, &key).await {
          Some(entry) => {
            if self.cache.is_stale(&entry) {
              debug!(key = %key, age_secs = entry.age().num_seconds(), "serving stale API entry");
            }
            Served::new(entry.to_response(), ServedFrom::Offline)
          }
          None => Served::new(Response::offline_json(OFFLINE_MESSAGE), ServedFrom::Synthesized),
        }
      }
    }
  }

  /// Cache-first with runtime population (images).
  ///
  /// Only a status of exactly 200 is cached, and it is committed before the
  /// response is returned. Anything else yields a 404 placeholder.
  pub async fn cache_first_populate(&self, request: &Request) -> Served {
    let namespace = self.config.image_namespace();
    let key = request.cache_key();

    if let Some(entry) = self.cache.get(&namespace, &key).await {
      return Served::new(entry.to_response(), ServedFrom::Cache);
    }

    match self.network.fetch(request).await {
      Ok(response) if response.status == 200 => {
        if stores_body(request) {
          let entry = CacheEntry::from_response(key, &response);
          if let Err(e) = self.cache.put(&namespace, entry).await {
            warn!(url = %request.url, error = %e, "failed to cache image");
          }
        }
        Served::new(response, ServedFrom::Network)
      }
      Ok(response) => {
        debug!(url = %request.url, status = response.status, "image not cacheable");
        Served::new(Response::not_found(), ServedFrom::Synthesized)
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "image fetch failed");
        Served::new(Response::not_found(), ServedFrom::Synthesized)
      }
    }
  }

  /// Cache-first for static assets and unclassified traffic.
  ///
  /// Only same-origin, non-opaque 200 responses are cached. When the network
  /// is unreachable, navigations get the offline page and everything else a
  /// 404 placeholder.
  pub async fn cache_first_static(&self, request: &Request) -> Served {
    let namespace = self.config.static_namespace();
    let key = request.cache_key();

    if let Some(entry) = self.cache.get(&namespace, &key).await {
      return Served::new(entry.to_response(), ServedFrom::Cache);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        let served = Served::new(response.clone(), ServedFrom::Network);
        if stores_body(request) && self.is_cacheable_static(&response) {
          let entry = CacheEntry::from_response(key, &response);
          served.with_write(self.cache.put_detached(&namespace, entry))
        } else {
          served
        }
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "static fetch failed");
        if request.is_navigation() {
          self.offline_page(&namespace).await
        } else {
          Served::new(Response::not_found(), ServedFrom::Synthesized)
        }
      }
    }
  }

  fn is_cacheable_static(&self, response: &Response) -> bool {
    let same_origin = response
      .url
      .as_ref()
      .is_some_and(|u| self.config.is_same_origin(u));
    response.status == 200 && response.kind == ResponseType::Basic && same_origin
  }

  async fn offline_page(&self, namespace: &CacheNamespace) -> Served {
    let key = CacheKey::derive(Method::Get, &self.config.offline_page);
    match self.cache.get(namespace, &key).await {
      Some(entry) => Served::new(entry.to_response(), ServedFrom::Offline),
      None => {
        warn!(page = %self.config.offline_page, "offline page missing from static cache");
        Served::new(Response::not_found(), ServedFrom::Synthesized)
      }
    }
  }
}

/// HEAD shares the GET key but carries no body, so it must not overwrite it.
fn stores_body(request: &Request) -> bool {
  request.method == Method::Get
}
