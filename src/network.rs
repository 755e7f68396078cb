//! Network boundary: the only place requests leave the controller.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::config::ControllerConfig;
use crate::http::{Headers, Method, Request, RequestMode, Response, ResponseType};

/// Transport-level failure. Any HTTP status, including 5xx, is not an error here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  #[error("request timed out")]
  Timeout,
  #[error("DNS lookup failed: {0}")]
  Dns(String),
  #[error("connection refused: {0}")]
  ConnectionRefused(String),
  #[error("network error: {0}")]
  Other(String),
}

/// Something that can perform a request against the origin.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Network implementation backed by reqwest.
#[derive(Clone)]
pub struct ReqwestNetwork {
  client: reqwest::Client,
  config: Arc<ControllerConfig>,
}

impl ReqwestNetwork {
  pub fn new(config: Arc<ControllerConfig>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(config.network_timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, config })
  }

  /// Response tainting: same-origin is basic, cross-origin no-cors is opaque.
  ///
  /// Status and body of opaque responses are kept so they can still be
  /// served; the static-asset strategy never caches them.
  fn response_type(&self, request: &Request, final_url: &url::Url) -> ResponseType {
    if self.config.is_same_origin(final_url) {
      ResponseType::Basic
    } else if request.mode == RequestMode::NoCors {
      ResponseType::Opaque
    } else {
      ResponseType::Cors
    }
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
    Method::Options => reqwest::Method::OPTIONS,
  }
}

fn classify_error(err: &reqwest::Error) -> FetchError {
  if err.is_timeout() {
    return FetchError::Timeout;
  }

  let message = err.to_string();
  let chain = format!("{:?}", err).to_lowercase();
  if chain.contains("dns") || chain.contains("failed to lookup address") {
    FetchError::Dns(message)
  } else if chain.contains("connection refused") {
    FetchError::ConnectionRefused(message)
  } else {
    FetchError::Other(message)
  }
}

#[async_trait]
impl Network for ReqwestNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(to_reqwest_method(request.method), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let resp = builder.send().await.map_err(|e| classify_error(&e))?;
    let final_url = resp.url().clone();
    let kind = self.response_type(request, &final_url);
    let status = resp.status().as_u16();

    let mut headers = Headers::new();
    for (name, value) in resp.headers() {
      if let Ok(v) = value.to_str() {
        headers.insert(name.as_str().to_string(), v.to_string());
      }
    }

    let body = resp
      .bytes()
      .await
      .map_err(|e| classify_error(&e))?
      .to_vec();

    debug!(url = %final_url, status, kind = kind.as_str(), "network response");

    Ok(Response {
      status,
      headers,
      body,
      url: Some(final_url),
      kind,
    })
  }
}
