use crate::config::ControllerConfig;
use crate::http::{Destination, Request};

/// Category a request is sorted into before a strategy runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
  /// Known application shell asset (scripts, styles, manifest entries)
  Static,
  /// API or data-backend call
  Api,
  /// Anything the client declared as an image
  Image,
  /// Everything else; handled like a static asset
  Unclassified,
}

/// Classify a request. Total and deterministic.
///
/// API matching wins over destination; image destination wins over URL shape.
pub fn classify(request: &Request, config: &ControllerConfig) -> RequestClass {
  if is_api(request, config) {
    RequestClass::Api
  } else if request.destination == Destination::Image {
    RequestClass::Image
  } else if is_static_asset(request, config) {
    RequestClass::Static
  } else {
    RequestClass::Unclassified
  }
}

fn is_api(request: &Request, config: &ControllerConfig) -> bool {
  let path = request.url.path();
  if config
    .api_prefixes
    .iter()
    .any(|prefix| path.starts_with(prefix.as_str()))
  {
    return true;
  }

  match request.url.host_str() {
    Some(host) => {
      let host = host.to_ascii_lowercase();
      config
        .api_hosts
        .iter()
        .any(|pattern| host_matches(&host, pattern))
    }
    None => false,
  }
}

/// Exact host, or "*.suffix" for any subdomain of suffix.
fn host_matches(host: &str, pattern: &str) -> bool {
  match pattern.strip_prefix("*.") {
    Some(suffix) => host
      .strip_suffix(suffix)
      .is_some_and(|rest| rest.ends_with('.') && rest.len() > 1),
    None => host == pattern,
  }
}

fn is_static_asset(request: &Request, config: &ControllerConfig) -> bool {
  if !config.is_same_origin(&request.url) {
    return false;
  }

  let path = request.url.path();
  if config.manifest.iter().any(|m| m.path() == path) {
    return true;
  }

  let file = path.rsplit('/').next().unwrap_or_default();
  match file.rsplit_once('.') {
    Some((stem, ext)) if !stem.is_empty() => config
      .asset_extensions
      .contains(&ext.to_ascii_lowercase()),
    _ => false,
  }
}
