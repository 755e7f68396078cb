use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

use crate::cache::CacheNamespace;

/// Logical names of the three caches owned by a controller version.
pub const STATIC_CACHE: &str = "static";
pub const API_CACHE: &str = "api";
pub const IMAGE_CACHE: &str = "images";

/// On-disk configuration, as written by the operator.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin of the application being served (e.g. "https://shop.example.com")
  pub origin: String,
  /// Deployment version; bump it on every release
  pub version: u32,
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub assets: AssetsConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub notifications: NotificationDefaults,
  /// Database location (defaults to $XDG_DATA_HOME/edgeward/edgeward.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Path prefixes routed to the API cache
  #[serde(default = "default_api_prefixes")]
  pub prefixes: Vec<String>,
  /// Data-backend hosts; exact match or "*.suffix"
  #[serde(default = "default_api_hosts", deserialize_with = "deserialize_lowercase_set")]
  pub hosts: BTreeSet<String>,
  /// Age after which a cached API entry is considered stale
  #[serde(default = "default_stale_after_secs")]
  pub stale_after_secs: i64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      prefixes: default_api_prefixes(),
      hosts: default_api_hosts(),
      stale_after_secs: default_stale_after_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetsConfig {
  /// URLs pre-warmed into the static cache at install time
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  /// Page served for navigations that fail while offline
  #[serde(default = "default_offline_page")]
  pub offline_page: String,
  /// File extensions treated as static assets (case-insensitive)
  #[serde(default = "default_extensions", deserialize_with = "deserialize_lowercase_set")]
  pub extensions: BTreeSet<String>,
}

impl Default for AssetsConfig {
  fn default() -> Self {
    Self {
      manifest: default_manifest(),
      offline_page: default_offline_page(),
      extensions: default_extensions(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Background sync tag that replays the deferred write queue
  #[serde(default = "default_sync_tag")]
  pub tag: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: default_sync_tag(),
    }
  }
}

/// Fallback values for push notifications that omit fields.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NotificationDefaults {
  #[serde(default = "default_title")]
  pub title: String,
  #[serde(default = "default_body")]
  pub body: String,
  #[serde(default = "default_icon")]
  pub icon: String,
  #[serde(default = "default_tag")]
  pub tag: String,
  #[serde(default = "default_url")]
  pub url: String,
}

impl Default for NotificationDefaults {
  fn default() -> Self {
    Self {
      title: default_title(),
      body: default_body(),
      icon: default_icon(),
      tag: default_tag(),
      url: default_url(),
    }
  }
}

fn default_api_prefixes() -> Vec<String> {
  vec!["/api/".to_string()]
}

fn default_api_hosts() -> BTreeSet<String> {
  ["firestore.googleapis.com", "*.firebaseio.com"]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_stale_after_secs() -> i64 {
  300
}

fn default_manifest() -> Vec<String> {
  vec![
    "/".to_string(),
    "/offline.html".to_string(),
    "/manifest.json".to_string(),
  ]
}

fn default_offline_page() -> String {
  "/offline.html".to_string()
}

fn default_extensions() -> BTreeSet<String> {
  [
    "html", "css", "js", "mjs", "json", "webmanifest", "woff", "woff2", "ttf", "ico", "txt",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_sync_tag() -> String {
  "sync-deferred-writes".to_string()
}

fn default_title() -> String {
  "Notification".to_string()
}

fn default_body() -> String {
  "You have a new update.".to_string()
}

fn default_icon() -> String {
  "/icons/icon-192x192.png".to_string()
}

fn default_tag() -> String {
  "default".to_string()
}

fn default_url() -> String {
  "/".to_string()
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./edgeward.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/edgeward/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/edgeward/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("edgeward.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("edgeward").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Freeze into the immutable configuration shared by every component.
  pub fn into_controller_config(self) -> Result<Arc<ControllerConfig>> {
    let origin = Url::parse(&self.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;

    let resolve = |path: &str| {
      origin
        .join(path)
        .map_err(|e| eyre!("Invalid URL '{}': {}", path, e))
    };

    let manifest = self
      .assets
      .manifest
      .iter()
      .map(|p| resolve(p))
      .collect::<Result<Vec<_>>>()?;
    let offline_page = resolve(&self.assets.offline_page)?;
    let stale_after = Some(self.api.stale_after_secs)
      .filter(|secs| *secs >= 0)
      .and_then(Duration::try_seconds)
      .ok_or_else(|| eyre!("Invalid api.stale_after_secs: {}", self.api.stale_after_secs))?;

    Ok(Arc::new(ControllerConfig {
      version: self.version,
      api_prefixes: self.api.prefixes,
      api_hosts: self.api.hosts,
      asset_extensions: self.assets.extensions,
      manifest,
      offline_page,
      stale_after,
      network_timeout: std::time::Duration::from_secs(self.network.timeout_secs),
      sync_tag: self.sync.tag,
      notifications: self.notifications,
      origin,
    }))
  }

  /// Database path from config, or the default data directory location.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("edgeward").join("edgeward.db"))
  }
}

/// Immutable controller configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
  pub origin: Url,
  pub version: u32,
  pub api_prefixes: Vec<String>,
  pub api_hosts: BTreeSet<String>,
  pub asset_extensions: BTreeSet<String>,
  pub manifest: Vec<Url>,
  pub offline_page: Url,
  pub stale_after: Duration,
  pub network_timeout: std::time::Duration,
  pub sync_tag: String,
  pub notifications: NotificationDefaults,
}

impl ControllerConfig {
  /// Defaults for an origin, used by tests and as a template.
  pub fn for_origin(origin: &str, version: u32) -> Result<Arc<Self>> {
    Config {
      origin: origin.to_string(),
      version,
      api: ApiConfig::default(),
      assets: AssetsConfig::default(),
      network: NetworkConfig::default(),
      sync: SyncConfig::default(),
      notifications: NotificationDefaults::default(),
      database: None,
    }
    .into_controller_config()
  }

  pub fn static_namespace(&self) -> CacheNamespace {
    CacheNamespace::new(STATIC_CACHE, self.version)
  }

  pub fn api_namespace(&self) -> CacheNamespace {
    CacheNamespace::new(API_CACHE, self.version)
  }

  pub fn image_namespace(&self) -> CacheNamespace {
    CacheNamespace::new(IMAGE_CACHE, self.version)
  }

  /// The three namespaces this version owns; everything else is garbage on activation.
  pub fn current_namespaces(&self) -> [CacheNamespace; 3] {
    [
      self.static_namespace(),
      self.api_namespace(),
      self.image_namespace(),
    ]
  }

  /// Resolve a possibly relative URL against the origin.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .origin
      .join(url)
      .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }
}
