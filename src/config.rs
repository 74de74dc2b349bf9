use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::gateway::{CachePolicy, NotificationDefaults};

/// Prefix of every cache store name; the version string follows it.
pub const CACHE_PREFIX: &str = "static-nav";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the portal is served from; manifest paths resolve against it
  pub origin: String,
  /// Deployment version. Changing it starts a new cache generation.
  pub version: String,
  /// Root-relative paths that must be cached before a generation is installed
  pub manifest: Vec<String>,
  /// Regexes selecting which runtime fetches are worth persisting
  pub dynamic_patterns: Vec<String>,
  /// Document served when the network is unreachable
  pub fallback_document: String,
  /// Upper bound on a single network fetch; 0 disables the limit
  pub fetch_timeout_secs: u64,
  /// SQLite database location (defaults to $XDG_DATA_HOME/navgate/cache.db)
  pub cache_path: Option<PathBuf>,
  pub notification: NotificationDefaults,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      version: "v1.0.0".to_string(),
      manifest: DEFAULT_MANIFEST.iter().map(|s| s.to_string()).collect(),
      dynamic_patterns: vec![
        r"\.(?:png|jpg|jpeg|svg|gif|webp)$".to_string(),
        r"\.(?:woff|woff2|ttf|eot)$".to_string(),
      ],
      fallback_document: "/index.html".to_string(),
      fetch_timeout_secs: 30,
      cache_path: None,
      notification: NotificationDefaults::default(),
    }
  }
}

/// Entry points, stylesheets, and scripts of the portal.
const DEFAULT_MANIFEST: &[&str] = &[
  "/",
  "/index.html",
  "/editor.html",
  "/css/style.css",
  "/css/dark-mode.css",
  "/css/keyboard-shortcuts.css",
  "/css/search-highlight.css",
  "/css/undo-redo.css",
  "/css/performance-monitor.css",
  "/css/bookmark-import.css",
  "/js/app.js",
  "/js/data.js",
  "/js/editor-new.js",
  "/js/stars.js",
  "/js/keyboard-shortcuts.js",
  "/js/backup-manager.js",
  "/js/search-highlight.js",
  "/js/dark-mode.js",
  "/js/undo-redo.js",
  "/js/performance-monitor.js",
  "/js/bookmark-import.js",
  "/manifest.json",
];

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./navgate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/navgate/config.yaml
  ///
  /// Falls back to the built-in portal defaults when nothing is found.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("navgate.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("navgate").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Reject settings that would only fail later, at install or fetch time.
  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    self.cache_policy()?;
    self.fallback_url()?;
    self.manifest_urls()?;
    if self.version.trim().is_empty() {
      return Err(eyre!("Config field `version` must not be empty"));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Resolve a root-relative path or absolute URL against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid resource path {}: {}", path, e))
  }

  /// Name of the cache store owned by this version.
  pub fn cache_name(&self) -> String {
    format!("{}-{}", CACHE_PREFIX, self.version)
  }

  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    self.manifest.iter().map(|p| self.resolve(p)).collect()
  }

  pub fn fallback_url(&self) -> Result<Url> {
    self.resolve(&self.fallback_document)
  }

  pub fn cache_policy(&self) -> Result<CachePolicy> {
    CachePolicy::new(&self.dynamic_patterns)
  }

  pub fn fetch_timeout(&self) -> Option<Duration> {
    (self.fetch_timeout_secs > 0).then(|| Duration::from_secs(self.fetch_timeout_secs))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_match_portal() {
    let config = Config::default();
    assert_eq!(config.cache_name(), "static-nav-v1.0.0");
    assert_eq!(config.manifest.len(), 22);
    assert_eq!(config.fetch_timeout(), Some(Duration::from_secs(30)));
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      "origin: https://nav.example\nversion: v2\nmanifest: [/, /index.html]\nfetch_timeout_secs: 0\n",
    )
    .unwrap();

    assert_eq!(config.cache_name(), "static-nav-v2");
    assert_eq!(config.fallback_document, "/index.html");
    assert_eq!(config.fetch_timeout(), None);
    assert_eq!(
      config.manifest_urls().unwrap()[1].as_str(),
      "https://nav.example/index.html"
    );
  }

  #[test]
  fn test_invalid_pattern_is_rejected() {
    let config = Config::from_yaml("dynamic_patterns: ['(unclosed']\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_invalid_origin_is_rejected() {
    let config = Config::from_yaml("origin: not a url\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/navgate.yaml"))).is_err());
  }
}
