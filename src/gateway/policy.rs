//! Which requests are intercepted and which responses are persisted.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use url::Url;

/// Eligibility rules for opportunistic runtime caching.
#[derive(Debug, Clone)]
pub struct CachePolicy {
  patterns: Vec<Regex>,
}

impl CachePolicy {
  pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
    let patterns = patterns
      .iter()
      .map(|p| {
        Regex::new(p.as_ref()).map_err(|e| eyre!("Invalid cache pattern {}: {}", p.as_ref(), e))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Self { patterns })
  }

  /// Whether a successful fetch of `url` should be written to the cache.
  ///
  /// Patterns are matched against the full URL string, so a query string
  /// after the extension defeats an anchored pattern.
  pub fn is_eligible(&self, url: &Url) -> bool {
    self.patterns.iter().any(|p| p.is_match(url.as_str()))
  }
}

/// Only http(s) traffic is intercepted; everything else passes through.
pub fn is_network_scheme(url: &Url) -> bool {
  matches!(url.scheme(), "http" | "https")
}
