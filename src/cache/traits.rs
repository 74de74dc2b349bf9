//! Core types for the caching system.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use crate::http::{Request, Response};

/// Identity of a cached request.
///
/// Entries are keyed by method and URL only; headers are not part of the key
/// and the URL fragment is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  /// Key for a GET of `url`.
  pub fn get(url: &Url) -> Self {
    Self::new("GET", url)
  }

  /// Stable, fixed-length key used as the storage row id.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl From<&Request> for RequestKey {
  fn from(request: &Request) -> Self {
    Self::new(&request.method, &request.url)
  }
}

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// The stored response snapshot
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}
