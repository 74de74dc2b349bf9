//! Request/response value types and the network seam.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

/// An outbound resource request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
}

impl Request {
  /// Create a plain GET request for `url`.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      headers: Vec::new(),
    }
  }

  #[cfg(test)]
  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_ascii_uppercase();
    self
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }
}

/// How a response relates to the requesting origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
  /// Same-origin response
  Basic,
  /// Cross-origin response with readable body
  Cors,
  /// Network error placeholder
  Error,
}

/// A response snapshot. Cloning it is how a response is both stored and returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub url: String,
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub kind: ResponseKind,
}

impl Response {
  /// The network-error response (status 0, empty body).
  #[cfg(test)]
  pub fn error() -> Self {
    Self {
      url: String::new(),
      status: 0,
      status_text: String::new(),
      headers: Vec::new(),
      body: Vec::new(),
      kind: ResponseKind::Error,
    }
  }

  /// Status is in the 2xx range.
  pub fn is_ok(&self) -> bool {
    (200..=299).contains(&self.status)
  }

  /// Only full 200 responses that are not network errors may be cached at runtime.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200 && self.kind != ResponseKind::Error
  }
}

/// Performs real network fetches.
///
/// An `Err` means the fetch itself failed (unreachable host, DNS, timeout).
/// HTTP error statuses are not errors and come back as `Ok`.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// reqwest-backed network for a given page origin.
#[derive(Clone)]
pub struct HttpNetwork {
  client: Client,
  origin: Url,
}

impl HttpNetwork {
  pub fn new(origin: Url) -> Result<Self> {
    let client = Client::builder()
      .user_agent(concat!("navgate/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }

  fn kind_for(&self, url: &Url) -> ResponseKind {
    if url.origin() == self.origin.origin() {
      ResponseKind::Basic
    } else {
      ResponseKind::Cors
    }
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (k, v) in &request.headers {
      builder = builder.header(k.as_str(), v.as_str());
    }

    let resp = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = resp.status();
    debug!("fetched {} status={}", request.url, status.as_u16());

    let final_url = resp.url().clone();
    let headers = resp
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
      .collect();

    let body = resp
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      url: final_url.to_string(),
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: body.to_vec(),
      kind: self.kind_for(&final_url),
    })
  }
}
