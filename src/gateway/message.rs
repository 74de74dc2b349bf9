//! Control messages posted to the gateway and the replies it sends back.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;

/// Wire shape of a control message: `{ "type": ..., "payload": ... }`.
#[derive(Debug, Deserialize)]
struct Envelope {
  #[serde(rename = "type")]
  kind: String,
  #[serde(default)]
  payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CacheUrlsPayload {
  urls: Vec<String>,
}

/// A command for the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
  /// Take over without waiting for clients to release the old generation
  SkipWaiting,
  /// Delete every cache store
  ClearCache,
  /// Fetch and store these resources in the current generation
  CacheUrls { urls: Vec<String> },
  /// Sum the body sizes of every stored response
  GetCacheSize,
  /// Anything else; ignored
  Unknown(String),
}

impl ControlMessage {
  pub fn name(&self) -> &str {
    match self {
      Self::SkipWaiting => "SKIP_WAITING",
      Self::ClearCache => "CLEAR_CACHE",
      Self::CacheUrls { .. } => "CACHE_URLS",
      Self::GetCacheSize => "GET_CACHE_SIZE",
      Self::Unknown(name) => name,
    }
  }

  pub fn from_json(raw: &str) -> Result<Self> {
    let value: Value =
      serde_json::from_str(raw).map_err(|e| eyre!("Invalid control message: {}", e))?;
    Self::from_value(value)
  }

  pub fn from_value(value: Value) -> Result<Self> {
    let envelope: Envelope =
      serde_json::from_value(value).map_err(|e| eyre!("Invalid control message: {}", e))?;

    let message = match envelope.kind.as_str() {
      "SKIP_WAITING" => Self::SkipWaiting,
      "CLEAR_CACHE" => Self::ClearCache,
      "GET_CACHE_SIZE" => Self::GetCacheSize,
      "CACHE_URLS" => {
        let payload = envelope
          .payload
          .ok_or_else(|| eyre!("CACHE_URLS requires a payload with `urls`"))?;
        let payload: CacheUrlsPayload = serde_json::from_value(payload)
          .map_err(|e| eyre!("Invalid CACHE_URLS payload: {}", e))?;
        Self::CacheUrls { urls: payload.urls }
      }
      other => Self::Unknown(other.to_string()),
    };

    Ok(message)
  }
}

/// Reply sent on a message's reply port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
  Success { success: bool },
  Size { size: u64 },
}

impl Reply {
  pub fn to_json(&self) -> String {
    match self {
      Self::Success { success } => serde_json::json!({ "success": success }).to_string(),
      Self::Size { size } => serde_json::json!({ "size": size }).to_string(),
    }
  }
}
