//! Offline cache gateway.
//!
//! One `Gateway` owns one cache generation, named after the deployment
//! version. It pre-caches the static manifest on install, removes every other
//! generation on activate, and then answers intercepted GET requests
//! cache-first, falling back to the network and, when the network is
//! unreachable, to the cached root document.

mod lifecycle;
mod message;
mod notify;
mod policy;

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, RequestKey};
use crate::config::Config;
use crate::http::{Network, Request, Response};

pub use lifecycle::Lifecycle;
pub use message::{ControlMessage, Reply};
pub use notify::{
  click_target, handle_sync, notification_for_push, Notification, NotificationDefaults,
};
pub use policy::{is_network_scheme, CachePolicy};

/// Everything a gateway needs to know about its generation.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
  /// Store name of this generation
  pub cache_name: String,
  /// Base for resolving relative URLs in control messages
  pub origin: Url,
  /// Resources that must be cached before install succeeds
  pub manifest: Vec<Url>,
  /// Document served when the network is unreachable
  pub fallback: Url,
  pub policy: CachePolicy,
  pub fetch_timeout: Option<Duration>,
}

impl GatewaySettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      cache_name: config.cache_name(),
      origin: config.origin_url()?,
      manifest: config.manifest_urls()?,
      fallback: config.fallback_url()?,
      policy: config.cache_policy()?,
      fetch_timeout: config.fetch_timeout(),
    })
  }
}

/// Where an answered request's response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Cache,
  Network,
  /// Network failed; the cached fallback document was served instead
  Fallback,
}

/// Result of offering a request to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
  /// Not intercepted; the host should perform the request itself
  Bypass,
  Respond {
    response: Response,
    source: ResponseSource,
  },
}

/// The cache gateway for a single generation.
pub struct Gateway<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  settings: GatewaySettings,
  state: Mutex<Lifecycle>,
  skip_waiting: AtomicBool,
}

impl<S: CacheStorage, N: Network> Gateway<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, settings: GatewaySettings) -> Self {
    Self {
      storage,
      network,
      settings,
      state: Mutex::new(Lifecycle::Parsed),
      skip_waiting: AtomicBool::new(false),
    }
  }

  pub fn cache_name(&self) -> &str {
    &self.settings.cache_name
  }

  pub fn state(&self) -> Lifecycle {
    match self.state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  /// Whether `SKIP_WAITING` was received.
  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  fn transition(&self, next: Lifecycle) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *state = state.advance(next)?;
    Ok(())
  }

  /// Adopt a store left by an earlier run of the same generation.
  ///
  /// Succeeds only if every manifest entry is already present; the
  /// generation then counts as installed without refetching anything.
  pub fn resume(&self) -> Result<bool> {
    let name = self.cache_name();
    if !self.storage.has(name)? {
      return Ok(false);
    }

    let stored = self.storage.entries(name)?;
    let complete = self
      .settings
      .manifest
      .iter()
      .all(|url| stored.contains(&RequestKey::get(url)));
    if !complete {
      debug!("store {} exists but is missing manifest entries", name);
      return Ok(false);
    }

    self.transition(Lifecycle::Installing)?;
    self.transition(Lifecycle::Installed)?;
    info!("reusing installed generation {}", name);
    Ok(true)
  }

  /// Create this generation's store and cache the whole manifest in one batch.
  ///
  /// On failure nothing from the manifest is stored, a store created by this
  /// call is removed again, and the generation becomes redundant.
  pub async fn install(&self) -> Result<()> {
    self.transition(Lifecycle::Installing)?;
    let name = self.cache_name();
    info!("installing {}", name);

    let result: Result<()> = async {
      let created = !self.storage.has(name)?;
      self.storage.open(name)?;

      if let Err(e) = self.add_all(&self.settings.manifest).await {
        if created {
          if let Err(del) = self.storage.delete(name) {
            warn!("failed to discard store {}: {}", name, del);
          }
        }
        return Err(e);
      }
      Ok(())
    }
    .await;

    match result {
      Ok(()) => {
        self.transition(Lifecycle::Installed)?;
        info!(
          "installed {} ({} manifest entries)",
          name,
          self.settings.manifest.len()
        );
        Ok(())
      }
      Err(e) => {
        self.transition(Lifecycle::Redundant)?;
        warn!("install of {} failed: {}", name, e);
        Err(e)
      }
    }
  }

  /// Delete every store except this generation's and start serving.
  ///
  /// Returns how many stores were removed. Deletions are not rolled back if
  /// a later one fails; the generation stays installed and can be retried.
  pub fn activate(&self) -> Result<usize> {
    self.transition(Lifecycle::Activating)?;
    let name = self.cache_name();
    info!("activating {}", name);

    match self.delete_other_stores() {
      Ok(removed) => {
        self.transition(Lifecycle::Activated)?;
        info!("activated {} (removed {} old stores)", name, removed);
        Ok(removed)
      }
      Err(e) => {
        self.transition(Lifecycle::Installed)?;
        warn!("activation of {} failed: {}", name, e);
        Err(e)
      }
    }
  }

  fn delete_other_stores(&self) -> Result<usize> {
    let mut removed = 0;
    for name in self.storage.keys()? {
      if name != self.settings.cache_name {
        info!("deleting old cache {}", name);
        self.storage.delete(&name)?;
        removed += 1;
      }
    }
    Ok(removed)
  }

  /// A newer generation took over.
  pub fn retire(&self) -> Result<()> {
    self.transition(Lifecycle::Redundant)
  }

  /// Answer an intercepted request.
  ///
  /// Only GET requests over http(s) are intercepted, and only once the
  /// generation is active. Cached entries are returned as-is with no
  /// revalidation.
  pub async fn handle_fetch(&self, request: &Request) -> Result<FetchOutcome> {
    if !request.is_get() || !is_network_scheme(&request.url) {
      return Ok(FetchOutcome::Bypass);
    }
    if self.state() != Lifecycle::Activated {
      return Ok(FetchOutcome::Bypass);
    }

    let name = self.cache_name();
    let key = RequestKey::from(request);

    if let Some(entry) = self.storage.match_entry(name, &key)? {
      debug!("cache hit {}", request.url);
      return Ok(FetchOutcome::Respond {
        response: entry.response,
        source: ResponseSource::Cache,
      });
    }
    debug!("cache miss {}", request.url);

    let response = match self.fetch_network(request).await {
      Ok(response) => response,
      Err(e) => {
        warn!("request failed {}: {}", request.url, e);
        let fallback = RequestKey::get(&self.settings.fallback);
        return match self.storage.match_entry(name, &fallback)? {
          Some(entry) => Ok(FetchOutcome::Respond {
            response: entry.response,
            source: ResponseSource::Fallback,
          }),
          None => Err(e),
        };
      }
    };

    if response.is_cacheable() && self.settings.policy.is_eligible(&request.url) {
      self.cache_runtime(&key, &response);
    }

    Ok(FetchOutcome::Respond {
      response,
      source: ResponseSource::Network,
    })
  }

  /// Store a response fetched while serving a request.
  ///
  /// A newer generation may have activated while the fetch was in flight.
  /// Its activation deleted this store, and the write must not bring it back.
  fn cache_runtime(&self, key: &RequestKey, response: &Response) {
    let name = self.cache_name();
    if self.state() != Lifecycle::Activated {
      debug!("{} is no longer active, not caching {}", name, key.url);
      return;
    }

    match self.storage.put(name, key, response) {
      Ok(true) => debug!("cached {}", key.url),
      Ok(false) => debug!("store {} is gone, not caching {}", name, key.url),
      Err(e) => warn!("failed to cache {}: {}", key.url, e),
    }
  }

  /// Handle a control message.
  ///
  /// `Ok(None)` means the command sends no reply. An `Err` also means no
  /// reply is sent; callers only ever see the missing reply.
  pub async fn handle_message(&self, message: &ControlMessage) -> Result<Option<Reply>> {
    debug!("control message {}", message.name());

    match message {
      ControlMessage::SkipWaiting => {
        self.skip_waiting.store(true, Ordering::SeqCst);
        info!("skip waiting requested for {}", self.cache_name());
        Ok(None)
      }
      ControlMessage::ClearCache => {
        for name in self.storage.keys()? {
          self.storage.delete(&name)?;
        }
        info!("cleared all caches");
        Ok(Some(Reply::Success { success: true }))
      }
      ControlMessage::CacheUrls { urls } => {
        let urls = urls
          .iter()
          .map(|u| {
            self
              .settings
              .origin
              .join(u)
              .map_err(|e| eyre!("Invalid URL {}: {}", u, e))
          })
          .collect::<Result<Vec<_>>>()?;
        let count = self.add_all(&urls).await?;
        info!("cached {} requested urls", count);
        Ok(Some(Reply::Success { success: true }))
      }
      ControlMessage::GetCacheSize => Ok(Some(Reply::Size {
        size: self.cache_size()?,
      })),
      ControlMessage::Unknown(name) => {
        debug!("ignoring unknown control message {}", name);
        Ok(None)
      }
    }
  }

  /// Total body bytes of every entry in every store.
  pub fn cache_size(&self) -> Result<u64> {
    let mut total = 0u64;
    for name in self.storage.keys()? {
      for key in self.storage.entries(&name)? {
        if let Some(entry) = self.storage.match_entry(&name, &key)? {
          total += entry.response.body.len() as u64;
        }
      }
    }
    Ok(total)
  }

  /// Fetch every URL and store all responses in one atomic batch.
  ///
  /// Any fetch error or non-2xx status fails the whole batch before anything
  /// is written.
  async fn add_all(&self, urls: &[Url]) -> Result<usize> {
    let entries = try_join_all(urls.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = self.fetch_network(&request).await?;
      if !response.is_ok() {
        return Err(eyre!("Failed to cache {}: HTTP {}", url, response.status));
      }
      Ok::<_, color_eyre::Report>((RequestKey::from(&request), response))
    }))
    .await?;

    self.storage.put_all(self.cache_name(), &entries)?;
    Ok(entries.len())
  }

  async fn fetch_network(&self, request: &Request) -> Result<Response> {
    match self.settings.fetch_timeout {
      Some(limit) => tokio::time::timeout(limit, self.network.fetch(request))
        .await
        .map_err(|_| eyre!("Fetch of {} timed out after {:?}", request.url, limit))?,
      None => self.network.fetch(request).await,
    }
  }
}
