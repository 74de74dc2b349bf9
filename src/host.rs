//! Host side of the gateway: registration of generations and the event loop.
//!
//! The host decides when a generation is installed and when it takes over,
//! tracks the pages it controls, and turns queued events into calls on the
//! active (or waiting) gateway.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;
use crate::event::{HostEvent, HostHandle, MessageTarget, Served};
use crate::gateway::{
  click_target, handle_sync, notification_for_push, ControlMessage, FetchOutcome, Gateway,
  GatewaySettings, Lifecycle, NotificationDefaults, Reply,
};
use crate::http::{Network, Request};

type SharedGateway<S, N> = Arc<Gateway<S, N>>;

/// The active and waiting generations for one scope.
pub struct Registration<S: CacheStorage, N: Network> {
  active: Option<SharedGateway<S, N>>,
  waiting: Option<SharedGateway<S, N>>,
  /// Pages currently controlled by the active generation
  clients: usize,
}

impl<S: CacheStorage, N: Network> Registration<S, N> {
  pub fn new() -> Self {
    Self {
      active: None,
      waiting: None,
      clients: 0,
    }
  }

  pub fn active(&self) -> Option<SharedGateway<S, N>> {
    self.active.clone()
  }

  pub fn waiting(&self) -> Option<SharedGateway<S, N>> {
    self.waiting.clone()
  }

  #[cfg(test)]
  pub fn clients(&self) -> usize {
    self.clients
  }

  /// Park an installed generation until it may take over.
  fn set_waiting(&mut self, gateway: SharedGateway<S, N>) {
    if let Some(previous) = self.waiting.replace(gateway) {
      if let Err(e) = previous.retire() {
        warn!("failed to retire waiting {}: {}", previous.cache_name(), e);
      }
    }
  }

  /// Activate the waiting generation if nothing holds the current one.
  ///
  /// Takeover happens when there is no active generation, no controlled
  /// pages, or the waiting generation received `SKIP_WAITING`.
  pub fn try_promote(&mut self) -> Result<bool> {
    let Some(waiting) = self.waiting.clone() else {
      return Ok(false);
    };

    let may_take_over =
      self.active.is_none() || self.clients == 0 || waiting.skip_waiting_requested();
    if !may_take_over {
      debug!(
        "{} waiting for {} clients to release",
        waiting.cache_name(),
        self.clients
      );
      return Ok(false);
    }

    waiting.activate()?;
    self.waiting = None;
    if let Some(previous) = self.active.replace(waiting) {
      if let Err(e) = previous.retire() {
        warn!("failed to retire {}: {}", previous.cache_name(), e);
      }
    }
    Ok(true)
  }
}

impl<S: CacheStorage, N: Network> Default for Registration<S, N> {
  fn default() -> Self {
    Self::new()
  }
}

/// Owns the registration and dispatches host events to it.
pub struct Host<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  registration: Arc<RwLock<Registration<S, N>>>,
  notification_defaults: NotificationDefaults,
}

impl<S: CacheStorage, N: Network> Clone for Host<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      registration: Arc::clone(&self.registration),
      notification_defaults: self.notification_defaults.clone(),
    }
  }
}

impl<S, N> Host<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  pub fn new(
    storage: Arc<S>,
    network: Arc<N>,
    notification_defaults: NotificationDefaults,
  ) -> Self {
    Self {
      storage,
      network,
      registration: Arc::new(RwLock::new(Registration::new())),
      notification_defaults,
    }
  }

  #[cfg(test)]
  pub fn registration(&self) -> &Arc<RwLock<Registration<S, N>>> {
    &self.registration
  }

  /// Install the generation described by `settings` and activate it when allowed.
  ///
  /// Returns the lifecycle state the new generation ended in. Installing the
  /// generation that is already active is a no-op. Traffic keeps flowing to
  /// the active generation while the candidate installs.
  pub async fn update(&self, settings: GatewaySettings) -> Result<Lifecycle> {
    {
      let registration = self.registration.read().await;
      if let Some(active) = registration.active() {
        if active.cache_name() == settings.cache_name {
          debug!("{} is already active", settings.cache_name);
          return Ok(Lifecycle::Activated);
        }
      }
    }

    let candidate = Arc::new(Gateway::new(
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
      settings,
    ));
    if !candidate.resume()? {
      candidate.install().await?;
    }

    let mut registration = self.registration.write().await;
    registration.set_waiting(Arc::clone(&candidate));
    registration.try_promote()?;
    Ok(candidate.state())
  }

  /// A page came under control of the active generation.
  ///
  /// The CLI runs one command per process and never holds a page open, so
  /// only tests drive client tracking.
  #[cfg(test)]
  pub async fn claim_client(&self) {
    self.registration.write().await.clients += 1;
  }

  /// A page went away. The last release lets a waiting generation take over.
  #[cfg(test)]
  pub async fn release_client(&self) -> Result<bool> {
    let mut registration = self.registration.write().await;
    registration.clients = registration.clients.saturating_sub(1);
    if registration.clients == 0 {
      return registration.try_promote();
    }
    Ok(false)
  }

  /// Start the event loop. It runs until every handle is dropped and all
  /// pending events have completed.
  pub fn start(&self) -> (HostHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let host = self.clone();
    let runner = tokio::spawn(async move { host.run(rx).await });
    (HostHandle::new(tx), runner)
  }

  async fn run(self, mut rx: mpsc::UnboundedReceiver<HostEvent>) {
    let mut pending = JoinSet::new();

    loop {
      tokio::select! {
        event = rx.recv() => match event {
          Some(event) => {
            let host = self.clone();
            pending.spawn(async move { host.dispatch(event).await });
          }
          None => break,
        },
        Some(done) = pending.join_next(), if !pending.is_empty() => {
          if let Err(e) = done {
            warn!("host task failed: {}", e);
          }
        }
      }
    }

    // Nothing is idle until every started event has finished
    while let Some(done) = pending.join_next().await {
      if let Err(e) = done {
        warn!("host task failed: {}", e);
      }
    }
    debug!("host event loop idle");
  }

  async fn dispatch(&self, event: HostEvent) {
    match event {
      HostEvent::Fetch {
        request,
        respond_to,
      } => {
        let _ = respond_to.send(self.serve(request).await);
      }
      HostEvent::Message {
        message,
        target,
        port,
      } => self.deliver(message, target, port).await,
      HostEvent::Push {
        payload,
        respond_to,
      } => {
        let notification =
          notification_for_push(payload.as_deref(), &self.notification_defaults);
        info!("showing notification {:?}", notification.title);
        let _ = respond_to.send(notification);
      }
      HostEvent::NotificationClick {
        action,
        notification,
        respond_to,
      } => {
        let target = click_target(action.as_deref(), &notification);
        if let Some(url) = &target {
          info!("opening {}", url);
        }
        let _ = respond_to.send(target);
      }
      HostEvent::Sync { tag, respond_to } => {
        let _ = respond_to.send(handle_sync(&tag));
      }
    }
  }

  async fn serve(&self, request: Request) -> Result<Served> {
    let gateway = self.registration.read().await.active();

    if let Some(gateway) = gateway {
      if let FetchOutcome::Respond { response, source } = gateway.handle_fetch(&request).await? {
        return Ok(Served {
          response,
          source: Some(source),
        });
      }
    }

    let response = self.network.fetch(&request).await?;
    Ok(Served {
      response,
      source: None,
    })
  }

  async fn deliver(
    &self,
    message: ControlMessage,
    target: MessageTarget,
    port: Option<oneshot::Sender<Reply>>,
  ) {
    let gateway = {
      let registration = self.registration.read().await;
      match target {
        MessageTarget::Active => registration.active(),
        MessageTarget::Waiting => registration.waiting(),
      }
    };
    let Some(gateway) = gateway else {
      warn!("no {:?} gateway for {}", target, message.name());
      return;
    };

    match gateway.handle_message(&message).await {
      Ok(Some(reply)) => {
        if let Some(port) = port {
          let _ = port.send(reply);
        }
      }
      Ok(None) => {}
      Err(e) => warn!("{} failed: {}", message.name(), e),
    }

    if message == ControlMessage::SkipWaiting {
      if let Err(e) = self.registration.write().await.try_promote() {
        warn!("takeover after skip waiting failed: {}", e);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::gateway::ResponseSource;
  use crate::testing::{ok, portal_network, settings, url, FakeNetwork};

  fn host(
    storage: &Arc<MemoryStorage>,
    network: &Arc<FakeNetwork>,
  ) -> Host<MemoryStorage, FakeNetwork> {
    Host::new(
      Arc::clone(storage),
      Arc::clone(network),
      NotificationDefaults::default(),
    )
  }

  #[tokio::test]
  async fn test_first_generation_activates_immediately() {
    let storage = Arc::new(MemoryStorage::new());
    let network = portal_network();
    let host = host(&storage, &network);

    assert_eq!(host.update(settings("v1")).await.unwrap(), Lifecycle::Activated);
    assert_eq!(host.update(settings("v1")).await.unwrap(), Lifecycle::Activated);
    assert_eq!(storage.keys().unwrap(), vec!["static-nav-v1"]);
  }

  #[tokio::test]
  async fn test_new_generation_waits_for_clients() {
    let storage = Arc::new(MemoryStorage::new());
    let network = portal_network();
    let host = host(&storage, &network);
    host.update(settings("v1")).await.unwrap();
    host.claim_client().await;

    assert_eq!(host.update(settings("v2")).await.unwrap(), Lifecycle::Installed);
    {
      let registration = host.registration().read().await;
      assert_eq!(registration.active().unwrap().cache_name(), "static-nav-v1");
      assert_eq!(registration.waiting().unwrap().cache_name(), "static-nav-v2");
    }
    // Both generations exist while v2 waits
    assert_eq!(storage.keys().unwrap().len(), 2);

    assert!(host.release_client().await.unwrap());
    let registration = host.registration().read().await;
    assert_eq!(registration.active().unwrap().cache_name(), "static-nav-v2");
    assert!(registration.waiting().is_none());
    assert_eq!(storage.keys().unwrap(), vec!["static-nav-v2"]);
  }

  #[tokio::test]
  async fn test_skip_waiting_message_forces_takeover() {
    let storage = Arc::new(MemoryStorage::new());
    let network = portal_network();
    let host = host(&storage, &network);
    host.update(settings("v1")).await.unwrap();
    host.claim_client().await;
    host.update(settings("v2")).await.unwrap();
    let old = host.registration().read().await.active().unwrap();

    let (handle, runner) = host.start();
    let reply = handle
      .post_message(ControlMessage::SkipWaiting, MessageTarget::Waiting)
      .await
      .unwrap();
    assert_eq!(reply, None);
    drop(handle);
    runner.await.unwrap();

    let registration = host.registration().read().await;
    assert_eq!(registration.active().unwrap().cache_name(), "static-nav-v2");
    assert_eq!(registration.clients(), 1);
    assert_eq!(old.state(), Lifecycle::Redundant);
  }

  #[tokio::test]
  async fn test_failed_update_keeps_current_generation() {
    let storage = Arc::new(MemoryStorage::new());
    let network = portal_network();
    let host = host(&storage, &network);
    host.update(settings("v1")).await.unwrap();

    network.fail("/index.html");
    assert!(host.update(settings("v2")).await.is_err());

    let registration = host.registration().read().await;
    assert_eq!(registration.active().unwrap().cache_name(), "static-nav-v1");
    assert!(registration.waiting().is_none());
    assert_eq!(storage.keys().unwrap(), vec!["static-nav-v1"]);
  }

  #[tokio::test]
  async fn test_fetch_through_event_loop() {
    let storage = Arc::new(MemoryStorage::new());
    let network = portal_network();
    network.serve("/img/star.svg", ok("<svg/>"));
    let host = host(&storage, &network);
    let (handle, runner) = host.start();

    // Without an active generation requests go straight to the network
    let served = handle.fetch(Request::get(url("/img/star.svg"))).await.unwrap();
    assert_eq!(served.source, None);

    host.update(settings("v1")).await.unwrap();
    let served = handle.fetch(Request::get(url("/img/star.svg"))).await.unwrap();
    assert_eq!(served.source, Some(ResponseSource::Network));
    let served = handle.fetch(Request::get(url("/img/star.svg"))).await.unwrap();
    assert_eq!(served.source, Some(ResponseSource::Cache));
    assert_eq!(served.response.body, b"<svg/>");

    drop(handle);
    runner.await.unwrap();
  }

  #[tokio::test]
  async fn test_reply_ports() {
    let storage = Arc::new(MemoryStorage::new());
    let network = portal_network();
    let host = host(&storage, &network);
    host.update(settings("v1")).await.unwrap();
    let (handle, runner) = host.start();

    let size = handle
      .post_message(ControlMessage::GetCacheSize, MessageTarget::Active)
      .await
      .unwrap();
    let expected = ("<html>root</html>".len()
      + "<html>index</html>".len()
      + "body{}".len()
      + "init();".len()) as u64;
    assert_eq!(size, Some(Reply::Size { size: expected }));

    // Failed command: the port closes without a reply
    storage.fail_deletes(true);
    let cleared = handle
      .post_message(ControlMessage::ClearCache, MessageTarget::Active)
      .await
      .unwrap();
    assert_eq!(cleared, None);

    // No waiting gateway to address
    let none = handle
      .post_message(ControlMessage::GetCacheSize, MessageTarget::Waiting)
      .await
      .unwrap();
    assert_eq!(none, None);

    handle
      .notify(ControlMessage::Unknown("PING".into()), MessageTarget::Active)
      .unwrap();
    drop(handle);
    runner.await.unwrap();
  }

  #[tokio::test]
  async fn test_push_click_and_sync() {
    let storage = Arc::new(MemoryStorage::new());
    let network = portal_network();
    let host = host(&storage, &network);
    let (handle, runner) = host.start();

    let notification = handle
      .push(Some(r#"{"title":"Updated","url":"/editor.html"}"#.into()))
      .await
      .unwrap();
    assert_eq!(notification.title, "Updated");

    let opened = handle
      .click(Some("open".into()), notification.clone())
      .await
      .unwrap();
    assert_eq!(opened, Some("/editor.html".to_string()));
    assert_eq!(handle.click(Some("close".into()), notification).await.unwrap(), None);

    assert!(handle.sync("sync-bookmarks").await.unwrap());

    drop(handle);
    runner.await.unwrap();
  }
}
