use color_eyre::{eyre::eyre, Result};
use tokio::sync::{mpsc, oneshot};

use crate::gateway::{ControlMessage, Notification, Reply, ResponseSource};
use crate::http::{Request, Response};

/// Which gateway of a registration a control message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
  Active,
  Waiting,
}

/// A response handed back to a page.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  /// `None` when no gateway intercepted the request
  pub source: Option<ResponseSource>,
}

/// Events the host delivers to the gateway
#[derive(Debug)]
pub enum HostEvent {
  /// A page issued a resource request
  Fetch {
    request: Request,
    respond_to: oneshot::Sender<Result<Served>>,
  },
  /// A page posted a control message, optionally with a reply port
  Message {
    message: ControlMessage,
    target: MessageTarget,
    port: Option<oneshot::Sender<Reply>>,
  },
  /// A push message arrived
  Push {
    payload: Option<String>,
    respond_to: oneshot::Sender<Notification>,
  },
  /// The user interacted with a notification
  NotificationClick {
    action: Option<String>,
    notification: Notification,
    respond_to: oneshot::Sender<Option<String>>,
  },
  /// A background sync fired
  Sync {
    tag: String,
    respond_to: oneshot::Sender<bool>,
  },
}

/// Sending side of the host's event queue.
///
/// Every call waits for the event's completion. Dropping all handles lets
/// the host loop finish its pending work and exit.
#[derive(Clone)]
pub struct HostHandle {
  tx: mpsc::UnboundedSender<HostEvent>,
}

impl HostHandle {
  pub(crate) fn new(tx: mpsc::UnboundedSender<HostEvent>) -> Self {
    Self { tx }
  }

  fn send(&self, event: HostEvent) -> Result<()> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Host event loop has stopped"))
  }

  pub async fn fetch(&self, request: Request) -> Result<Served> {
    let (respond_to, rx) = oneshot::channel();
    self.send(HostEvent::Fetch {
      request,
      respond_to,
    })?;
    rx.await
      .map_err(|_| eyre!("Fetch was dropped without a response"))?
  }

  /// Post a control message and wait for its reply.
  ///
  /// `Ok(None)` means the reply port was closed without a reply, which is
  /// what both fire-and-forget commands and failed commands look like.
  pub async fn post_message(
    &self,
    message: ControlMessage,
    target: MessageTarget,
  ) -> Result<Option<Reply>> {
    let (port, rx) = oneshot::channel();
    self.send(HostEvent::Message {
      message,
      target,
      port: Some(port),
    })?;
    Ok(rx.await.ok())
  }

  /// Post a control message without a reply port.
  #[cfg(test)]
  pub fn notify(&self, message: ControlMessage, target: MessageTarget) -> Result<()> {
    self.send(HostEvent::Message {
      message,
      target,
      port: None,
    })
  }

  pub async fn push(&self, payload: Option<String>) -> Result<Notification> {
    let (respond_to, rx) = oneshot::channel();
    self.send(HostEvent::Push {
      payload,
      respond_to,
    })?;
    rx.await
      .map_err(|_| eyre!("Push event was dropped"))
  }

  pub async fn click(
    &self,
    action: Option<String>,
    notification: Notification,
  ) -> Result<Option<String>> {
    let (respond_to, rx) = oneshot::channel();
    self.send(HostEvent::NotificationClick {
      action,
      notification,
      respond_to,
    })?;
    rx.await
      .map_err(|_| eyre!("Notification click was dropped"))
  }

  pub async fn sync(&self, tag: &str) -> Result<bool> {
    let (respond_to, rx) = oneshot::channel();
    self.send(HostEvent::Sync {
      tag: tag.to_string(),
      respond_to,
    })?;
    rx.await.map_err(|_| eyre!("Sync event was dropped"))
  }
}
