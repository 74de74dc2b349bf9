//! Scripted network and fixtures shared by unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use url::Url;

use crate::cache::MemoryStorage;
use crate::gateway::{CachePolicy, Gateway, GatewaySettings};
use crate::http::{Network, Request, Response, ResponseKind};

pub const ORIGIN: &str = "https://nav.example";

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn ok(body: &str) -> Response {
  status(200, body)
}

pub fn status(code: u16, body: &str) -> Response {
  Response {
    url: String::new(),
    status: code,
    status_text: String::new(),
    headers: Vec::new(),
    body: body.as_bytes().to_vec(),
    kind: ResponseKind::Basic,
  }
}

enum Route {
  Respond(Response),
  Fail,
  Hang,
  Gated(Response, Arc<Notify>),
}

/// Network whose answers are scripted per URL. Unknown URLs get a 404.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Route>>,
  calls: AtomicUsize,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn serve(&self, path: &str, response: Response) {
    self.route(path, Route::Respond(response));
  }

  /// Make fetches of `path` fail as if the host were unreachable.
  pub fn fail(&self, path: &str) {
    self.route(path, Route::Fail);
  }

  /// Make fetches of `path` never complete.
  pub fn hang(&self, path: &str) {
    self.route(path, Route::Hang);
  }

  /// Answer `path` with `response` only after the returned gate is notified.
  pub fn gate(&self, path: &str, response: Response) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    self.route(path, Route::Gated(response, Arc::clone(&gate)));
    gate
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  fn route(&self, path: &str, route: Route) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url(path).to_string(), route);
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    let (outcome, gate) = {
      let routes = self.routes.lock().unwrap();
      match routes.get(request.url.as_str()) {
        Some(Route::Respond(resp)) => (Some(Ok(resp.clone())), None),
        Some(Route::Fail) => (Some(Err(eyre!("network unreachable: {}", request.url))), None),
        Some(Route::Hang) => (None, None),
        Some(Route::Gated(resp, gate)) => (Some(Ok(resp.clone())), Some(Arc::clone(gate))),
        None => (Some(Ok(status(404, "not found"))), None),
      }
    };

    if let Some(gate) = gate {
      gate.notified().await;
    }
    match outcome {
      Some(result) => result,
      None => std::future::pending().await,
    }
  }
}

pub const MANIFEST: &[&str] = &["/", "/index.html", "/css/style.css", "/js/app.js"];

/// Network that serves every manifest entry of [`MANIFEST`].
pub fn portal_network() -> Arc<FakeNetwork> {
  let network = FakeNetwork::new();
  network.serve("/", ok("<html>root</html>"));
  network.serve("/index.html", ok("<html>index</html>"));
  network.serve("/css/style.css", ok("body{}"));
  network.serve("/js/app.js", ok("init();"));
  Arc::new(network)
}

pub fn settings(version: &str) -> GatewaySettings {
  GatewaySettings {
    cache_name: format!("static-nav-{}", version),
    origin: url("/"),
    manifest: MANIFEST.iter().map(|p| url(p)).collect(),
    fallback: url("/index.html"),
    policy: CachePolicy::new(&[
      r"\.(?:png|jpg|jpeg|svg|gif|webp)$",
      r"\.(?:woff|woff2|ttf|eot)$",
    ])
    .unwrap(),
    fetch_timeout: Some(Duration::from_millis(200)),
  }
}

pub type TestGateway = Gateway<MemoryStorage, FakeNetwork>;

pub fn gateway(
  storage: &Arc<MemoryStorage>,
  network: &Arc<FakeNetwork>,
  version: &str,
) -> TestGateway {
  Gateway::new(Arc::clone(storage), Arc::clone(network), settings(version))
}
