mod cache;
mod config;
mod event;
mod gateway;
mod host;
mod http;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::cache::{CacheStorage, SqliteStorage};
use crate::config::Config;
use crate::event::{HostHandle, MessageTarget};
use crate::gateway::{ControlMessage, GatewaySettings, Lifecycle, Reply};
use crate::host::Host;
use crate::http::{HttpNetwork, Request};

#[derive(Parser, Debug)]
#[command(name = "navgate")]
#[command(about = "Offline cache gateway for the static navigation portal")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./navgate.yaml or $XDG_CONFIG_HOME/navgate/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Keep the cache in memory for this run only
  #[arg(long, global = true)]
  ephemeral: bool,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, action = clap::ArgAction::Count, global = true)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version and activate it
  Install,
  /// Request resources through the gateway
  Fetch {
    /// Paths (resolved against the origin) or absolute URLs
    #[arg(required = true)]
    urls: Vec<String>,
  },
  /// Post a raw control message, e.g. '{"type":"GET_CACHE_SIZE"}'
  Message {
    json: String,
    /// Address the waiting generation instead of the active one
    #[arg(long)]
    waiting: bool,
  },
  /// Print the total size of all cached response bodies
  Size,
  /// Delete every cache store
  Clear,
  /// Fetch and cache the given resources in the current generation
  CacheUrls {
    #[arg(required = true)]
    urls: Vec<String>,
  },
  /// List cache stores, how many entries each holds and when it was last written
  List,
  /// Show the notification a push payload would produce
  Push {
    /// JSON payload with optional title, body and url
    payload: Option<String>,
    /// Simulate clicking this notification action
    #[arg(long)]
    click: Option<String>,
  },
  /// Run a background sync tag
  Sync { tag: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.verbose, args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;

  let storage = if args.ephemeral {
    SqliteStorage::open_in_memory()?
  } else {
    SqliteStorage::open(config.cache_path.as_deref())?
  };
  let storage = Arc::new(storage);
  let network = Arc::new(HttpNetwork::new(config.origin_url()?)?);
  let host = Host::new(Arc::clone(&storage), network, config.notification.clone());

  if let Command::List = args.command {
    return list_stores(storage.as_ref());
  }

  let state = host.update(GatewaySettings::from_config(&config)?).await?;
  let (handle, runner) = host.start();

  let result = run_command(&args.command, &config, &handle, state).await;

  drop(handle);
  runner
    .await
    .map_err(|e| eyre!("Host event loop failed: {}", e))?;
  result
}

async fn run_command(
  command: &Command,
  config: &Config,
  handle: &HostHandle,
  state: Lifecycle,
) -> Result<()> {
  match command {
    Command::Install => {
      println!("{}: {}", config.cache_name(), state);
    }
    Command::Fetch { urls } => {
      for raw in urls {
        let url = config.resolve(raw)?;
        let served = handle.fetch(Request::get(url.clone())).await?;
        let source = served
          .source
          .map(|s| format!("{:?}", s).to_lowercase())
          .unwrap_or_else(|| "passthrough".to_string());
        println!(
          "{} {:<11} {:>9} {}",
          served.response.status,
          source,
          served.response.body.len(),
          url
        );
      }
    }
    Command::Message { json, waiting } => {
      let target = if *waiting {
        MessageTarget::Waiting
      } else {
        MessageTarget::Active
      };
      let message = ControlMessage::from_json(json)?;
      print_reply(handle.post_message(message, target).await?);
    }
    Command::Size => {
      let reply = handle
        .post_message(ControlMessage::GetCacheSize, MessageTarget::Active)
        .await?;
      print_reply(reply);
    }
    Command::Clear => {
      let reply = handle
        .post_message(ControlMessage::ClearCache, MessageTarget::Active)
        .await?;
      print_reply(reply);
    }
    Command::CacheUrls { urls } => {
      let message = ControlMessage::CacheUrls { urls: urls.clone() };
      print_reply(handle.post_message(message, MessageTarget::Active).await?);
    }
    Command::Push { payload, click } => {
      let notification = handle.push(payload.clone()).await?;
      println!("{}", serde_json::to_string_pretty(&notification)?);
      if let Some(action) = click {
        match handle.click(Some(action.clone()), notification).await? {
          Some(url) => println!("open {}", url),
          None => println!("closed"),
        }
      }
    }
    Command::Sync { tag } => {
      let handled = handle.sync(tag).await?;
      println!("{}: {}", tag, if handled { "synced" } else { "ignored" });
    }
    Command::List => {}
  }

  Ok(())
}

fn print_reply(reply: Option<Reply>) {
  match reply {
    Some(reply) => println!("{}", reply.to_json()),
    None => println!("no reply"),
  }
}

fn list_stores(storage: &SqliteStorage) -> Result<()> {
  for name in storage.keys()? {
    let count = storage.entries(&name)?.len();
    match storage.last_written(&name)? {
      Some(at) => println!("{} {} {}", name, count, at.format("%Y-%m-%d %H:%M:%S")),
      None => println!("{} {}", name, count),
    }
  }
  Ok(())
}

/// Set up tracing. RUST_LOG wins over `-v`.
fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
    0 => EnvFilter::new("navgate=warn"),
    1 => EnvFilter::new("navgate=info"),
    _ => EnvFilter::new("navgate=debug"),
  });

  let Some(path) = log_file else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .with_target(false)
      .init();
    return Ok(None);
  };

  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
  let dir = match path.parent() {
    Some(p) if !p.as_os_str().is_empty() => p,
    _ => Path::new("."),
  };
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::never(dir, file_name);
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}
