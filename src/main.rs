use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use edgeward::cache::{CacheStore, MemoryStore, SqliteStore};
use edgeward::config::{Config, ControllerConfig};
use edgeward::controller::{Controller, ControllerEvent, EventOutcome, FetchOutcome, Host};
use edgeward::db::Database;
use edgeward::host::{HeadlessClients, StdoutNotifier};
use edgeward::http::{Method, Request};
use edgeward::lifecycle::LifecycleState;
use edgeward::network::ReqwestNetwork;
use edgeward::queue::{DeferredWriteItem, MemoryQueue, SqliteQueue};
use edgeward::registry::{MemoryRegistrations, Registry, SqliteRegistrations};

#[derive(Parser, Debug)]
#[command(name = "edgeward")]
#[command(about = "An offline-capable edge cache controller")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/edgeward/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Keep caches and queue in memory for this run only
  #[arg(long, global = true)]
  ephemeral: bool,

  /// Log to stderr instead of the log file
  #[arg(long, global = true)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a URL through the controller
  Fetch {
    url: String,
    /// Treat as a page navigation
    #[arg(long, conflicts_with = "image")]
    navigate: bool,
    /// Treat as an image load
    #[arg(long)]
    image: bool,
  },
  /// Install (and if possible activate) the configured version
  Install,
  /// Send a control message, e.g. '{"type":"SKIP_WAITING"}'
  Message { json: String },
  /// Queue a write for replay on the next sync
  Enqueue {
    endpoint: String,
    json: String,
    #[arg(short, long, default_value = "POST")]
    method: String,
  },
  /// Replay the deferred write queue
  Sync,
  /// Deliver a push message, optionally with a JSON payload
  Push { json: Option<String> },
  /// Simulate a click on a notification targeting a URL
  Click { url: String },
  /// List cache namespaces
  Namespaces,
  /// List queued deferred writes
  Queue,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let db_path = config.database_path()?;
  let _log_guard = init_logging(args.log_stderr, &db_path)?;
  let controller_config = config.into_controller_config()?;

  let host = Host {
    network: Arc::new(ReqwestNetwork::new(Arc::clone(&controller_config))?),
    notifier: Arc::new(StdoutNotifier),
    clients: Arc::new(HeadlessClients::new()),
  };

  if args.ephemeral {
    let registry = Registry::new(
      Arc::new(MemoryStore::new()),
      Arc::new(MemoryQueue::new()),
      Arc::new(MemoryRegistrations::new()),
      host,
    );
    run(registry, controller_config, args.command).await
  } else {
    let db = Database::open_at(&db_path)?;
    let registry = Registry::new(
      Arc::new(SqliteStore::new(db.shared())),
      Arc::new(SqliteQueue::new(db.shared())),
      Arc::new(SqliteRegistrations::new(db.shared())),
      host,
    );
    run(registry, controller_config, args.command).await
  }
}

fn init_logging(log_stderr: bool, db_path: &Path) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("EDGEWARD_LOG")
    .unwrap_or_else(|_| EnvFilter::new("edgeward=info"));

  if log_stderr {
    tracing_subscriber::registry()
      .with(fmt::layer().with_writer(std::io::stderr))
      .with(filter)
      .init();
    return Ok(None);
  }

  let log_dir = db_path
    .parent()
    .ok_or_else(|| eyre!("Invalid database path: {}", db_path.display()))?;
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    log_dir,
    "edgeward.log",
  ));
  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .init();

  Ok(Some(guard))
}

/// Bring the configured version up. A CLI run has no open windows, so a
/// waiting version takes over straight away.
async fn boot<S: CacheStore>(
  registry: &Registry<S>,
  config: Arc<ControllerConfig>,
) -> Result<Controller<S>> {
  let controller = registry.register(config).await?;
  if controller.state() == LifecycleState::Installed {
    registry.clients_released().await?;
  }
  Ok(controller)
}

async fn run<S: CacheStore>(
  registry: Registry<S>,
  config: Arc<ControllerConfig>,
  command: Command,
) -> Result<()> {
  // The queue needs no controller, so these work offline before any install
  let command = match command {
    Command::Enqueue {
      endpoint,
      json,
      method,
    } => {
      let payload: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
      let item = DeferredWriteItem::new(endpoint, payload).with_method(Method::parse(&method)?);
      let item = registry.enqueue(item)?;
      println!("{}", item.id);
      return Ok(());
    }
    Command::Queue => {
      for item in registry.pending_writes()? {
        println!(
          "{}  {} {}  attempts={}  queued={}",
          item.id,
          item.method,
          item.endpoint,
          item.attempts,
          item.enqueued_at.to_rfc3339()
        );
      }
      return Ok(());
    }
    other => other,
  };

  let controller = boot(&registry, Arc::clone(&config)).await?;

  match command {
    Command::Fetch {
      url,
      navigate,
      image,
    } => {
      let url = config.resolve(&url)?;
      let request = if navigate {
        Request::navigate(url)
      } else if image {
        Request::image(url)
      } else {
        Request::get(url)
      };

      match controller.dispatch(ControllerEvent::Fetch(request)).finish().await? {
        EventOutcome::Fetch(FetchOutcome::Responded { response, source }) => {
          println!("{} ({:?})", response.status, source);
          println!("{}", response.body_text());
        }
        EventOutcome::Fetch(FetchOutcome::Passthrough(Ok(response))) => {
          println!("{} (passthrough)", response.status);
          println!("{}", response.body_text());
        }
        EventOutcome::Fetch(FetchOutcome::Passthrough(Err(e))) => {
          return Err(eyre!("Request failed: {}", e));
        }
        other => return Err(eyre!("Unexpected outcome: {:?}", other)),
      }
    }
    Command::Install => {
      println!("version {} is {}", controller.version(), controller.state());
      for ns in controller.namespaces()? {
        println!("  {}", ns);
      }
    }
    Command::Message { json } => {
      let outcome = controller
        .dispatch(ControllerEvent::Message(json.into_bytes()))
        .finish()
        .await?;
      println!("{:?}", outcome);
    }
    Command::Sync => {
      let outcome = controller
        .dispatch(ControllerEvent::Sync {
          tag: config.sync_tag.clone(),
        })
        .finish()
        .await?;
      match outcome {
        EventOutcome::Synced(Some(report)) => {
          println!(
            "delivered {}, still queued {}",
            report.delivered.len(),
            report.failed.len()
          );
        }
        other => return Err(eyre!("Sync did not run: {:?}", other)),
      }
    }
    Command::Push { json } => {
      let outcome = controller
        .dispatch(ControllerEvent::Push(json.map(String::into_bytes)))
        .finish()
        .await?;
      if let EventOutcome::Failed(reason) = outcome {
        return Err(eyre!("Push failed: {}", reason));
      }
    }
    Command::Click { url } => {
      let outcome = controller
        .dispatch(ControllerEvent::NotificationClick { target_url: url })
        .finish()
        .await?;
      println!("{:?}", outcome);
    }
    Command::Namespaces => {
      for ns in controller.namespaces()? {
        println!("{}", ns);
      }
    }
    Command::Enqueue { .. } | Command::Queue => {}
  }

  Ok(())
}
