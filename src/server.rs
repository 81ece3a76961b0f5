//! Node server: configuration, comm wiring, app lifecycle and
//! inter-app stream subscriptions.
//!
//! The original system ships applications as archives scanned from a
//! directory and loads each in its own class-loading scope; that
//! mechanism has no Rust equivalent, so the packaging seam here is a
//! registered factory per app (the analog of the archive's entry-point
//! manifest attribute). Everything else follows the same shape: load
//! configuration, initialize logging, instantiate the configured comm
//! module, build every app, run init then start, then resolve declared
//! event-source subscriptions between apps. A factory that fails skips
//! that app only; configuration and comm-binding failures are fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::{App, AppModule};
use crate::comm::{loopback, Emitter, EventTypeRegistry, JsonSerDe, Listener, Receiver, Sender};
use crate::error::Error;

fn default_comm_module() -> String {
  "loopback".to_string()
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_apps_dir() -> PathBuf {
  PathBuf::from("apps")
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
  /// Name of the comm-layer module to instantiate.
  #[serde(default = "default_comm_module")]
  pub comm_module: String,
  /// Log verbosity, in `tracing` env-filter syntax.
  #[serde(default = "default_log_level")]
  pub log_level: String,
  /// Directory applications are deployed to.
  #[serde(default = "default_apps_dir")]
  pub apps_dir: PathBuf,
}

impl Default for NodeConfig {
  fn default() -> Self {
    Self {
      comm_module: default_comm_module(),
      log_level: default_log_level(),
      apps_dir: default_apps_dir(),
    }
  }
}

impl NodeConfig {
  /// Loads the configuration from a JSON file. Missing or malformed
  /// configuration is fatal at startup.
  pub fn from_file(path: &Path) -> Result<Self, Error> {
    let raw = std::fs::read_to_string(path)
      .map_err(|err| Error::Config(format!("cannot read [{}]: {}", path.display(), err)))?;
    serde_json::from_str(&raw)
      .map_err(|err| Error::Config(format!("cannot parse [{}]: {}", path.display(), err)))
  }
}

/// Builds an emitter/listener pair for one comm module.
pub type CommFactory = Box<dyn Fn() -> (Arc<dyn Emitter>, Arc<dyn Listener>) + Send>;

/// Builds one application; the analog of the archive's entry-point class.
pub type AppFactory = Box<dyn Fn() -> Result<Box<dyn AppModule>, Error> + Send>;

/// Coordinates activities on one cluster node: comm layer, application
/// lifecycle, and event-source wiring between apps.
pub struct Server {
  config: NodeConfig,
  registry: Option<EventTypeRegistry>,
  comm_modules: HashMap<String, CommFactory>,
  factories: Vec<(String, AppFactory)>,
  apps: Vec<(Box<dyn AppModule>, App)>,
  receiver: Option<Arc<Receiver>>,
  started: bool,
}

impl Server {
  /// Creates a server from its configuration and the registry of event
  /// types that cross the wire. The in-process `loopback` comm module is
  /// pre-registered.
  pub fn new(config: NodeConfig, registry: EventTypeRegistry) -> Self {
    let mut server = Self {
      config,
      registry: Some(registry),
      comm_modules: HashMap::new(),
      factories: Vec::new(),
      apps: Vec::new(),
      receiver: None,
      started: false,
    };
    server.register_comm_module("loopback", Box::new(|| {
      let (emitter, listener) = loopback(1024);
      (emitter as Arc<dyn Emitter>, listener as Arc<dyn Listener>)
    }));
    server
  }

  /// Registers a comm-layer module under a name referencable from the
  /// configuration.
  pub fn register_comm_module(&mut self, name: impl Into<String>, factory: CommFactory) {
    self.comm_modules.insert(name.into(), factory);
  }

  /// Registers an application factory under the app's name.
  pub fn register_app(&mut self, name: impl Into<String>, factory: AppFactory) {
    self.factories.push((name.into(), factory));
  }

  /// The running apps.
  pub fn apps(&self) -> impl Iterator<Item = &App> {
    self.apps.iter().map(|(_, app)| app)
  }

  /// Initializes logging from the configured level. Safe to call when a
  /// subscriber is already installed.
  pub fn init_logging(&self) {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::new(self.config.log_level.clone()))
      .try_init();
  }

  /// Wires the comm layer, builds and initializes every registered app,
  /// starts them, then resolves event-source subscriptions.
  pub async fn start(&mut self) -> Result<(), Error> {
    if self.started {
      return Ok(());
    }
    self.started = true;
    self.init_logging();
    info!(
      "node starting: comm module [{}], apps dir [{}], {} registered app(s)",
      self.config.comm_module,
      self.config.apps_dir.display(),
      self.factories.len()
    );

    let comm = self
      .comm_modules
      .get(&self.config.comm_module)
      .ok_or_else(|| {
        Error::Config(format!(
          "unknown comm module [{}]",
          self.config.comm_module
        ))
      })?;
    let (emitter, listener) = comm();
    let registry = self
      .registry
      .take()
      .ok_or_else(|| Error::Config("server already consumed its event registry".into()))?;
    let serde: Arc<dyn crate::comm::SerDe> = Arc::new(JsonSerDe::new(registry));
    let sender = Sender::new(emitter, Arc::clone(&serde));
    let receiver = Receiver::new(listener, serde);
    receiver.start();
    self.receiver = Some(Arc::clone(&receiver));

    // Build and init each app; a failing app is skipped, the rest start.
    for (name, factory) in self.factories.drain(..) {
      info!("Loading app: {}", name);
      let mut module = match factory() {
        Ok(module) => module,
        Err(err) => {
          warn!(
            "{}",
            Error::Load {
              name: name.clone(),
              reason: err.to_string()
            }
          );
          continue;
        }
      };
      let mut app = App::new(name.clone());
      app.set_comm(Arc::clone(&sender), Arc::clone(&receiver));
      if let Err(err) = module.on_init(&mut app).await {
        warn!(
          "{}",
          Error::Load {
            name: name.clone(),
            reason: err.to_string()
          }
        );
        app.close().await;
        continue;
      }
      self.apps.push((module, app));
    }

    for (module, app) in &mut self.apps {
      info!("Starting app {}", app.name());
      if let Err(err) = module.on_start(app).await {
        warn!("app [{}] failed to start: {}", app.name(), err);
      }
    }

    self.wire_event_sources();
    info!("Completed applications startup.");
    Ok(())
  }

  /// Subscribes every declared import to the matching exported event
  /// source, wherever on this node it lives.
  fn wire_event_sources(&self) {
    let sources: Vec<Arc<crate::stream::EventSource>> = self
      .apps
      .iter()
      .flat_map(|(_, app)| app.event_sources().iter().cloned())
      .collect();

    for (_, app) in &self.apps {
      for (source_name, stream) in app.imports() {
        match sources.iter().find(|source| source.name() == source_name) {
          Some(source) => source.subscribe(Arc::clone(stream)),
          None => warn!(
            "app [{}]: no exported event source named [{}]",
            app.name(),
            source_name
          ),
        }
      }
    }
  }

  /// Closes every app (idempotently) and stops the receive loop.
  pub async fn close(&mut self) {
    for (module, app) in &mut self.apps {
      if let Err(err) = module.on_close(app).await {
        warn!("app [{}] on_close failed: {}", app.name(), err);
      }
      app.close().await;
    }
    if let Some(receiver) = self.receiver.take() {
      receiver.stop();
    }
    info!("node shut down");
  }
}

impl std::fmt::Debug for Server {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Server")
      .field("config", &self.config)
      .field("apps", &self.apps.len())
      .field("started", &self.started)
      .finish()
  }
}
