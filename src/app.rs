//! Application container and lifecycle.
//!
//! An [`App`] owns a set of PE prototypes, streams and exported event
//! sources. User code lives in an [`AppModule`]: `on_init` constructs
//! prototypes and streams, `on_start` runs once the node is wired, and
//! `on_close` releases whatever the app holds beyond the runtime's own
//! resources. Closing an app tears down its prototypes first (cancelling
//! timers, running `on_remove` per instance), then its streams, and is
//! idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::comm::{Receiver, Sender};
use crate::error::BoxError;
use crate::pe::{EventTarget, ProcessingElement, Prototype};
use crate::stream::{EventSource, Stream, StreamBuilder};

/// User-supplied application logic, driven by the
/// [`Server`](crate::server::Server): init, start, close.
#[async_trait]
pub trait AppModule: Send {
  /// Constructs the app's prototypes, streams and event sources.
  async fn on_init(&mut self, app: &mut App) -> Result<(), BoxError>;

  /// Runs after every app on the node finished init.
  async fn on_start(&mut self, app: &mut App) -> Result<(), BoxError> {
    let _ = app;
    Ok(())
  }

  /// Runs before the app's resources are torn down.
  async fn on_close(&mut self, app: &mut App) -> Result<(), BoxError> {
    let _ = app;
    Ok(())
  }
}

/// Root container for one application on this node.
pub struct App {
  name: String,
  prototypes: Vec<Arc<dyn EventTarget>>,
  streams: Vec<Arc<Stream>>,
  event_sources: Vec<Arc<EventSource>>,
  imports: Vec<(String, Arc<Stream>)>,
  sender: Option<Arc<Sender>>,
  receiver: Option<Arc<Receiver>>,
  closed: AtomicBool,
}

impl App {
  /// Creates an empty app container.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      prototypes: Vec::new(),
      streams: Vec::new(),
      event_sources: Vec::new(),
      imports: Vec::new(),
      sender: None,
      receiver: None,
      closed: AtomicBool::new(false),
    }
  }

  /// App name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Binds the comm layer. Called by the server before `on_init`.
  pub fn set_comm(&mut self, sender: Arc<Sender>, receiver: Arc<Receiver>) {
    self.sender = Some(sender);
    self.receiver = Some(receiver);
  }

  /// The bound comm-layer sender, if any.
  pub fn sender(&self) -> Option<Arc<Sender>> {
    self.sender.clone()
  }

  /// Registers a prototype so the app tears it down on close.
  pub fn add_prototype<P: ProcessingElement>(&mut self, prototype: &Prototype<P>) {
    self.prototypes.push(prototype.target());
  }

  /// Finishes a stream builder: binds the app's sender (unless one was
  /// set explicitly), spawns the stream, and registers it with the
  /// receiver so inbound frames find it.
  pub fn create_stream(&mut self, mut builder: StreamBuilder) -> Arc<Stream> {
    if !builder.has_sender() {
      if let Some(sender) = &self.sender {
        builder = builder.sender(Arc::clone(sender));
      }
    }
    let stream = builder.spawn();
    if let Some(receiver) = &self.receiver {
      receiver.register_stream(&stream);
    }
    self.streams.push(Arc::clone(&stream));
    stream
  }

  /// Creates and registers an exported event source.
  pub fn create_event_source(&mut self, name: impl Into<String>) -> Arc<EventSource> {
    let source = EventSource::new(name);
    self.event_sources.push(Arc::clone(&source));
    source
  }

  /// Declares that `stream` consumes the event source exported elsewhere
  /// under `source_name`. The server resolves this after all apps start.
  pub fn import(&mut self, source_name: impl Into<String>, stream: Arc<Stream>) {
    self.imports.push((source_name.into(), stream));
  }

  /// Local streams, for inter-app wiring.
  pub fn streams(&self) -> &[Arc<Stream>] {
    &self.streams
  }

  /// Exported event sources.
  pub fn event_sources(&self) -> &[Arc<EventSource>] {
    &self.event_sources
  }

  /// The exported event source with the given name, if any.
  pub fn event_source(&self, name: &str) -> Option<Arc<EventSource>> {
    self
      .event_sources
      .iter()
      .find(|source| source.name() == name)
      .cloned()
  }

  /// Declared event-source dependencies.
  pub fn imports(&self) -> &[(String, Arc<Stream>)] {
    &self.imports
  }

  /// Whether the app has been closed.
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Tears down all prototypes, then all streams. Idempotent: the second
  /// call is a no-op and `on_remove` runs exactly once per instance.
  pub async fn close(&self) {
    if self.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    info!("closing app [{}]", self.name);
    for prototype in &self.prototypes {
      prototype.shutdown().await;
    }
    for source in &self.event_sources {
      source.close();
    }
    for stream in &self.streams {
      stream.close().await;
    }
    info!("app [{}] closed", self.name);
  }
}

impl std::fmt::Debug for App {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("App")
      .field("name", &self.name)
      .field("prototypes", &self.prototypes.len())
      .field("streams", &self.streams.len())
      .field("event_sources", &self.event_sources.len())
      .field("closed", &self.is_closed())
      .finish()
  }
}
