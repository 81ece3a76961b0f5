//! Comm-layer boundary: wire codec, sender and receiver.
//!
//! The actual transports (UDP, TCP, ...) live behind the [`Emitter`] and
//! [`Listener`] traits. The crate ships a JSON codec backed by an event
//! type registry plus an in-process loopback channel, which is enough for
//! single-process clusters and tests; production comm modules implement
//! the same traits.
//!
//! Transport failures are logged and the event dropped (at-most-once
//! delivery, no retries on the send path).

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::event::{Event, TypedEvent};
use crate::stream::Stream;

/// Transmits an encoded event toward the node owning `partition`.
#[async_trait]
pub trait Emitter: Send + Sync {
  /// Sends one frame. Errors surface to the caller, which logs and drops.
  async fn send(&self, partition: u32, bytes: Bytes) -> Result<(), Error>;
}

/// Pulls inbound frames for the partitions this node owns.
#[async_trait]
pub trait Listener: Send + Sync {
  /// The next frame, or `None` once the transport has shut down.
  async fn recv(&self) -> Option<Bytes>;
}

/// One event on the wire: target stream, variant tag, payload.
#[derive(Debug, Serialize, Deserialize)]
struct Frame {
  stream: String,
  kind: String,
  payload: serde_json::Value,
}

type EncodeFn = fn(&dyn Event) -> Result<serde_json::Value, Error>;
type DecodeFn = fn(serde_json::Value) -> Result<Arc<dyn Event>, Error>;

/// Maps event variant names to codec functions. Every event type that
/// crosses the wire registers here; decoding restores the event's runtime
/// variant from the frame's `kind` tag.
#[derive(Default)]
pub struct EventTypeRegistry {
  encoders: HashMap<TypeId, EncodeFn>,
  decoders: HashMap<&'static str, DecodeFn>,
}

impl EventTypeRegistry {
  /// Creates an empty registry.
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers an event type for wire transport.
  pub fn register<E>(&mut self) -> &mut Self
  where
    E: TypedEvent + Serialize + DeserializeOwned + 'static,
  {
    fn encode<E: TypedEvent + Serialize + 'static>(
      event: &dyn Event,
    ) -> Result<serde_json::Value, Error> {
      let typed = event
        .as_any()
        .downcast_ref::<E>()
        .ok_or_else(|| Error::Serde(format!("event is not a [{}]", E::static_kind().name())))?;
      serde_json::to_value(typed).map_err(|err| Error::Serde(err.to_string()))
    }

    fn decode<E: TypedEvent + DeserializeOwned + 'static>(
      payload: serde_json::Value,
    ) -> Result<Arc<dyn Event>, Error> {
      let typed: E =
        serde_json::from_value(payload).map_err(|err| Error::Serde(err.to_string()))?;
      Ok(Arc::new(typed))
    }

    self.encoders.insert(TypeId::of::<E>(), encode::<E>);
    self.decoders.insert(E::static_kind().name(), decode::<E>);
    self
  }

  fn encode(&self, event: &dyn Event) -> Result<serde_json::Value, Error> {
    let encode = self
      .encoders
      .get(&event.as_any().type_id())
      .ok_or_else(|| {
        Error::Serde(format!(
          "event type [{}] is not registered for transport",
          event.kind().name()
        ))
      })?;
    encode(event)
  }

  fn decode(&self, kind: &str, payload: serde_json::Value) -> Result<Arc<dyn Event>, Error> {
    let decode = self
      .decoders
      .get(kind)
      .ok_or_else(|| Error::Serde(format!("unknown event kind [{}] on the wire", kind)))?;
    decode(payload)
  }
}

impl std::fmt::Debug for EventTypeRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventTypeRegistry")
      .field("types", &self.decoders.len())
      .finish()
  }
}

/// Round-trip preserving wire codec.
pub trait SerDe: Send + Sync {
  /// Encodes an event bound for `stream`.
  fn encode(&self, stream: &str, event: &dyn Event) -> Result<Bytes, Error>;

  /// Decodes a frame into (stream name, event).
  fn decode(&self, bytes: &[u8]) -> Result<(String, Arc<dyn Event>), Error>;
}

/// JSON codec over an [`EventTypeRegistry`].
#[derive(Debug)]
pub struct JsonSerDe {
  registry: EventTypeRegistry,
}

impl JsonSerDe {
  /// Creates a codec from a populated registry.
  #[must_use]
  pub fn new(registry: EventTypeRegistry) -> Self {
    Self { registry }
  }
}

impl SerDe for JsonSerDe {
  fn encode(&self, stream: &str, event: &dyn Event) -> Result<Bytes, Error> {
    let frame = Frame {
      stream: stream.to_string(),
      kind: event.kind().name().to_string(),
      payload: self.registry.encode(event)?,
    };
    let bytes = serde_json::to_vec(&frame).map_err(|err| Error::Serde(err.to_string()))?;
    Ok(Bytes::from(bytes))
  }

  fn decode(&self, bytes: &[u8]) -> Result<(String, Arc<dyn Event>), Error> {
    let frame: Frame =
      serde_json::from_slice(bytes).map_err(|err| Error::Serde(err.to_string()))?;
    let event = self.registry.decode(&frame.kind, frame.payload)?;
    Ok((frame.stream, event))
  }
}

/// Forwards events whose partition lives on another node.
pub struct Sender {
  emitter: Arc<dyn Emitter>,
  serde: Arc<dyn SerDe>,
}

impl Sender {
  /// Creates a sender over an emitter and a codec.
  pub fn new(emitter: Arc<dyn Emitter>, serde: Arc<dyn SerDe>) -> Arc<Self> {
    Arc::new(Self { emitter, serde })
  }

  /// Encodes and transmits one event. Failures are logged and the event
  /// dropped.
  pub async fn send(&self, stream: &str, partition: u32, event: &dyn Event) {
    let bytes = match self.serde.encode(stream, event) {
      Ok(bytes) => bytes,
      Err(err) => {
        warn!(
          "dropping event [{}] for stream [{}]: {}",
          event.kind().name(),
          stream,
          err
        );
        return;
      }
    };
    if let Err(err) = self.emitter.send(partition, bytes).await {
      warn!(
        "dropping event [{}] for stream [{}] partition {}: {}",
        event.kind().name(),
        stream,
        partition,
        err
      );
    }
  }
}

impl std::fmt::Debug for Sender {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Sender").finish()
  }
}

/// Pushes inbound frames onto the matching local stream.
pub struct Receiver {
  listener: Arc<dyn Listener>,
  serde: Arc<dyn SerDe>,
  streams: RwLock<HashMap<String, Weak<Stream>>>,
  task: StdMutex<Option<JoinHandle<()>>>,
}

impl Receiver {
  /// Creates a receiver over a listener and a codec.
  pub fn new(listener: Arc<dyn Listener>, serde: Arc<dyn SerDe>) -> Arc<Self> {
    Arc::new(Self {
      listener,
      serde,
      streams: RwLock::new(HashMap::new()),
      task: StdMutex::new(None),
    })
  }

  /// Registers a stream as the target for frames carrying its name.
  pub fn register_stream(&self, stream: &Arc<Stream>) {
    self
      .streams
      .write()
      .unwrap_or_else(|poison| poison.into_inner())
      .insert(stream.name().to_string(), Arc::downgrade(stream));
  }

  /// Spawns the receive loop. Decode failures are logged and skipped.
  pub fn start(self: &Arc<Self>) {
    let receiver = Arc::clone(self);
    let mut slot = self
      .task
      .lock()
      .unwrap_or_else(|poison| poison.into_inner());
    if slot.is_some() {
      return;
    }
    *slot = Some(tokio::spawn(async move {
      while let Some(bytes) = receiver.listener.recv().await {
        let (stream_name, event) = match receiver.serde.decode(&bytes) {
          Ok(decoded) => decoded,
          Err(err) => {
            warn!("dropping undecodable frame: {}", err);
            continue;
          }
        };
        let stream = receiver
          .streams
          .read()
          .unwrap_or_else(|poison| poison.into_inner())
          .get(&stream_name)
          .and_then(Weak::upgrade);
        match stream {
          Some(stream) => {
            trace!(
              "inbound [{}] for stream [{}]",
              event.kind().name(),
              stream_name
            );
            stream.inject(event).await;
          }
          None => warn!(
            "dropping inbound event for unknown stream [{}]",
            stream_name
          ),
        }
      }
      debug!("listener shut down, receive loop exiting");
    }));
  }

  /// Stops the receive loop.
  pub fn stop(&self) {
    let handle = self
      .task
      .lock()
      .unwrap_or_else(|poison| poison.into_inner())
      .take();
    if let Some(handle) = handle {
      handle.abort();
    }
  }
}

impl std::fmt::Debug for Receiver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Receiver")
      .field(
        "streams",
        &self
          .streams
          .read()
          .unwrap_or_else(|poison| poison.into_inner())
          .len(),
      )
      .finish()
  }
}

/// In-process transport: an emitter/listener pair over a bounded channel.
/// Partition routing is the caller's concern; every frame sent lands on
/// the paired listener.
pub fn loopback(capacity: usize) -> (Arc<LoopbackEmitter>, Arc<LoopbackListener>) {
  let (tx, rx) = mpsc::channel(capacity.max(1));
  (
    Arc::new(LoopbackEmitter { tx }),
    Arc::new(LoopbackListener {
      rx: AsyncMutex::new(rx),
    }),
  )
}

/// Sending half of [`loopback`].
#[derive(Debug)]
pub struct LoopbackEmitter {
  tx: mpsc::Sender<Bytes>,
}

#[async_trait]
impl Emitter for LoopbackEmitter {
  async fn send(&self, partition: u32, bytes: Bytes) -> Result<(), Error> {
    self
      .tx
      .send(bytes)
      .await
      .map_err(|_| Error::Transport(format!("loopback peer for partition {} is gone", partition)))
  }
}

/// Receiving half of [`loopback`].
#[derive(Debug)]
pub struct LoopbackListener {
  rx: AsyncMutex<mpsc::Receiver<Bytes>>,
}

#[async_trait]
impl Listener for LoopbackListener {
  async fn recv(&self) -> Option<Bytes> {
    self.rx.lock().await.recv().await
  }
}
