//! Streams: named routed queues from producers to subscribed PE
//! prototypes.
//!
//! `put` extracts the event's key, hashes it to a partition, and either
//! enqueues the event on the stream's bounded local queue (a worker task
//! fans it out to every subscriber in arrival order) or hands it to the
//! comm-layer [`Sender`](crate::comm::Sender) when the partition lives on
//! another node. Subscribers are held weakly so a closed stream cannot
//! resurrect a removed prototype.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use crate::comm::Sender;
use crate::error::Error;
use crate::event::{Event, TypedEvent};
use crate::partition::Partitioning;
use crate::pe::EventTarget;

/// Extracts the routing key from an event. One extractor per stream.
pub trait KeyExtractor: Send + Sync {
  /// The key, or `None` for keyless events (delivered locally under the
  /// empty key).
  fn key_of(&self, event: &dyn Event) -> Option<String>;
}

impl<F> KeyExtractor for F
where
  F: Fn(&dyn Event) -> Option<String> + Send + Sync,
{
  fn key_of(&self, event: &dyn Event) -> Option<String> {
    self(event)
  }
}

/// Extractor using the key the event itself carries ([`Event::key`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct EventKeyExtractor;

impl KeyExtractor for EventKeyExtractor {
  fn key_of(&self, event: &dyn Event) -> Option<String> {
    event.key().map(str::to_string)
  }
}

/// Typed extractor: applies `f` to events of type `E` (and subtypes
/// exposing an `E` view); anything else is keyless.
pub fn key_of<E, F>(f: F) -> impl KeyExtractor
where
  E: TypedEvent + 'static,
  F: Fn(&E) -> String + Send + Sync,
{
  move |event: &dyn Event| {
    event
      .upcast(E::static_kind())
      .and_then(|view| view.downcast_ref::<E>())
      .map(&f)
  }
}

/// What `put` does when the bounded queue is full.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Overflow {
  /// The producer awaits until space is available. Default.
  #[default]
  Block,
  /// The event is dropped with a warning and a counter increment.
  Drop,
}

struct QueueItem {
  key: String,
  event: Arc<dyn Event>,
}

/// Builder for [`Stream`].
pub struct StreamBuilder {
  name: String,
  extractor: Arc<dyn KeyExtractor>,
  subscribers: Vec<Weak<dyn EventTarget>>,
  capacity: usize,
  overflow: Overflow,
  partitioning: Partitioning,
  sender: Option<Arc<Sender>>,
}

impl StreamBuilder {
  /// Sets the key extractor (defaults to [`EventKeyExtractor`]).
  pub fn key_extractor(mut self, extractor: impl KeyExtractor + 'static) -> Self {
    self.extractor = Arc::new(extractor);
    self
  }

  /// Adds a subscriber prototype (held weakly).
  pub fn subscribe(mut self, target: Weak<dyn EventTarget>) -> Self {
    self.subscribers.push(target);
    self
  }

  /// Sets the bounded queue capacity (default 1024).
  pub fn capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity.max(1);
    self
  }

  /// Sets the overflow policy.
  pub fn overflow(mut self, overflow: Overflow) -> Self {
    self.overflow = overflow;
    self
  }

  /// Sets the partitioning scheme (default: single node, one partition).
  pub fn partitioning(mut self, partitioning: Partitioning) -> Self {
    self.partitioning = partitioning;
    self
  }

  /// Binds the comm-layer sender for non-local partitions.
  pub fn sender(mut self, sender: Arc<Sender>) -> Self {
    self.sender = Some(sender);
    self
  }

  pub(crate) fn has_sender(&self) -> bool {
    self.sender.is_some()
  }

  /// Creates the stream and spawns its delivery worker.
  pub fn spawn(self) -> Arc<Stream> {
    let (tx, mut rx) = mpsc::channel::<QueueItem>(self.capacity);
    let subscribers: Arc<Vec<Weak<dyn EventTarget>>> = Arc::new(self.subscribers);

    let worker_subscribers = Arc::clone(&subscribers);
    let worker_name = self.name.clone();
    let worker = tokio::spawn(async move {
      while let Some(item) = rx.recv().await {
        trace!(
          "stream [{}] delivering [{}] for key [{}]",
          worker_name,
          item.event.kind().name(),
          item.key
        );
        for target in worker_subscribers.iter().filter_map(Weak::upgrade) {
          target.process(&item.key, Arc::clone(&item.event)).await;
        }
      }
    });

    Arc::new(Stream {
      name: self.name,
      extractor: self.extractor,
      subscribers,
      tx: RwLock::new(Some(tx)),
      worker: StdMutex::new(Some(worker)),
      partitioning: self.partitioning,
      sender: self.sender,
      overflow: self.overflow,
      closed: AtomicBool::new(false),
      dropped: AtomicU64::new(0),
    })
  }
}

/// A named routed queue. Create with [`Stream::builder`].
pub struct Stream {
  name: String,
  extractor: Arc<dyn KeyExtractor>,
  subscribers: Arc<Vec<Weak<dyn EventTarget>>>,
  tx: RwLock<Option<mpsc::Sender<QueueItem>>>,
  worker: StdMutex<Option<JoinHandle<()>>>,
  partitioning: Partitioning,
  sender: Option<Arc<Sender>>,
  overflow: Overflow,
  closed: AtomicBool,
  dropped: AtomicU64,
}

impl Stream {
  /// Starts building a stream with the given name. Names are stable and
  /// used to wire cross-app dependencies and route inbound comm frames.
  pub fn builder(name: impl Into<String>) -> StreamBuilder {
    StreamBuilder {
      name: name.into(),
      extractor: Arc::new(EventKeyExtractor),
      subscribers: Vec::new(),
      capacity: 1024,
      overflow: Overflow::default(),
      partitioning: Partitioning::local(),
      sender: None,
    }
  }

  /// Stream name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Number of subscribers still alive.
  pub fn subscriber_count(&self) -> usize {
    self
      .subscribers
      .iter()
      .filter(|target| target.strong_count() > 0)
      .count()
  }

  /// Events dropped by the `Drop` overflow policy so far.
  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }

  /// Whether the stream has been closed.
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Routes an event: key extraction, partitioning, then local delivery
  /// or comm hand-off. After `close` this is a no-op that logs a warning.
  pub async fn put(&self, event: Arc<dyn Event>) {
    if self.is_closed() {
      warn!("{}", Error::StreamClosed(self.name.clone()));
      return;
    }

    let Some(key) = self.extractor.key_of(event.as_ref()) else {
      // Keyless events stay on this node under the empty key.
      self.enqueue(String::new(), event).await;
      return;
    };

    let partition = self.partitioning.partition_for(&key);
    if self.partitioning.topology.is_local(partition) {
      self.enqueue(key, event).await;
    } else if let Some(sender) = &self.sender {
      sender.send(&self.name, partition, event.as_ref()).await;
    } else {
      warn!(
        "stream [{}]: partition {} is remote but no emitter is bound, dropping event",
        self.name, partition
      );
    }
  }

  /// Local enqueue for frames already partitioned to this node (the
  /// receive path). Key extraction still runs here.
  pub(crate) async fn inject(&self, event: Arc<dyn Event>) {
    if self.is_closed() {
      warn!("{}", Error::StreamClosed(self.name.clone()));
      return;
    }
    let key = self.extractor.key_of(event.as_ref()).unwrap_or_default();
    self.enqueue(key, event).await;
  }

  async fn enqueue(&self, key: String, event: Arc<dyn Event>) {
    let tx = self
      .tx
      .read()
      .unwrap_or_else(|poison| poison.into_inner())
      .clone();
    let Some(tx) = tx else {
      warn!("{}", Error::StreamClosed(self.name.clone()));
      return;
    };

    let item = QueueItem { key, event };
    match self.overflow {
      Overflow::Block => {
        if tx.send(item).await.is_err() {
          warn!("{}", Error::StreamClosed(self.name.clone()));
        }
      }
      Overflow::Drop => match tx.try_send(item) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
          self.dropped.fetch_add(1, Ordering::Relaxed);
          warn!("{}", Error::QueueOverflow(self.name.clone()));
        }
        Err(TrySendError::Closed(_)) => {
          warn!("{}", Error::StreamClosed(self.name.clone()));
        }
      },
    }
  }

  /// Stops intake, drains queued events through the worker, then joins
  /// it. Idempotent; `put` afterwards is a warning no-op.
  pub async fn close(&self) {
    if self.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    self
      .tx
      .write()
      .unwrap_or_else(|poison| poison.into_inner())
      .take();
    let worker = self
      .worker
      .lock()
      .unwrap_or_else(|poison| poison.into_inner())
      .take();
    if let Some(worker) = worker {
      let _ = worker.await;
    }
    info!("stream [{}] closed", self.name);
  }
}

impl std::fmt::Debug for Stream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Stream")
      .field("name", &self.name)
      .field("subscribers", &self.subscribers.len())
      .field("closed", &self.is_closed())
      .finish()
  }
}

/// A named export point: events put here fan out to every stream another
/// app subscribed. This is the explicit wiring surface between apps.
pub struct EventSource {
  name: String,
  subscribers: RwLock<Vec<Arc<Stream>>>,
}

impl EventSource {
  /// Creates an event source with the given exported name.
  pub fn new(name: impl Into<String>) -> Arc<Self> {
    Arc::new(Self {
      name: name.into(),
      subscribers: RwLock::new(Vec::new()),
    })
  }

  /// Exported name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Subscribes a consumer stream.
  pub fn subscribe(&self, stream: Arc<Stream>) {
    info!(
      "stream [{}] subscribed to event source [{}]",
      stream.name(),
      self.name
    );
    self
      .subscribers
      .write()
      .unwrap_or_else(|poison| poison.into_inner())
      .push(stream);
  }

  /// Number of subscribed streams.
  pub fn subscriber_count(&self) -> usize {
    self
      .subscribers
      .read()
      .unwrap_or_else(|poison| poison.into_inner())
      .len()
  }

  /// Fans the event out to every subscribed stream.
  pub async fn put(&self, event: Arc<dyn Event>) {
    let streams: Vec<Arc<Stream>> = self
      .subscribers
      .read()
      .unwrap_or_else(|poison| poison.into_inner())
      .clone();
    for stream in streams {
      stream.put(Arc::clone(&event)).await;
    }
  }

  /// Drops all subscriptions.
  pub fn close(&self) {
    self
      .subscribers
      .write()
      .unwrap_or_else(|poison| poison.into_inner())
      .clear();
  }
}

impl std::fmt::Debug for EventSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventSource")
      .field("name", &self.name)
      .field("subscribers", &self.subscriber_count())
      .finish()
  }
}
