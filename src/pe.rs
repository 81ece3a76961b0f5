//! Processing elements: prototypes, keyed instances, lifecycle and the
//! output triggering engine.
//!
//! A [`Prototype`] is the configuration template for a PE class. It owns
//! the dispatch tables, the output policies, the expiration policy and the
//! live map of per-key instances. Instances are created lazily by cloning
//! the template on the first event for a key; per-instance mutable fields
//! live in [`StateCell`](crate::state::StateCell) cells so each clone gets
//! its own copy (plain `Arc` fields are shared — the PE author's
//! responsibility, as documented on [`crate::state`]).
//!
//! Delivery for one key is serialized through a per-instance gate unless
//! the class declares itself thread-safe, in which case handlers may run
//! concurrently on the same instance and own their internal
//! synchronization. That opt-out exists for cyclic stream graphs with
//! blocking queues, where full serialization can deadlock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::dispatch::DispatchTables;
use crate::error::{Error, HandlerResult};
use crate::event::{Event, TimerEvent};

/// Context handed to [`ProcessingElement::on_create`].
#[derive(Debug)]
pub struct InstanceContext<'a> {
  /// The key this instance was created for.
  pub key: &'a str,
}

/// A user-defined PE class.
///
/// The template configured by the application is cloned once per key;
/// `register` declares the class's handlers and is called once when the
/// prototype is constructed.
#[async_trait]
pub trait ProcessingElement: Clone + Send + Sync + 'static {
  /// Declares the input and output handlers of this class.
  fn register(tables: &mut DispatchTables<Self>);

  /// Runs once after an instance is created, before it sees any event.
  /// A failure here removes the instance again and surfaces to the caller
  /// of the triggering dispatch.
  async fn on_create(&self, ctx: &InstanceContext<'_>) -> HandlerResult {
    let _ = ctx;
    Ok(())
  }

  /// Runs exactly once before an instance's slot is freed.
  async fn on_remove(&self) -> HandlerResult {
    Ok(())
  }

  /// When true, handlers may execute concurrently on the same instance and
  /// the class owns its internal synchronization. Recorded on the
  /// prototype at first-instance creation; every later instance inherits
  /// it.
  fn thread_safe(&self) -> bool {
    false
  }
}

/// Type-erased handle used by streams to deliver events to a prototype.
#[async_trait]
pub trait EventTarget: Send + Sync {
  /// Prototype name.
  fn name(&self) -> &str;

  /// Number of live instances.
  fn instance_count(&self) -> usize;

  /// Locates or creates the instance for `key` and runs the full
  /// dispatch-and-output block under the per-instance discipline.
  /// Failures are logged; the event is at-most-once either way.
  async fn process(&self, key: &str, event: Arc<dyn Event>);

  /// Cancels timers and removes every instance, running `on_remove` once
  /// per instance.
  async fn shutdown(&self);
}

/// A live per-key copy of a prototype.
pub struct Instance<P: ProcessingElement> {
  state: P,
  id: String,
  prototype: Weak<ProtoInner<P>>,
  event_count: AtomicU64,
  pending_output: AtomicBool,
  gate: AsyncMutex<()>,
  last_access: RwLock<Instant>,
  removed: AtomicBool,
}

impl<P: ProcessingElement> Instance<P> {
  /// The key this instance serves.
  pub fn id(&self) -> &str {
    &self.id
  }

  /// The instance's user state.
  pub fn state(&self) -> &P {
    &self.state
  }

  /// Input events delivered to this instance so far.
  pub fn event_count(&self) -> u64 {
    self.event_count.load(Ordering::SeqCst)
  }

  fn touch(&self) {
    *self
      .last_access
      .write()
      .unwrap_or_else(|poison| poison.into_inner()) = Instant::now();
  }

  fn idle_for(&self, now: Instant) -> Duration {
    let last = *self
      .last_access
      .read()
      .unwrap_or_else(|poison| poison.into_inner());
    now.saturating_duration_since(last)
  }
}

impl<P: ProcessingElement> Instance<P> {
  /// The prototype this instance was cloned from, if still alive.
  pub fn prototype(&self) -> Option<Prototype<P>> {
    self.prototype.upgrade().map(|inner| Prototype { inner })
  }
}

impl<P: ProcessingElement> std::fmt::Debug for Instance<P> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Instance")
      .field("id", &self.id)
      .field("event_count", &self.event_count.load(Ordering::Relaxed))
      .finish()
  }
}

struct ProtoInner<P: ProcessingElement> {
  name: String,
  template: P,
  tables: DispatchTables<P>,
  instances: RwLock<HashMap<String, Arc<Instance<P>>>>,
  expire_after: RwLock<Option<Duration>>,
  output_every_n_events: AtomicU64,
  output_interval_ms: AtomicU64,
  output_on_event: AtomicBool,
  timer: StdMutex<Option<JoinHandle<()>>>,
  reaper: StdMutex<Option<JoinHandle<()>>>,
  thread_safe: AtomicBool,
  first_instance_pending: AtomicBool,
  closed: AtomicBool,
  me: Weak<ProtoInner<P>>,
}

/// The configuration template and instance registry of one PE class.
///
/// Cheap to clone; all clones share the same underlying prototype.
pub struct Prototype<P: ProcessingElement> {
  inner: Arc<ProtoInner<P>>,
}

impl<P: ProcessingElement> Clone for Prototype<P> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<P: ProcessingElement> Prototype<P> {
  /// Builds a prototype for `template` with the class's dispatch tables.
  pub fn new(name: impl Into<String>, template: P) -> Self {
    let mut tables = DispatchTables::new();
    P::register(&mut tables);
    tables.seal();

    let inner = Arc::new_cyclic(|me| ProtoInner {
      name: name.into(),
      template,
      tables,
      instances: RwLock::new(HashMap::new()),
      expire_after: RwLock::new(None),
      output_every_n_events: AtomicU64::new(0),
      output_interval_ms: AtomicU64::new(0),
      output_on_event: AtomicBool::new(true),
      timer: StdMutex::new(None),
      reaper: StdMutex::new(None),
      thread_safe: AtomicBool::new(false),
      first_instance_pending: AtomicBool::new(true),
      closed: AtomicBool::new(false),
      me: me.clone(),
    });
    Self { inner }
  }

  /// Prototype name.
  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// Number of live instances.
  pub fn instance_count(&self) -> usize {
    self.inner.instance_count()
  }

  /// Snapshot of the live instances.
  pub fn instances(&self) -> Vec<Arc<Instance<P>>> {
    self
      .inner
      .instances
      .read()
      .unwrap_or_else(|poison| poison.into_inner())
      .values()
      .cloned()
      .collect()
  }

  /// The thread-safety flag recorded at first-instance creation.
  pub fn is_thread_safe(&self) -> bool {
    self.inner.thread_safe.load(Ordering::Relaxed)
  }

  /// The instance for `key`, if it exists. Refreshes its access time.
  pub fn get(&self, key: &str) -> Option<Arc<Instance<P>>> {
    let inst = self
      .inner
      .instances
      .read()
      .unwrap_or_else(|poison| poison.into_inner())
      .get(key)
      .cloned()?;
    inst.touch();
    Some(inst)
  }

  /// The instance for `key`, created from the template if absent.
  pub async fn get_or_create(&self, key: &str) -> Result<Arc<Instance<P>>, Error> {
    self.inner.get_or_create(key).await
  }

  /// Sets the count-based output policy: the output handler runs after
  /// every `n` input events delivered to an instance. Zero disables.
  pub fn set_output_interval_in_events(&self, n: u64) {
    self.inner.output_every_n_events.store(n, Ordering::SeqCst);
  }

  /// The configured count-based output interval.
  pub fn output_interval_in_events(&self) -> u64 {
    self.inner.output_every_n_events.load(Ordering::SeqCst)
  }

  /// Sets the time-based output policy. One timer per prototype ticks
  /// every `interval` (first tick immediate). With `on_event` true each
  /// tick arms a per-instance flag consumed by that instance's next input
  /// event; with `on_event` false each tick dispatches a synthetic
  /// [`TimerEvent`] through the output table with no input handler.
  /// Replacing the interval cancels and restarts the timer; a zero
  /// interval cancels it. The count- and time-based policies are not
  /// mutually exclusive: both can fire on the same input event, in which
  /// case the output handler runs twice.
  pub fn set_output_interval(&self, interval: Duration, on_event: bool) {
    let inner = &self.inner;
    let mut timer = inner
      .timer
      .lock()
      .unwrap_or_else(|poison| poison.into_inner());
    if let Some(handle) = timer.take() {
      handle.abort();
      debug!("timer for PE [{}] cancelled", inner.name);
    }
    inner
      .output_interval_ms
      .store(interval.as_millis() as u64, Ordering::SeqCst);
    if interval.is_zero() {
      return;
    }
    inner.output_on_event.store(on_event, Ordering::SeqCst);

    let weak = inner.me.clone();
    *timer = Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let Some(proto) = weak.upgrade() else { break };
        if proto.closed.load(Ordering::SeqCst) {
          break;
        }
        proto.on_tick().await;
      }
    }));
  }

  /// The configured time-based output interval (zero when disabled).
  pub fn output_interval(&self) -> Duration {
    Duration::from_millis(self.inner.output_interval_ms.load(Ordering::SeqCst))
  }

  /// Sets or clears access-based expiration. Instances idle for at least
  /// `after` are evicted (best-effort, within a bounded delay) and get
  /// `on_remove`. Reconfiguring replaces the registry: all existing
  /// instances are dropped, each with `on_remove`.
  pub async fn set_expiration(&self, after: Option<Duration>) {
    self.inner.drain_instances().await;
    *self
      .inner
      .expire_after
      .write()
      .unwrap_or_else(|poison| poison.into_inner()) = after;

    let mut reaper = self
      .inner
      .reaper
      .lock()
      .unwrap_or_else(|poison| poison.into_inner());
    if let Some(handle) = reaper.take() {
      handle.abort();
    }
    let Some(ttl) = after else { return };

    let weak = self.inner.me.clone();
    let period = std::cmp::max(ttl / 2, Duration::from_millis(1));
    *reaper = Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      // The immediate first tick never evicts anything; skip it.
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(proto) = weak.upgrade() else { break };
        if proto.closed.load(Ordering::SeqCst) {
          break;
        }
        proto.sweep_expired(ttl).await;
      }
    }));
  }

  /// The configured expiration, if any.
  pub fn expiration(&self) -> Option<Duration> {
    *self
      .inner
      .expire_after
      .read()
      .unwrap_or_else(|poison| poison.into_inner())
  }

  /// Removes a single instance, running its `on_remove`. No-op when the
  /// key has no instance.
  pub async fn remove(&self, key: &str) {
    let inst = self
      .inner
      .instances
      .read()
      .unwrap_or_else(|poison| poison.into_inner())
      .get(key)
      .cloned();
    if let Some(inst) = inst {
      self.inner.remove_instance(key, &inst).await;
    }
  }

  /// Cancels the output timer and the reaper, then removes every instance
  /// invoking `on_remove` per instance. The prototype itself receives no
  /// `on_remove`. Idempotent.
  pub async fn remove_all(&self) {
    self.inner.shutdown().await;
  }

  /// Delivers an event to the instance for `key`, as a stream would.
  pub async fn handle(&self, key: &str, event: &dyn Event) -> Result<(), Error> {
    let inst = self.inner.get_or_create(key).await?;
    self.inner.deliver(&inst, event).await;
    Ok(())
  }

  /// The erased delivery handle streams subscribe with.
  pub fn target(&self) -> Arc<dyn EventTarget> {
    self.inner.clone()
  }

  /// Weak form of [`Prototype::target`], for subscriber lists that must
  /// not keep a removed prototype alive.
  pub fn target_ref(&self) -> Weak<dyn EventTarget> {
    let weak: Weak<ProtoInner<P>> = Arc::downgrade(&self.inner);
    weak
  }
}

impl<P: ProcessingElement> std::fmt::Debug for Prototype<P> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Prototype")
      .field("name", &self.inner.name)
      .field("instances", &self.instance_count())
      .finish()
  }
}

impl<P: ProcessingElement> ProtoInner<P> {
  fn instance_count(&self) -> usize {
    self
      .instances
      .read()
      .unwrap_or_else(|poison| poison.into_inner())
      .len()
  }

  async fn get_or_create(&self, key: &str) -> Result<Arc<Instance<P>>, Error> {
    if let Some(inst) = self
      .instances
      .read()
      .unwrap_or_else(|poison| poison.into_inner())
      .get(key)
      .cloned()
    {
      inst.touch();
      return Ok(inst);
    }

    // Clone the template outside the write lock; the loser of a creation
    // race is discarded without ever running on_create.
    let fresh = Arc::new(Instance {
      state: self.template.clone(),
      id: key.to_string(),
      prototype: self.me.clone(),
      event_count: AtomicU64::new(0),
      pending_output: AtomicBool::new(false),
      gate: AsyncMutex::new(()),
      last_access: RwLock::new(Instant::now()),
      removed: AtomicBool::new(false),
    });

    let (inst, created) = {
      let mut map = self
        .instances
        .write()
        .unwrap_or_else(|poison| poison.into_inner());
      match map.get(key) {
        Some(winner) => (Arc::clone(winner), false),
        None => {
          map.insert(key.to_string(), Arc::clone(&fresh));
          (fresh, true)
        }
      }
    };
    inst.touch();
    if !created {
      return Ok(inst);
    }

    if self.first_instance_pending.swap(false, Ordering::SeqCst) {
      // One-time initialization: record the class's thread-safety flag so
      // every instance inherits it.
      let flag = inst.state.thread_safe();
      self.thread_safe.store(flag, Ordering::SeqCst);
      if flag {
        info!("PE [{}] is thread-safe, per-instance discipline relaxed", self.name);
      }
    }

    let ctx = InstanceContext { key };
    if let Err(source) = inst.state.on_create(&ctx).await {
      // A failed on_create must leave the registry unchanged.
      let mut map = self
        .instances
        .write()
        .unwrap_or_else(|poison| poison.into_inner());
      if let Some(current) = map.get(key) {
        if Arc::ptr_eq(current, &inst) {
          map.remove(key);
        }
      }
      return Err(Error::UserHandler {
        hook: "on_create",
        pe: std::any::type_name::<P>(),
        key: key.to_string(),
        source,
      });
    }

    trace!("PE [{}] now has {} instance(s)", self.name, self.instance_count());
    Ok(inst)
  }

  async fn gate<'a>(&self, inst: &'a Instance<P>) -> Option<MutexGuard<'a, ()>> {
    if self.thread_safe.load(Ordering::SeqCst) {
      None
    } else {
      Some(inst.gate.lock().await)
    }
  }

  async fn deliver(&self, inst: &Arc<Instance<P>>, event: &dyn Event) {
    let _guard = self.gate(inst).await;

    let count = inst.event_count.fetch_add(1, Ordering::SeqCst) + 1;
    self
      .tables
      .dispatch_input(&inst.state, &inst.id, event)
      .await;

    // Time policy armed by a tick (on_event mode): consume the flag.
    if inst.pending_output.swap(false, Ordering::SeqCst) {
      self
        .tables
        .dispatch_output(&inst.state, &inst.id, event)
        .await;
    }
    // Count policy. Both policies can fire on the same event; the output
    // handler then runs twice.
    let n = self.output_every_n_events.load(Ordering::SeqCst);
    if n > 0 && count % n == 0 {
      self
        .tables
        .dispatch_output(&inst.state, &inst.id, event)
        .await;
    }
  }

  async fn on_tick(&self) {
    let instances: Vec<Arc<Instance<P>>> = self
      .instances
      .read()
      .unwrap_or_else(|poison| poison.into_inner())
      .values()
      .cloned()
      .collect();
    let on_event = self.output_on_event.load(Ordering::SeqCst);

    for inst in instances {
      if on_event {
        inst.pending_output.store(true, Ordering::SeqCst);
      } else {
        let _guard = self.gate(&inst).await;
        let tick = TimerEvent;
        self
          .tables
          .dispatch_output(&inst.state, &inst.id, &tick)
          .await;
      }
    }
  }

  async fn sweep_expired(&self, ttl: Duration) {
    let now = Instant::now();
    let expired: Vec<(String, Arc<Instance<P>>)> = self
      .instances
      .read()
      .unwrap_or_else(|poison| poison.into_inner())
      .iter()
      .filter(|(_, inst)| inst.idle_for(now) >= ttl)
      .map(|(key, inst)| (key.clone(), Arc::clone(inst)))
      .collect();

    for (key, inst) in expired {
      debug!("evicting idle instance [{}] of PE [{}]", key, self.name);
      self.remove_instance(&key, &inst).await;
    }
  }

  /// Frees one slot and runs `on_remove` exactly once for it.
  async fn remove_instance(&self, key: &str, inst: &Arc<Instance<P>>) {
    {
      let mut map = self
        .instances
        .write()
        .unwrap_or_else(|poison| poison.into_inner());
      match map.get(key) {
        Some(current) if Arc::ptr_eq(current, inst) => {
          map.remove(key);
        }
        // Slot was replaced or already freed.
        _ => return,
      }
    }
    self.retire(inst).await;
  }

  async fn retire(&self, inst: &Arc<Instance<P>>) {
    if inst.removed.swap(true, Ordering::SeqCst) {
      return;
    }
    let _guard = self.gate(inst).await;
    if let Err(err) = inst.state.on_remove().await {
      error!(
        "user code failed in on_remove of PE [{}] for key [{}]: {}",
        std::any::type_name::<P>(),
        inst.id,
        err
      );
    }
  }

  /// Removes every instance, with `on_remove` each. Leaves timers alone.
  async fn drain_instances(&self) {
    let drained: Vec<Arc<Instance<P>>> = {
      let mut map = self
        .instances
        .write()
        .unwrap_or_else(|poison| poison.into_inner());
      map.drain().map(|(_, inst)| inst).collect()
    };
    for inst in drained {
      self.retire(&inst).await;
    }
  }

  async fn shutdown(&self) {
    if self.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    for slot in [&self.timer, &self.reaper] {
      let handle = slot
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
        .take();
      if let Some(handle) = handle {
        handle.abort();
      }
    }
    info!("PE [{}] shutting down, removing all instances", self.name);
    self.drain_instances().await;
  }
}

#[async_trait]
impl<P: ProcessingElement> EventTarget for ProtoInner<P> {
  fn name(&self) -> &str {
    &self.name
  }

  fn instance_count(&self) -> usize {
    ProtoInner::instance_count(self)
  }

  async fn process(&self, key: &str, event: Arc<dyn Event>) {
    if self.closed.load(Ordering::SeqCst) {
      trace!("PE [{}] is closed, dropping event for key [{}]", self.name, key);
      return;
    }
    match self.get_or_create(key).await {
      Ok(inst) => self.deliver(&inst, event.as_ref()).await,
      Err(err) => error!("{}", err),
    }
  }

  async fn shutdown(&self) {
    ProtoInner::shutdown(self).await;
  }
}
