//! Shared fixtures for the crate's test suite: a small sensor-reading
//! event hierarchy and a recording PE class.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};

use crate::dispatch::DispatchTables;
use crate::error::HandlerResult;
use crate::event::{Event, EventKind, TypedEvent};
use crate::pe::{InstanceContext, ProcessingElement};
use crate::state::StateCell;

pub static READING_KIND: EventKind = EventKind::new("ReadingEvent");
pub static TEMPERATURE_KIND: EventKind =
  EventKind::subtype_of("TemperatureReading", &READING_KIND);
pub static CALIBRATED_KIND: EventKind =
  EventKind::subtype_of("CalibratedTemperature", &TEMPERATURE_KIND);
pub static HUMIDITY_KIND: EventKind = EventKind::subtype_of("HumidityReading", &READING_KIND);

/// Base event: one reading from one sensor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadingEvent {
  pub sensor: String,
  pub value: f64,
}

impl ReadingEvent {
  pub fn new(sensor: impl Into<String>, value: f64) -> Self {
    Self {
      sensor: sensor.into(),
      value,
    }
  }
}

impl Event for ReadingEvent {
  fn kind(&self) -> &'static EventKind {
    &READING_KIND
  }
  fn key(&self) -> Option<&str> {
    Some(&self.sensor)
  }
  fn as_any(&self) -> &dyn Any {
    self
  }
}

impl TypedEvent for ReadingEvent {
  fn static_kind() -> &'static EventKind {
    &READING_KIND
  }
}

/// Temperature reading; subtype of [`ReadingEvent`].
#[derive(Debug, Clone)]
pub struct TemperatureReading {
  pub base: ReadingEvent,
}

impl TemperatureReading {
  pub fn new(sensor: impl Into<String>, value: f64) -> Self {
    Self {
      base: ReadingEvent::new(sensor, value),
    }
  }
}

impl Event for TemperatureReading {
  fn kind(&self) -> &'static EventKind {
    &TEMPERATURE_KIND
  }
  fn key(&self) -> Option<&str> {
    self.base.key()
  }
  fn as_any(&self) -> &dyn Any {
    self
  }
  fn upcast(&self, kind: &'static EventKind) -> Option<&dyn Any> {
    if std::ptr::eq(kind, &TEMPERATURE_KIND) {
      Some(self.as_any())
    } else {
      self.base.upcast(kind)
    }
  }
}

impl TypedEvent for TemperatureReading {
  fn static_kind() -> &'static EventKind {
    &TEMPERATURE_KIND
  }
}

/// Calibrated temperature; subtype of [`TemperatureReading`].
#[derive(Debug, Clone)]
pub struct CalibratedTemperature {
  pub base: TemperatureReading,
  pub offset: f64,
}

impl CalibratedTemperature {
  pub fn new(sensor: impl Into<String>, value: f64, offset: f64) -> Self {
    Self {
      base: TemperatureReading::new(sensor, value),
      offset,
    }
  }
}

impl Event for CalibratedTemperature {
  fn kind(&self) -> &'static EventKind {
    &CALIBRATED_KIND
  }
  fn key(&self) -> Option<&str> {
    self.base.key()
  }
  fn as_any(&self) -> &dyn Any {
    self
  }
  fn upcast(&self, kind: &'static EventKind) -> Option<&dyn Any> {
    if std::ptr::eq(kind, &CALIBRATED_KIND) {
      Some(self.as_any())
    } else {
      self.base.upcast(kind)
    }
  }
}

impl TypedEvent for CalibratedTemperature {
  fn static_kind() -> &'static EventKind {
    &CALIBRATED_KIND
  }
}

/// Humidity reading; subtype of [`ReadingEvent`], unrelated to the
/// temperature branch.
#[derive(Debug, Clone)]
pub struct HumidityReading {
  pub base: ReadingEvent,
}

impl HumidityReading {
  pub fn new(sensor: impl Into<String>, value: f64) -> Self {
    Self {
      base: ReadingEvent::new(sensor, value),
    }
  }
}

impl Event for HumidityReading {
  fn kind(&self) -> &'static EventKind {
    &HUMIDITY_KIND
  }
  fn key(&self) -> Option<&str> {
    self.base.key()
  }
  fn as_any(&self) -> &dyn Any {
    self
  }
  fn upcast(&self, kind: &'static EventKind) -> Option<&dyn Any> {
    if std::ptr::eq(kind, &HUMIDITY_KIND) {
      Some(self.as_any())
    } else {
      self.base.upcast(kind)
    }
  }
}

impl TypedEvent for HumidityReading {
  fn static_kind() -> &'static EventKind {
    &HUMIDITY_KIND
  }
}

/// No-op handler body with the types pinned down.
pub fn noop<'a>() -> futures::future::BoxFuture<'a, HandlerResult> {
  Box::pin(futures::future::ready(Ok(())))
}

/// Recording PE: counts lifecycle hooks and handler invocations. The
/// counters are `Arc`-shared across all instances on purpose; the
/// per-instance total lives in a [`StateCell`].
#[derive(Clone, Default)]
pub struct SensorPe {
  pub created: Arc<AtomicUsize>,
  pub removed: Arc<AtomicUsize>,
  pub inputs: Arc<AtomicUsize>,
  pub outputs: Arc<AtomicUsize>,
  /// Kind names of events seen by the output handler, in order.
  pub output_kinds: Arc<StdMutex<Vec<&'static str>>>,
  /// Input events seen by this one instance.
  pub seen: StateCell<u64>,
}

impl SensorPe {
  pub async fn on_reading(&self, _event: &ReadingEvent) -> HandlerResult {
    self.inputs.fetch_add(1, Ordering::SeqCst);
    self.seen.update(|n| *n += 1);
    Ok(())
  }

  pub async fn on_output(&self, event: &dyn Event) -> HandlerResult {
    self.outputs.fetch_add(1, Ordering::SeqCst);
    self
      .output_kinds
      .lock()
      .unwrap()
      .push(event.kind().name());
    Ok(())
  }
}

#[async_trait::async_trait]
impl ProcessingElement for SensorPe {
  fn register(tables: &mut DispatchTables<Self>) {
    tables.input::<ReadingEvent>(|pe, event| Box::pin(pe.on_reading(event)));
    tables.output_any(|pe, event| Box::pin(pe.on_output(event)));
  }

  async fn on_create(&self, _ctx: &InstanceContext<'_>) -> HandlerResult {
    self.created.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn on_remove(&self) -> HandlerResult {
    self.removed.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}
