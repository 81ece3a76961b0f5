//! Event model: runtime-tagged values routed through streams to keyed
//! processing elements.
//!
//! Every event carries a [`EventKind`] tag identifying its concrete variant.
//! Kinds form a forest: a kind may name a parent kind, and a handler
//! declared for a parent catches all of its descendants. Subtype events
//! embed their supertype's representation and expose it through
//! [`Event::upcast`], so a handler declared for the supertype receives a
//! typed view of the embedded part.
//!
//! Events are immutable once emitted; the runtime moves them as
//! `Arc<dyn Event>`.

use std::any::Any;
use std::fmt;

/// Runtime variant tag for an event type.
///
/// Instances are `'static` and compared by address, so each event type
/// declares exactly one `static` kind and hands out `&'static` references
/// to it via [`TypedEvent::static_kind`].
pub struct EventKind {
  name: &'static str,
  parent: Option<&'static EventKind>,
}

impl EventKind {
  /// Creates a root kind with no parent.
  #[must_use]
  pub const fn new(name: &'static str) -> Self {
    Self { name, parent: None }
  }

  /// Creates a kind that is a proper subtype of `parent`.
  #[must_use]
  pub const fn subtype_of(name: &'static str, parent: &'static EventKind) -> Self {
    Self {
      name,
      parent: Some(parent),
    }
  }

  /// The variant name, used in logs and on the wire.
  #[must_use]
  pub const fn name(&self) -> &'static str {
    self.name
  }

  /// The parent kind, if any.
  #[must_use]
  pub const fn parent(&self) -> Option<&'static EventKind> {
    self.parent
  }

  /// Returns true if `self` is `other` or a descendant of `other`.
  #[must_use]
  pub fn is_a(&'static self, other: &'static EventKind) -> bool {
    let mut cursor = Some(self);
    while let Some(kind) = cursor {
      if std::ptr::eq(kind, other) {
        return true;
      }
      cursor = kind.parent;
    }
    false
  }

  /// Distance from the root of this kind's chain. Roots have depth zero;
  /// a proper subtype is always deeper than its ancestors, which is what
  /// dispatch-table ordering relies on.
  #[must_use]
  pub fn depth(&'static self) -> usize {
    let mut depth = 0;
    let mut cursor = self.parent;
    while let Some(kind) = cursor {
      depth += 1;
      cursor = kind.parent;
    }
    depth
  }
}

impl fmt::Debug for EventKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EventKind")
      .field("name", &self.name)
      .field("parent", &self.parent.map(EventKind::name))
      .finish()
  }
}

/// An event routed through the fabric.
///
/// Implementors are plain structs. The default [`Event::upcast`] only
/// answers for the event's own kind; subtypes override it to also expose
/// the embedded supertype representation.
pub trait Event: Any + Send + Sync + fmt::Debug {
  /// Runtime variant tag of this event.
  fn kind(&self) -> &'static EventKind;

  /// Routing key, if the event itself carries one. Streams may override
  /// this with their own key extractor.
  fn key(&self) -> Option<&str> {
    None
  }

  /// `Any` view of the concrete value.
  fn as_any(&self) -> &dyn Any;

  /// A view of this event as the given kind, used by typed dispatch when a
  /// handler is declared for a supertype. Returns `None` if this event has
  /// no representation for `kind`.
  fn upcast(&self, kind: &'static EventKind) -> Option<&dyn Any> {
    if std::ptr::eq(self.kind(), kind) {
      Some(self.as_any())
    } else {
      None
    }
  }
}

/// Events with a statically known kind, i.e. everything user-defined.
/// Required for typed handler registration and wire-codec registration.
pub trait TypedEvent: Event + Sized {
  /// The kind shared by all values of this type.
  fn static_kind() -> &'static EventKind;
}

/// Kind of the synthetic [`TimerEvent`].
pub static TIMER_EVENT_KIND: EventKind = EventKind::new("TimerEvent");

/// Synthetic event dispatched through the output tables by the
/// time-based output policy when `on_event` is false. Never enqueued on a
/// stream and never crosses the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerEvent;

impl Event for TimerEvent {
  fn kind(&self) -> &'static EventKind {
    &TIMER_EVENT_KIND
  }

  fn as_any(&self) -> &dyn Any {
    self
  }
}

impl TypedEvent for TimerEvent {
  fn static_kind() -> &'static EventKind {
    &TIMER_EVENT_KIND
  }
}
