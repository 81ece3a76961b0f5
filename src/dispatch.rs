//! Dispatch tables: routing an event to the handler declared for the most
//! specific variant the PE class subscribes to.
//!
//! A PE class declares its handlers once, in
//! [`ProcessingElement::register`](crate::pe::ProcessingElement::register).
//! The builder collects them into two tables (input, output) sorted from
//! most-specific to least-specific variant, with declaration order as the
//! tie-break for unrelated variants and catch-all entries last. The tables
//! are immutable once the prototype is constructed, so dispatch runs with
//! no synchronization.
//!
//! Selection walks the table in order and invokes the first handler whose
//! declared kind the event's runtime kind `is_a`. A miss is logged and the
//! event dropped; at most one input handler and at most one output handler
//! run per delivery.

use std::marker::PhantomData;

use futures::future::BoxFuture;
use tracing::error;

use crate::error::HandlerResult;
use crate::event::{Event, EventKind, TypedEvent};

/// Handler declared for a concrete event type. Higher-ranked fn pointer so
/// non-capturing closures (`|pe, ev| Box::pin(pe.on_word(ev))`) coerce.
pub type TypedHandler<P, E> = for<'a> fn(&'a P, &'a E) -> BoxFuture<'a, HandlerResult>;

/// Catch-all handler receiving the type-erased event.
pub type AnyHandler<P> = for<'a> fn(&'a P, &'a dyn Event) -> BoxFuture<'a, HandlerResult>;

/// Which table a dispatch targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Table {
  Input,
  Output,
}

trait Invoke<P>: Send + Sync {
  fn invoke<'a>(&self, pe: &'a P, event: &'a dyn Event) -> BoxFuture<'a, HandlerResult>;
}

struct TypedInvoke<P, E> {
  kind: &'static EventKind,
  handler: TypedHandler<P, E>,
  _pe: PhantomData<fn(P, E)>,
}

impl<P, E> Invoke<P> for TypedInvoke<P, E>
where
  P: Send + Sync,
  E: TypedEvent + 'static,
{
  fn invoke<'a>(&self, pe: &'a P, event: &'a dyn Event) -> BoxFuture<'a, HandlerResult> {
    match event
      .upcast(self.kind)
      .and_then(|view| view.downcast_ref::<E>())
    {
      Some(typed) => (self.handler)(pe, typed),
      None => {
        // Matched by kind but the event exposes no representation for it:
        // the event type's upcast is incomplete.
        error!(
          "event [{}] has no representation for kind [{}], skipping handler",
          event.kind().name(),
          self.kind.name()
        );
        Box::pin(futures::future::ready(Ok(())))
      }
    }
  }
}

struct AnyInvoke<P> {
  handler: AnyHandler<P>,
  _pe: PhantomData<fn(P)>,
}

impl<P: Send + Sync> Invoke<P> for AnyInvoke<P> {
  fn invoke<'a>(&self, pe: &'a P, event: &'a dyn Event) -> BoxFuture<'a, HandlerResult> {
    (self.handler)(pe, event)
  }
}

struct Entry<P> {
  /// `None` is the catch-all, matching every event and sorting last.
  kind: Option<&'static EventKind>,
  invoke: Box<dyn Invoke<P>>,
}

impl<P> Entry<P> {
  fn specificity(&self) -> isize {
    match self.kind {
      Some(kind) => kind.depth() as isize,
      None => -1,
    }
  }

  fn matches(&self, event: &dyn Event) -> bool {
    match self.kind {
      Some(kind) => event.kind().is_a(kind),
      None => true,
    }
  }
}

/// The input and output dispatch tables of one PE class.
pub struct DispatchTables<P> {
  pe_name: &'static str,
  input: Vec<Entry<P>>,
  output: Vec<Entry<P>>,
}

impl<P: Send + Sync + 'static> DispatchTables<P> {
  pub(crate) fn new() -> Self {
    Self {
      pe_name: std::any::type_name::<P>(),
      input: Vec::new(),
      output: Vec::new(),
    }
  }

  /// Declares an input handler for events of type `E` (and subtypes of it).
  pub fn input<E: TypedEvent + 'static>(&mut self, handler: TypedHandler<P, E>) -> &mut Self {
    self.input.push(Entry {
      kind: Some(E::static_kind()),
      invoke: Box::new(TypedInvoke {
        kind: E::static_kind(),
        handler,
        _pe: PhantomData,
      }),
    });
    self
  }

  /// Declares an input handler matching every event variant.
  pub fn input_any(&mut self, handler: AnyHandler<P>) -> &mut Self {
    self.input.push(Entry {
      kind: None,
      invoke: Box::new(AnyInvoke {
        handler,
        _pe: PhantomData,
      }),
    });
    self
  }

  /// Declares an output handler for events of type `E` (and subtypes of it).
  pub fn output<E: TypedEvent + 'static>(&mut self, handler: TypedHandler<P, E>) -> &mut Self {
    self.output.push(Entry {
      kind: Some(E::static_kind()),
      invoke: Box::new(TypedInvoke {
        kind: E::static_kind(),
        handler,
        _pe: PhantomData,
      }),
    });
    self
  }

  /// Declares an output handler matching every event variant.
  pub fn output_any(&mut self, handler: AnyHandler<P>) -> &mut Self {
    self.output.push(Entry {
      kind: None,
      invoke: Box::new(AnyInvoke {
        handler,
        _pe: PhantomData,
      }),
    });
    self
  }

  /// Sorts both tables most-specific first. Stable, so handlers for
  /// unrelated variants keep declaration order.
  pub(crate) fn seal(&mut self) {
    self.input.sort_by_key(|entry| -entry.specificity());
    self.output.sort_by_key(|entry| -entry.specificity());
  }

  /// Declared input variant names in table order. Diagnostic.
  pub fn input_kinds(&self) -> Vec<&'static str> {
    self
      .input
      .iter()
      .map(|entry| entry.kind.map_or("*", EventKind::name))
      .collect()
  }

  /// Declared output variant names in table order. Diagnostic.
  pub fn output_kinds(&self) -> Vec<&'static str> {
    self
      .output
      .iter()
      .map(|entry| entry.kind.map_or("*", EventKind::name))
      .collect()
  }

  /// Routes `event` through the input table. Returns true if a handler ran.
  pub async fn dispatch_input(&self, pe: &P, key: &str, event: &dyn Event) -> bool {
    self.dispatch(Table::Input, pe, key, event).await
  }

  /// Routes `event` through the output table. Returns true if a handler ran.
  pub async fn dispatch_output(&self, pe: &P, key: &str, event: &dyn Event) -> bool {
    self.dispatch(Table::Output, pe, key, event).await
  }

  async fn dispatch(&self, table: Table, pe: &P, key: &str, event: &dyn Event) -> bool {
    let entries = match table {
      Table::Input => &self.input,
      Table::Output => &self.output,
    };

    let Some(entry) = entries.iter().find(|entry| entry.matches(event)) else {
      error!(
        "Cannot dispatch event of type [{}] to PE of type [{}] : no matching handler",
        event.kind().name(),
        self.pe_name
      );
      return false;
    };

    if let Err(err) = entry.invoke.invoke(pe, event).await {
      // User failure: log with class, key and variant; the event is
      // considered processed and instance state is not rolled back.
      let side = match table {
        Table::Input => "input",
        Table::Output => "output",
      };
      error!(
        "user {} handler for event [{}] failed in PE [{}] key [{}]: {}",
        side,
        event.kind().name(),
        self.pe_name,
        key,
        err
      );
    }
    true
  }
}

impl<P: Send + Sync + 'static> Default for DispatchTables<P> {
  fn default() -> Self {
    Self::new()
  }
}

impl<P> std::fmt::Debug for DispatchTables<P> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DispatchTables")
      .field("pe", &self.pe_name)
      .field("input", &self.input.len())
      .field("output", &self.output.len())
      .finish()
  }
}
