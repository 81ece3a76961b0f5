//! Per-instance mutable state cells for processing elements.
//!
//! A processing element is cloned from its prototype template once per key
//! (see [`crate::pe`]). Plain fields are shared snapshots; anything the
//! instance must mutate goes in a [`StateCell`]. Cloning a cell produces an
//! **independent** cell seeded with the current value, so every instance
//! gets its own copy of the template's state while `Arc` fields (stream
//! handles, shared counters) keep being shared by reference — the latter is
//! documented as the PE author's responsibility.
//!
//! Handlers run under the per-instance serialization gate unless the PE
//! class is thread-safe, so the cell's lock is uncontended in the common
//! case.

use std::sync::{Arc, RwLock};

/// Thread-safe mutable cell holding one piece of per-instance state.
#[derive(Debug)]
pub struct StateCell<S> {
  inner: Arc<RwLock<S>>,
}

impl<S: Clone> StateCell<S> {
  /// Creates a cell holding `value`.
  pub fn new(value: S) -> Self {
    Self {
      inner: Arc::new(RwLock::new(value)),
    }
  }

  /// Returns a copy of the current value.
  pub fn get(&self) -> S {
    self
      .inner
      .read()
      .unwrap_or_else(|poison| poison.into_inner())
      .clone()
  }

  /// Replaces the current value.
  pub fn set(&self, value: S) {
    *self
      .inner
      .write()
      .unwrap_or_else(|poison| poison.into_inner()) = value;
  }

  /// Updates the value in place and returns the result.
  pub fn update<F>(&self, f: F) -> S
  where
    F: FnOnce(&mut S),
  {
    let mut guard = self
      .inner
      .write()
      .unwrap_or_else(|poison| poison.into_inner());
    f(&mut guard);
    guard.clone()
  }
}

impl<S: Clone> Clone for StateCell<S> {
  /// Clone produces a new cell seeded with the current value. Mutations on
  /// the clone do not affect the original, which is what gives each PE
  /// instance its own state.
  fn clone(&self) -> Self {
    Self::new(self.get())
  }
}

impl<S: Clone + Default> Default for StateCell<S> {
  fn default() -> Self {
    Self::new(S::default())
  }
}
