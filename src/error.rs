//! Error taxonomy for the node runtime.
//!
//! Failures inside user handlers never crash the node: they are logged and
//! the triggering event is considered processed. Startup failures (bad
//! configuration, comm binding) are fatal. A failure loading one application
//! does not affect the others.

use thiserror::Error;

/// Boxed error returned by user code (handlers, lifecycle hooks).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type used by user handlers and lifecycle hooks.
pub type HandlerResult = Result<(), BoxError>;

/// Error type for runtime operations.
#[derive(Error, Debug)]
pub enum Error {
  /// Missing or malformed node configuration. Fatal at startup.
  #[error("configuration error: {0}")]
  Config(String),

  /// An application could not be built. The server skips it and continues.
  #[error("failed to load application [{name}]: {reason}")]
  Load { name: String, reason: String },

  /// User code failed in a lifecycle hook or handler.
  #[error("user code failed in {hook} of PE [{pe}] for key [{key}]: {source}")]
  UserHandler {
    hook: &'static str,
    pe: &'static str,
    key: String,
    #[source]
    source: BoxError,
  },

  /// Send or receive failure in the comm layer. The event is dropped.
  #[error("transport error: {0}")]
  Transport(String),

  /// A bounded stream queue was full in drop mode. The event is dropped.
  #[error("stream [{0}] queue full, event dropped")]
  QueueOverflow(String),

  /// Encoding or decoding a wire frame failed.
  #[error("serialization error: {0}")]
  Serde(String),

  /// An event was put on a stream after it was closed.
  #[error("stream [{0}] is closed")]
  StreamClosed(String),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_display() {
    assert_eq!(
      format!("{}", Error::Config("missing apps_dir".into())),
      "configuration error: missing apps_dir"
    );
    assert_eq!(
      format!(
        "{}",
        Error::Load {
          name: "counter".into(),
          reason: "no factory".into()
        }
      ),
      "failed to load application [counter]: no factory"
    );
    assert_eq!(
      format!("{}", Error::QueueOverflow("words".into())),
      "stream [words] queue full, event dropped"
    );
  }

  #[test]
  fn test_user_handler_error_carries_source() {
    let err = Error::UserHandler {
      hook: "on_create",
      pe: "CounterPe",
      key: "k1".into(),
      source: "boom".into(),
    };
    let msg = format!("{}", err);
    assert!(msg.contains("on_create"));
    assert!(msg.contains("CounterPe"));
    assert!(msg.contains("k1"));
    assert!(std::error::Error::source(&err).is_some());
  }
}
