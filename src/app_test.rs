//! App container and node server tests: lifecycle, idempotent close,
//! load-failure isolation and event-source wiring between apps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::app::{App, AppModule};
use crate::comm::EventTypeRegistry;
use crate::error::{BoxError, Error};
use crate::pe::Prototype;
use crate::server::{NodeConfig, Server};
use crate::stream::{key_of, EventSource, Stream};
use crate::testutil::*;

async fn settle() {
  sleep(Duration::from_millis(1)).await;
}

fn registry() -> EventTypeRegistry {
  let mut registry = EventTypeRegistry::new();
  registry.register::<ReadingEvent>();
  registry
}

#[tokio::test(start_paused = true)]
async fn test_app_close_is_idempotent() {
  let template = SensorPe::default();
  let removed = Arc::clone(&template.removed);
  let proto = Prototype::new("SensorPE", template);

  let mut app = App::new("sensors");
  app.add_prototype(&proto);
  let stream = app.create_stream(
    Stream::builder("readings")
      .key_extractor(key_of::<ReadingEvent, _>(|event| event.sensor.clone()))
      .subscribe(proto.target_ref()),
  );

  stream.put(Arc::new(ReadingEvent::new("a", 1.0))).await;
  stream.put(Arc::new(ReadingEvent::new("b", 2.0))).await;
  settle().await;
  assert_eq!(proto.instance_count(), 2);

  app.close().await;
  assert!(app.is_closed());
  assert!(stream.is_closed());
  assert_eq!(proto.instance_count(), 0);
  assert_eq!(removed.load(Ordering::SeqCst), 2);

  // Second close is a no-op: on_remove ran exactly once per instance.
  app.close().await;
  assert_eq!(removed.load(Ordering::SeqCst), 2);
}

/// Exports one event source and remembers it for the test.
struct FeedApp {
  slot: Arc<StdMutex<Option<Arc<EventSource>>>>,
}

#[async_trait]
impl AppModule for FeedApp {
  async fn on_init(&mut self, app: &mut App) -> Result<(), BoxError> {
    let source = app.create_event_source("readings-feed");
    *self.slot.lock().unwrap() = Some(source);
    Ok(())
  }
}

/// Consumes the feed through a declared import.
struct MeterApp {
  inputs: Arc<AtomicUsize>,
}

#[async_trait]
impl AppModule for MeterApp {
  async fn on_init(&mut self, app: &mut App) -> Result<(), BoxError> {
    let template = SensorPe {
      inputs: Arc::clone(&self.inputs),
      ..SensorPe::default()
    };
    let proto = Prototype::new("SensorPE", template);
    let stream = app.create_stream(
      Stream::builder("meter-readings")
        .key_extractor(key_of::<ReadingEvent, _>(|event| event.sensor.clone()))
        .subscribe(proto.target_ref()),
    );
    app.add_prototype(&proto);
    app.import("readings-feed", stream);
    Ok(())
  }
}

#[tokio::test(start_paused = true)]
async fn test_server_wires_event_sources_between_apps() {
  let slot: Arc<StdMutex<Option<Arc<EventSource>>>> = Arc::default();
  let inputs: Arc<AtomicUsize> = Arc::default();

  let mut server = Server::new(NodeConfig::default(), registry());
  {
    let slot = Arc::clone(&slot);
    server.register_app(
      "feed",
      Box::new(move || {
        Ok(Box::new(FeedApp {
          slot: Arc::clone(&slot),
        }))
      }),
    );
  }
  {
    let inputs = Arc::clone(&inputs);
    server.register_app(
      "meter",
      Box::new(move || {
        Ok(Box::new(MeterApp {
          inputs: Arc::clone(&inputs),
        }))
      }),
    );
  }

  server.start().await.unwrap();
  assert_eq!(server.apps().count(), 2);

  let source = slot.lock().unwrap().clone().unwrap();
  assert_eq!(source.subscriber_count(), 1);

  source.put(Arc::new(ReadingEvent::new("k", 7.0))).await;
  settle().await;
  assert_eq!(inputs.load(Ordering::SeqCst), 1);

  server.close().await;

  // Closed apps no longer accept events.
  source.put(Arc::new(ReadingEvent::new("k", 8.0))).await;
  settle().await;
  assert_eq!(inputs.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_server_skips_a_failing_app_and_starts_the_rest() {
  let inputs: Arc<AtomicUsize> = Arc::default();

  let mut server = Server::new(NodeConfig::default(), registry());
  server.register_app(
    "broken",
    Box::new(|| {
      Err(Error::Load {
        name: "broken".into(),
        reason: "missing entry point".into(),
      })
    }),
  );
  {
    let inputs = Arc::clone(&inputs);
    server.register_app(
      "meter",
      Box::new(move || {
        Ok(Box::new(MeterApp {
          inputs: Arc::clone(&inputs),
        }))
      }),
    );
  }

  server.start().await.unwrap();
  assert_eq!(server.apps().count(), 1);
  assert_eq!(server.apps().next().unwrap().name(), "meter");
  server.close().await;
}

#[tokio::test]
async fn test_unknown_comm_module_is_fatal() {
  let config = NodeConfig {
    comm_module: "netty".into(),
    ..NodeConfig::default()
  };
  let mut server = Server::new(config, registry());
  let err = server.start().await.unwrap_err();
  assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_node_config_from_file() {
  let path = std::env::temp_dir().join("keyflow-node-config-test.json");
  std::fs::write(&path, r#"{"comm_module":"loopback","log_level":"debug"}"#).unwrap();

  let config = NodeConfig::from_file(&path).unwrap();
  assert_eq!(config.comm_module, "loopback");
  assert_eq!(config.log_level, "debug");
  // Omitted fields fall back to their defaults.
  assert_eq!(config.apps_dir, std::path::PathBuf::from("apps"));

  std::fs::remove_file(&path).ok();

  let missing = NodeConfig::from_file(std::path::Path::new("/nonexistent/node.json"));
  assert!(matches!(missing, Err(Error::Config(_))));
}
