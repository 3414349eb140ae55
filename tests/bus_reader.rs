//! Bus reader behavior, driven by a scripted consumer.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use purged::bus::{BusConsumer, BusEvent, BusReader};
use purged::metrics::{EventStatus, Metrics};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Default)]
struct MockState {
    closed: AtomicBool,
    topics: Mutex<Vec<String>>,
}

struct MockConsumer {
    events: mpsc::UnboundedReceiver<BusEvent>,
    // Keeps the stream open so the reader waits instead of observing EOF.
    _events_tx: mpsc::UnboundedSender<BusEvent>,
    state: Arc<MockState>,
}

fn scripted(events: Vec<BusEvent>) -> (MockConsumer, Arc<MockState>) {
    let (tx, rx) = mpsc::unbounded_channel();
    for event in events {
        tx.send(event).unwrap();
    }
    let state = Arc::new(MockState::default());
    (
        MockConsumer {
            events: rx,
            _events_tx: tx,
            state: state.clone(),
        },
        state,
    )
}

#[async_trait]
impl BusConsumer for MockConsumer {
    fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        *self.state.topics.lock() = topics.to_vec();
        Ok(())
    }

    async fn next_event(&mut self) -> Option<BusEvent> {
        self.events.recv().await
    }

    fn close(&mut self) -> Result<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            bail!("trying to close an already closed consumer");
        }
        Ok(())
    }
}

fn message(payload: &str) -> BusEvent {
    BusEvent::Message {
        topic: Some("topic1".to_string()),
        payload: payload.as_bytes().to_vec(),
    }
}

fn bus_error() -> BusEvent {
    BusEvent::Error {
        code: -195,
        message: "broker transport failure".to_string(),
    }
}

const GOOD_EVENT: &str = r#"{
    "$schema": "/resource_change/1.0.0",
    "meta": {
        "dt": "2020-04-30T11:37:53Z",
        "stream": "purge",
        "uri": "https://it.wikipedia.org/wiki/Francesco_Totti"
    },
    "tags": ["test"]
}"#;

const NO_URI_EVENT: &str = r#"{
    "$schema": "/resource_change/1.0.0",
    "meta": {
        "dt": "2020-04-30T11:37:53Z",
        "stream": "purge"
    }
}"#;

#[tokio::test]
async fn good_message_is_enqueued_and_lag_recorded() {
    let (consumer, state) = scripted(vec![message(GOOD_EVENT), bus_error()]);
    let metrics = Arc::new(Metrics::default());
    let reader = BusReader::new(
        consumer,
        vec!["topic1".to_string(), "topic2".to_string()],
        Duration::ZERO,
        metrics.clone(),
    );
    let lag = reader.lag_tracker();

    let (urls_tx, mut urls_rx) = mpsc::channel(4);
    let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (done_tx, done_rx) = oneshot::channel();

    // The injected bus error ends consumption and is fatal for the reader.
    let outcome = reader.run(urls_tx, shutdown_rx, done_tx).await;
    assert!(outcome.is_err());

    done_rx.await.expect("completion is always signalled");
    assert!(state.closed.load(Ordering::SeqCst), "the consumer was not closed");
    assert_eq!(
        *state.topics.lock(),
        vec!["topic1".to_string(), "topic2".to_string()]
    );

    assert_eq!(
        urls_rx.recv().await.unwrap(),
        "https://it.wikipedia.org/wiki/Francesco_Totti"
    );
    assert!(urls_rx.try_recv().is_err(), "exactly one URL expected");
    assert!(lag.lag("topic1") > 0, "lag should be non-zero once an event was seen");
    assert_eq!(metrics.events_received("test", EventStatus::Ok, "topic1"), 1);
}

#[tokio::test]
async fn expired_events_update_lag_but_are_not_dispatched() {
    let (consumer, _) = scripted(vec![message(GOOD_EVENT), bus_error()]);
    let metrics = Arc::new(Metrics::default());
    // Any max-age is far exceeded by an April 2020 timestamp.
    let reader = BusReader::new(
        consumer,
        vec!["topic1".to_string()],
        Duration::from_secs(1),
        metrics.clone(),
    );
    let lag = reader.lag_tracker();

    let (urls_tx, mut urls_rx) = mpsc::channel(4);
    let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (done_tx, done_rx) = oneshot::channel();

    let _ = reader.run(urls_tx, shutdown_rx, done_tx).await;
    done_rx.await.unwrap();

    assert!(urls_rx.try_recv().is_err(), "stale purge must not be dispatched");
    assert_eq!(metrics.events_received("test", EventStatus::Expired, "topic1"), 1);
    assert!(lag.lag("topic1") > 0, "even a discarded event registers its timestamp");
}

#[tokio::test]
async fn malformed_json_is_counted_and_skipped() {
    let (consumer, state) = scripted(vec![message("{]"), message(GOOD_EVENT), bus_error()]);
    let metrics = Arc::new(Metrics::default());
    let reader = BusReader::new(
        consumer,
        vec!["topic1".to_string()],
        Duration::ZERO,
        metrics.clone(),
    );

    let (urls_tx, mut urls_rx) = mpsc::channel(4);
    let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (done_tx, done_rx) = oneshot::channel();

    let _ = reader.run(urls_tx, shutdown_rx, done_tx).await;
    done_rx.await.unwrap();
    assert!(state.closed.load(Ordering::SeqCst));

    assert_eq!(
        urls_rx.recv().await.unwrap(),
        "https://it.wikipedia.org/wiki/Francesco_Totti"
    );
    assert!(urls_rx.try_recv().is_err());
    assert_eq!(metrics.events_received("", EventStatus::Discarded, "topic1"), 1);
    assert_eq!(metrics.events_received("", EventStatus::Ok, "topic1"), 1);
}

#[tokio::test]
async fn missing_uri_is_discarded_and_shutdown_is_clean() {
    let (consumer, state) = scripted(vec![message(NO_URI_EVENT)]);
    let metrics = Arc::new(Metrics::default());
    let reader = BusReader::new(
        consumer,
        vec!["topic1".to_string()],
        Duration::ZERO,
        metrics.clone(),
    );

    let (urls_tx, mut urls_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (done_tx, done_rx) = oneshot::channel();

    let handle = tokio::spawn(reader.run(urls_tx, shutdown_rx, done_tx));

    // Let the reader drain the scripted event, then ask it to stop.
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(()).await.unwrap();
    done_rx.await.unwrap();

    let outcome = handle.await.unwrap();
    assert!(outcome.is_ok(), "requested shutdown is not an error");
    assert!(state.closed.load(Ordering::SeqCst));
    assert!(urls_rx.try_recv().is_err(), "no URL for a message without one");
    assert_eq!(metrics.events_received("", EventStatus::Discarded, "topic1"), 1);
}

#[tokio::test]
async fn stats_blobs_land_in_the_stats_file() {
    let dir = tempfile::tempdir().unwrap();
    let stats_path = dir.path().join("bus-stats.json");

    let (consumer, _) = scripted(vec![BusEvent::Stats("{\"name\":\"purged\"}".to_string())]);
    let metrics = Arc::new(Metrics::default());
    let reader = BusReader::new(consumer, vec!["topic1".to_string()], Duration::ZERO, metrics)
        .stats_file(stats_path.clone());

    let (urls_tx, _urls_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (done_tx, done_rx) = oneshot::channel();

    let handle = tokio::spawn(reader.run(urls_tx, shutdown_rx, done_tx));

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !stats_path.exists() {
        assert!(std::time::Instant::now() < deadline, "stats file never appeared");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        std::fs::read_to_string(&stats_path).unwrap(),
        "{\"name\":\"purged\"}"
    );

    shutdown_tx.send(()).await.unwrap();
    done_rx.await.unwrap();
    assert!(handle.await.unwrap().is_ok());
}
