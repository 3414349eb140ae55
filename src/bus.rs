//! Message-bus ingress: the consumer interface, event dispatch, and
//! per-topic lag tracking.
//!
//! The bus client library is consumed strictly through [`BusConsumer`], a
//! minimal surface of opaque events, which also lets tests drive the reader
//! without a live broker.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::event::ResourceChange;
use crate::metrics::{EventStatus, Metrics};
use crate::time::{Clock, SystemClock};

/// Stats blob drop point for the external bus metrics exporter.
pub const BUS_STATS_FILE: &str = "/tmp/purged-kafka-stats.json";

/// One event surfaced by the bus client.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A message on a subscribed topic.
    Message {
        topic: Option<String>,
        payload: Vec<u8>,
    },
    /// Client statistics blob, destined for the external exporter.
    Stats(String),
    /// Client-level error; ends consumption.
    Error { code: i32, message: String },
}

/// The minimal API we expect from a bus consumer client.
#[async_trait]
pub trait BusConsumer: Send {
    fn subscribe(&mut self, topics: &[String]) -> Result<()>;
    /// The next event, or `None` when the client stream has ended.
    async fn next_event(&mut self) -> Option<BusEvent>;
    fn close(&mut self) -> Result<()>;
}

/// Newest effective timestamp seen per topic; a coarse measure of how far
/// behind the feed we are.
pub struct LagTracker<K = SystemClock> {
    maxts: RwLock<HashMap<String, DateTime<Utc>>>,
    clock: K,
}

impl<K: Clock> LagTracker<K> {
    pub fn new(clock: K) -> Self {
        Self {
            maxts: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Register a timestamp. The mapping is monotone per topic.
    pub fn record(&self, ts: DateTime<Utc>, topic: &str) {
        let mut maxts = self.maxts.write();
        match maxts.get_mut(topic) {
            Some(current) if *current >= ts => {}
            Some(current) => *current = ts,
            None => {
                maxts.insert(topic.to_string(), ts);
            }
        }
    }

    /// Lag in nanoseconds since the newest event seen on the topic; zero
    /// while nothing has been observed.
    pub fn lag(&self, topic: &str) -> u64 {
        let Some(ts) = self.maxts.read().get(topic).copied() else {
            return 0;
        };
        match (self.clock.now() - ts).num_nanoseconds() {
            Some(nanos) if nanos >= 0 => nanos as u64,
            Some(nanos) => {
                // A max-seen timestamp ahead of the clock means skew or a
                // future-dated event; saturating, but worth surfacing.
                warn!(
                    "newest event on {topic} is {}ns ahead of the local clock",
                    -nanos
                );
                0
            }
            None => i64::MAX as u64,
        }
    }
}

/// Reads purge events from the bus and feeds URLs to the ingress channel.
pub struct BusReader<C, K: Clock = SystemClock> {
    consumer: C,
    topics: Vec<String>,
    /// Events older than this are not dispatched; zero disables the gate.
    max_age: Duration,
    lag: Arc<LagTracker<K>>,
    metrics: Arc<Metrics>,
    clock: K,
    stats_file: PathBuf,
}

impl<C: BusConsumer> BusReader<C> {
    pub fn new(consumer: C, topics: Vec<String>, max_age: Duration, metrics: Arc<Metrics>) -> Self {
        Self::with_clock(consumer, topics, max_age, metrics, SystemClock)
    }
}

impl<C: BusConsumer, K: Clock> BusReader<C, K> {
    pub fn with_clock(
        consumer: C,
        topics: Vec<String>,
        max_age: Duration,
        metrics: Arc<Metrics>,
        clock: K,
    ) -> Self {
        Self {
            consumer,
            topics,
            max_age,
            lag: Arc::new(LagTracker::new(clock.clone())),
            metrics,
            clock,
            stats_file: PathBuf::from(BUS_STATS_FILE),
        }
    }

    /// Override the stats drop point.
    pub fn stats_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stats_file = path.into();
        self
    }

    /// Shared lag handle for the metrics sampler.
    pub fn lag_tracker(&self) -> Arc<LagTracker<K>> {
        self.lag.clone()
    }

    /// Consume events until shutdown is requested or the client reports a
    /// fatal error. Always closes the consumer and signals `done` before
    /// returning.
    pub async fn run(
        mut self,
        urls: mpsc::Sender<String>,
        mut shutdown: mpsc::Receiver<()>,
        done: oneshot::Sender<()>,
    ) -> Result<()> {
        self.consumer
            .subscribe(&self.topics)
            .with_context(|| format!("could not subscribe the topics {:?}", self.topics))?;
        info!("start consuming topics {:?} from the bus", self.topics);

        let mut outcome = Ok(());
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = self.consumer.next_event() => match event {
                    Some(BusEvent::Message { topic, payload }) => {
                        self.handle_message(topic, &payload, &urls).await;
                    }
                    Some(BusEvent::Stats(stats)) => self.export_stats(stats),
                    Some(BusEvent::Error { code, message }) => {
                        error!("error (code {code}) reading from the bus: {message}");
                        outcome = Err(anyhow!("bus reported a fatal error (code {code})"));
                        break;
                    }
                    None => {
                        outcome = Err(anyhow!("bus event stream ended unexpectedly"));
                        break;
                    }
                },
            }
        }

        let closed = self.consumer.close();
        // Signal completion so the main task can finish shutting down.
        let _ = done.send(());
        closed.context("closing the bus consumer")?;
        outcome
    }

    async fn handle_message(
        &self,
        topic: Option<String>,
        payload: &[u8],
        urls: &mpsc::Sender<String>,
    ) {
        let topic = topic.unwrap_or_else(|| "-".to_string());
        let (tag, status) = match ResourceChange::from_json(payload) {
            Err(err) => {
                warn!("could not decode the message: {err}");
                (String::new(), EventStatus::Discarded)
            }
            Ok(change) => {
                let tag = change.tag().unwrap_or_default().to_string();
                // Lag is tracked for every decodable event, dispatched or
                // not.
                self.lag.record(change.timestamp(), &topic);

                if self.is_expired(&change) {
                    (tag, EventStatus::Expired)
                } else {
                    if urls.send(change.url().to_string()).await.is_err() {
                        debug!("ingress channel closed, dropping {}", change.url());
                    }
                    (tag, EventStatus::Ok)
                }
            }
        };
        self.metrics.inc_event(&tag, status, &topic);
    }

    fn is_expired(&self, change: &ResourceChange) -> bool {
        if self.max_age.is_zero() {
            return false;
        }
        let age = self.clock.now() - change.timestamp();
        age.to_std().map_or(false, |age| age > self.max_age)
    }

    fn export_stats(&self, stats: String) {
        let path = self.stats_file.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::fs::write(&path, stats).await {
                warn!("unable to save the bus stats file: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn lag_is_zero_until_an_event_is_seen() {
        let tracker = LagTracker::new(SystemClock);
        assert_eq!(tracker.lag("topic1"), 0);

        let a_month_ago = Utc::now() - chrono::Duration::days(30);
        tracker.record(a_month_ago, "topic1");
        assert!(tracker.lag("topic1") > 0);
        // other topics stay unset
        assert_eq!(tracker.lag("topic2"), 0);
    }

    #[test]
    fn lag_mapping_is_monotone_per_topic() {
        let tracker = LagTracker::new(SystemClock);
        let newer = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
        let older = Utc.with_ymd_and_hms(2020, 4, 30, 11, 37, 53).unwrap();

        tracker.record(newer, "topic1");
        let lag_after_newer = tracker.lag("topic1");
        tracker.record(older, "topic1");
        // an older event must not move the high-water mark backwards
        assert!(tracker.lag("topic1") <= lag_after_newer + 1_000_000_000);
        tracker.record(older, "topic2");
        assert!(tracker.lag("topic2") > tracker.lag("topic1"));
    }
}
