//! Kafka-backed implementation of the bus consumer interface.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::message::Message as _;
use std::path::Path;
use tokio::sync::mpsc;

use crate::bus::{BusConsumer, BusEvent};
use crate::config;

/// Forwards librdkafka statistics callbacks into the event stream, so the
/// reader can hand them to the external exporter.
struct StatsForwarder {
    stats_tx: mpsc::UnboundedSender<String>,
}

impl ClientContext for StatsForwarder {
    fn stats_raw(&self, statistics: &[u8]) {
        let _ = self
            .stats_tx
            .send(String::from_utf8_lossy(statistics).into_owned());
    }
}

impl ConsumerContext for StatsForwarder {}

/// Kafka consumer speaking the bus interface.
pub struct KafkaConsumer {
    inner: StreamConsumer<StatsForwarder>,
    stats_rx: mpsc::UnboundedReceiver<String>,
}

impl KafkaConsumer {
    /// Build a consumer from the opaque JSON configuration map.
    pub fn from_config_file(path: &Path) -> Result<Self> {
        let (stats_tx, stats_rx) = mpsc::unbounded_channel();
        let mut client_config = ClientConfig::new();
        for (key, value) in config::load_bus_config(path)? {
            client_config.set(key, value);
        }
        let inner = client_config
            .create_with_context(StatsForwarder { stats_tx })
            .context("unable to create a bus consumer from the configuration")?;
        Ok(Self { inner, stats_rx })
    }
}

#[async_trait]
impl BusConsumer for KafkaConsumer {
    fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.inner.subscribe(&topics)?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<BusEvent> {
        tokio::select! {
            stats = self.stats_rx.recv() => stats.map(BusEvent::Stats),
            message = self.inner.recv() => Some(match message {
                Ok(message) => BusEvent::Message {
                    topic: Some(message.topic().to_string()),
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                },
                Err(err) => BusEvent::Error {
                    code: err.rdkafka_error_code().map_or(-1, |code| code as i32),
                    message: err.to_string(),
                },
            }),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.inner.unsubscribe();
        Ok(())
    }
}
