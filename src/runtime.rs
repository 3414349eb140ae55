//! Runtime wiring: channels, readers, worker pools, the backlog sampler and
//! process shutdown.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::info;
use url::Url;

use crate::bus::{BusReader, LagTracker};
use crate::config::Config;
use crate::kafka::KafkaConsumer;
use crate::metrics::{Layer, Metrics};
use crate::multicast::{MulticastReader, DEFAULT_MAX_DATAGRAM_SIZE};
use crate::workers::{self, PoolConfig};

/// Capacity of the ingress and frontend channels. The bound is the intended
/// backpressure surface for both readers.
pub const BUFFER_LEN: usize = 1_000_000;

/// Wires every stage of the purge pipeline and runs until shutdown.
pub struct Runtime {
    config: Config,
    metrics: Arc<Metrics>,
}

impl Runtime {
    pub fn new(config: Config, metrics: Arc<Metrics>) -> Self {
        Self { config, metrics }
    }

    /// Run the pipeline. Returns on a delivered signal (graceful) or the
    /// first fatal task failure.
    pub async fn run(self) -> Result<()> {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        let (ingress_tx, ingress_rx) = mpsc::channel::<String>(BUFFER_LEN);
        let (frontend_tx, frontend_rx) = mpsc::channel::<Url>(BUFFER_LEN);

        // Multicast ingress.
        let reader = MulticastReader {
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            kbuf_size: self.config.mcast_bufsize,
            mcast_addrs: self.config.mcast_addrs.clone(),
        };
        tasks.spawn(reader.read(ingress_tx.clone(), self.metrics.clone()));

        // Bus ingress, when topics are configured.
        let mut bus_shutdown = None;
        let mut lag: Option<Arc<LagTracker>> = None;
        if !self.config.topics.is_empty() {
            info!("listening for topics {:?}", self.config.topics);
            let consumer = KafkaConsumer::from_config_file(&self.config.kafka_config)?;
            let bus_reader = BusReader::new(
                consumer,
                self.config.topics.clone(),
                self.config.purge_max_age,
                self.metrics.clone(),
            );
            lag = Some(bus_reader.lag_tracker());

            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            let (done_tx, done_rx) = oneshot::channel();
            bus_shutdown = Some((shutdown_tx, done_rx));

            let urls = ingress_tx.clone();
            tasks.spawn(async move { bus_reader.run(urls, shutdown_rx, done_tx).await });
        }

        // Worker pools.
        let pool = PoolConfig {
            backend_addr: self.config.backend_addr.clone(),
            frontend_addr: self.config.frontend_addr.clone(),
            n_backend: self.config.backend_workers,
            n_frontend: self.config.frontend_workers,
            frontend_delay: self.config.frontend_delay,
            host_regex: self.config.host_regex.clone(),
            nethttp: self.config.nethttp,
        };
        workers::start_workers(
            &pool,
            workers::shared(ingress_rx),
            frontend_tx.clone(),
            workers::shared(frontend_rx),
            self.metrics.clone(),
            &mut tasks,
        );
        info!(
            "process purged started with {} backend and {} frontend workers",
            pool.n_backend, pool.n_frontend
        );

        // Backlog and lag sampler.
        {
            let metrics = self.metrics.clone();
            let ingress = ingress_tx.clone();
            let frontend = frontend_tx.clone();
            let topics = self.config.topics.clone();
            let lag = lag.clone();
            tasks.spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tick.tick().await;
                    metrics.set_backlog(Layer::Backend, queue_depth(&ingress));
                    metrics.set_backlog(Layer::Frontend, queue_depth(&frontend));
                    if let Some(lag) = &lag {
                        for topic in &topics {
                            metrics.set_event_lag(topic, lag.lag(topic));
                        }
                    }
                }
            });
        }

        // Wait for a signal or the first task failure.
        let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("exiting on signal SIGINT");
                    return drain_bus(bus_shutdown).await;
                }
                _ = sigterm.recv() => {
                    info!("exiting on signal SIGTERM");
                    return drain_bus(bus_shutdown).await;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(Ok(()))) => continue,
                    Some(Ok(Err(err))) => return Err(err),
                    Some(Err(err)) => return Err(anyhow!("pipeline task failed: {err}")),
                    None => return Ok(()),
                },
            }
        }
    }
}

/// Ask the bus reader to stop and wait until it has closed its consumer.
async fn drain_bus(bus: Option<(mpsc::Sender<()>, oneshot::Receiver<()>)>) -> Result<()> {
    if let Some((shutdown_tx, done_rx)) = bus {
        let _ = shutdown_tx.send(()).await;
        let _ = done_rx.await;
    }
    Ok(())
}

fn queue_depth<T>(sender: &mpsc::Sender<T>) -> u64 {
    (sender.max_capacity() - sender.capacity()) as u64
}
