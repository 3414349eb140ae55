//! Backend and frontend purge worker pools.
//!
//! Backend workers drain the ingress channel, purge the backend tier and
//! schedule the frontend handoff on an independent timer, so a large delay
//! never stalls the backend. Frontend workers drain the frontend channel and
//! purge the edge.

use anyhow::Result;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::warn;
use url::Url;

use crate::metrics::{Layer, Metrics};
use crate::purge::Purger;

/// Receiver shared by a worker cohort; FIFO handoff, one consumer at a time.
pub type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

pub fn shared<T>(receiver: mpsc::Receiver<T>) -> SharedReceiver<T> {
    Arc::new(Mutex::new(receiver))
}

/// Worker pool configuration, immutable after start.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub backend_addr: String,
    pub frontend_addr: String,
    pub n_backend: usize,
    pub n_frontend: usize,
    pub frontend_delay: Duration,
    pub host_regex: Option<Regex>,
    pub nethttp: bool,
}

/// Request URI for a purge: path plus raw query; the fragment is discarded.
pub fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) if !query.is_empty() => format!("{}?{}", url.path(), query),
        _ => url.path().to_string(),
    }
}

/// Spawn both worker cohorts onto the given task set.
pub fn start_workers(
    pool: &PoolConfig,
    ingress: SharedReceiver<String>,
    frontend_tx: mpsc::Sender<Url>,
    frontend_rx: SharedReceiver<Url>,
    metrics: Arc<Metrics>,
    tasks: &mut JoinSet<Result<()>>,
) {
    for _ in 0..pool.n_backend {
        tasks.spawn(backend_worker(
            pool.backend_addr.clone(),
            ingress.clone(),
            frontend_tx.clone(),
            pool.host_regex.clone(),
            pool.frontend_delay,
            pool.nethttp,
            metrics.clone(),
        ));
    }
    for _ in 0..pool.n_frontend {
        tasks.spawn(frontend_worker(
            pool.frontend_addr.clone(),
            frontend_rx.clone(),
            pool.nethttp,
            metrics.clone(),
        ));
    }
}

/// Purge the backend tier for every URL pulled off the ingress channel, then
/// hand the parsed URL to the frontend workers once the delay has elapsed.
pub async fn backend_worker(
    addr: String,
    ingress: SharedReceiver<String>,
    frontend_tx: mpsc::Sender<Url>,
    host_regex: Option<Regex>,
    frontend_delay: Duration,
    nethttp: bool,
    metrics: Arc<Metrics>,
) -> Result<()> {
    let mut backend = Purger::connect(&addr, nethttp, metrics.clone()).await?;

    loop {
        let raw = { ingress.lock().await.recv().await };
        let Some(raw) = raw else { return Ok(()) };

        let url = match Url::parse(&raw) {
            Ok(url) => url,
            Err(err) => {
                warn!("error parsing {raw}: {err}");
                continue;
            }
        };

        let host = url.host_str().unwrap_or_default().to_string();
        if let Some(regex) = &host_regex {
            if !regex.is_match(&host) {
                continue;
            }
        }

        send_and_record(&mut backend, &host, &request_uri(&url), Layer::Backend, &metrics).await?;

        // The timer runs on its own task so the worker keeps draining while
        // the handoff waits out the delay.
        let frontend_tx = frontend_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(frontend_delay).await;
            let _ = frontend_tx.send(url).await;
        });
    }
}

/// Purge the frontend tier for every URL handed off by the backend workers.
pub async fn frontend_worker(
    addr: String,
    urls: SharedReceiver<Url>,
    nethttp: bool,
    metrics: Arc<Metrics>,
) -> Result<()> {
    let mut frontend = Purger::connect(&addr, nethttp, metrics.clone()).await?;

    loop {
        let url = { urls.lock().await.recv().await };
        let Some(url) = url else { return Ok(()) };

        let host = url.host_str().unwrap_or_default().to_string();
        send_and_record(&mut frontend, &host, &request_uri(&url), Layer::Frontend, &metrics).await?;
    }
}

/// Send one purge, recording the outcome. Send failures cost the URL but not
/// the worker; reconnect exhaustion is propagated and brings the process
/// down.
async fn send_and_record(
    purger: &mut Purger,
    host: &str,
    uri: &str,
    layer: Layer,
    metrics: &Metrics,
) -> Result<()> {
    let status = match purger.send(host, uri).await {
        Ok(status) => status,
        Err(err) if err.is_fatal() => return Err(err.into()),
        Err(err) => {
            warn!("error purging {}: {err}", layer.as_str());
            String::new()
        }
    };
    metrics.inc_http_request(&status, layer);
    Ok(())
}
