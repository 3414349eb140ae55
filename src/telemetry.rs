//! Logging setup and the metrics observation endpoint.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload};

use crate::metrics::Metrics;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initialize JSON logging with a reloadable level.
pub fn init_tracing(log_level: Option<&str>) -> Result<LogHandle> {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let fmt_layer = fmt::layer().json().with_target(true);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

/// Start a minimal HTTP endpoint serving metrics, health, and loglevel
/// controls. Returns the bound address.
pub async fn start_http(
    bind: &str,
    metrics: Arc<Metrics>,
    log_handle: Option<LogHandle>,
) -> Result<std::net::SocketAddr> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind metrics endpoint on {bind}"))?;
    let addr = listener.local_addr()?;
    tracing::info!("metrics endpoint listening on {addr}");
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let metrics = metrics.clone();
                    let log_handle = log_handle.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_conn(&mut socket, metrics, log_handle).await {
                            tracing::warn!("metrics handler error: {err:?}");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!("metrics accept error: {err:?}");
                }
            }
        }
    });
    Ok(addr)
}

async fn handle_conn(
    socket: &mut tokio::net::TcpStream,
    metrics: Arc<Metrics>,
    log_handle: Option<LogHandle>,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let n = socket.read(&mut buf).await?;
    let req = String::from_utf8_lossy(&buf[..n]);
    let first = req.lines().next().unwrap_or("");
    let path = first
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .splitn(2, '?')
        .collect::<Vec<_>>();
    let route = path[0];
    let query = if path.len() > 1 { path[1] } else { "" };
    let (status, body, content_type) = match route {
        "/metrics" => (200, metrics.render(), "text/plain; version=0.0.4"),
        "/healthz" => (200, "ok".to_string(), "text/plain"),
        "/v1/loglevel" => {
            if let Some(handle) = log_handle {
                if let Some(level) = query.strip_prefix("level=") {
                    if let Ok(filter) = EnvFilter::try_new(level) {
                        let _ = handle.modify(|f| *f = filter);
                    }
                }
            }
            (200, "{\"status\":\"ok\"}".to_string(), "application/json")
        }
        _ => (404, "not found".to_string(), "text/plain"),
    };
    let resp = format!(
        "HTTP/1.1 {} OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    socket.write_all(resp.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket
            .write_all(format!("GET {path} HTTP/1.0\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = Vec::new();
        socket.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn serves_the_metrics_page() {
        let metrics = Arc::new(Metrics::default());
        metrics.add_udp_bytes(42);
        let addr = start_http("127.0.0.1:0", metrics, None).await.unwrap();

        let response = get(addr, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("purged_udp_bytes_read_total 42"));

        let response = get(addr, "/healthz").await;
        assert!(response.contains("ok"));

        let response = get(addr, "/nope").await;
        assert!(response.starts_with("HTTP/1.1 404"));
    }
}
