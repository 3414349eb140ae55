//! PURGE clients for the two cache tiers.
//!
//! Two transports share the same contract: send one PURGE, return the
//! response status code. The raw TCP variant owns a persistent connection
//! and replaces it on any read or write failure; the HTTP variant leans on
//! the client library's connection pooling. Callers pick a variant once at
//! worker startup.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HOST;
use reqwest::Method;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

use crate::metrics::Metrics;

/// Total request+response cycles per send before the URL is given up on.
const SEND_ATTEMPTS: usize = 10;
/// Reconnect backoff exponents: sleeps of 2^7..2^15 milliseconds.
const CONNECT_BACKOFF_EXP: std::ops::Range<u32> = 7..16;
/// The status line is expected within the first read.
const RESPONSE_BUF_LEN: usize = 4096;
/// Offset of the ASCII status code in the response buffer.
const STATUS_OFFSET: usize = 9;

#[derive(Debug, Error)]
pub enum PurgeError {
    #[error("failed purging {uri} (Host: {host}) after {SEND_ATTEMPTS} attempts")]
    AttemptsExhausted { host: String, uri: String },
    #[error("giving up connecting to {addr}")]
    ConnectExhausted { addr: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl PurgeError {
    /// Errors that must bring the process down instead of dropping one URL.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PurgeError::ConnectExhausted { .. })
    }
}

/// One purge transport, chosen at worker startup via the `nethttp` flag.
pub enum Purger {
    Tcp(TcpPurger),
    Http(HttpPurger),
}

impl Purger {
    /// Build a client for `addr`. The TCP variant dials here, so a worker
    /// that cannot establish its connection keeps the process from coming
    /// up.
    pub async fn connect(
        addr: &str,
        nethttp: bool,
        metrics: Arc<Metrics>,
    ) -> Result<Self, PurgeError> {
        if nethttp {
            Ok(Purger::Http(HttpPurger::new(addr)?))
        } else {
            Ok(Purger::Tcp(TcpPurger::connect(addr, metrics).await?))
        }
    }

    /// Send one PURGE and return the response status code.
    pub async fn send(&mut self, host: &str, uri: &str) -> Result<String, PurgeError> {
        match self {
            Purger::Tcp(purger) => purger.send(host, uri).await,
            Purger::Http(purger) => purger.send(host, uri).await,
        }
    }
}

/// Raw-TCP purge client owning one persistent connection.
pub struct TcpPurger {
    conn: TcpStream,
    dest_addr: String,
    metrics: Arc<Metrics>,
}

impl TcpPurger {
    /// Dial the destination with the standard backoff schedule.
    pub async fn connect(addr: &str, metrics: Arc<Metrics>) -> Result<Self, PurgeError> {
        let conn = conn_or_give_up(addr).await?;
        Ok(Self {
            conn,
            dest_addr: addr.to_string(),
            metrics,
        })
    }

    pub async fn send(&mut self, host: &str, uri: &str) -> Result<String, PurgeError> {
        let request = format!("PURGE {uri} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: purged\r\n\r\n");
        let mut buffer = [0u8; RESPONSE_BUF_LEN];

        for _ in 0..SEND_ATTEMPTS {
            if let Err(err) = self.conn.write_all(request.as_bytes()).await {
                self.metrics.inc_tcp_error(&write_error_type(&err));
                self.conn = conn_or_give_up(&self.dest_addr).await?;
                continue;
            }

            match self.conn.read(&mut buffer).await {
                Ok(n) if n >= STATUS_OFFSET + 3 => {
                    let status = &buffer[STATUS_OFFSET..STATUS_OFFSET + 3];
                    return Ok(String::from_utf8_lossy(status).into_owned());
                }
                Ok(0) => {
                    // Closed connections are common; the counter is enough.
                    self.metrics.inc_tcp_error("EOF");
                }
                Ok(n) => {
                    warn!("short response ({n} bytes) from {}", self.dest_addr);
                    self.metrics.inc_tcp_error("read");
                }
                Err(err) => {
                    self.metrics.inc_tcp_error(&read_error_type(&err));
                }
            }
            self.conn = conn_or_give_up(&self.dest_addr).await?;
        }

        Err(PurgeError::AttemptsExhausted {
            host: host.to_string(),
            uri: uri.to_string(),
        })
    }
}

/// Dial with exponential backoff, sleeping 128ms..32768ms between attempts.
/// Spending the whole budget is fatal to the caller.
async fn conn_or_give_up(addr: &str) -> Result<TcpStream, PurgeError> {
    for exp in CONNECT_BACKOFF_EXP {
        match TcpStream::connect(addr).await {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                let retry_in = Duration::from_millis(1u64 << exp);
                warn!(
                    "error connecting to {addr}: {err}. Reconnecting in {} milliseconds",
                    retry_in.as_millis()
                );
                tokio::time::sleep(retry_in).await;
            }
        }
    }
    Err(PurgeError::ConnectExhausted {
        addr: addr.to_string(),
    })
}

/// Common socket-level failures are only counted, under the OS error string
/// their kind maps to; anything outside that set keeps its own kind label
/// and is also logged once.
fn write_error_type(err: &io::Error) -> String {
    match kind_label(err.kind()) {
        Some(label) => label.to_string(),
        None => {
            warn!("write error: {err}");
            err.kind().to_string()
        }
    }
}

fn read_error_type(err: &io::Error) -> String {
    match kind_label(err.kind()) {
        Some(label) => label.to_string(),
        None => {
            warn!("read error: {err}");
            err.kind().to_string()
        }
    }
}

fn kind_label(kind: io::ErrorKind) -> Option<&'static str> {
    match kind {
        io::ErrorKind::BrokenPipe => Some("broken pipe"),
        io::ErrorKind::ConnectionReset => Some("connection reset by peer"),
        io::ErrorKind::ConnectionAborted => Some("connection aborted"),
        io::ErrorKind::ConnectionRefused => Some("connection refused"),
        io::ErrorKind::NotConnected => Some("not connected"),
        io::ErrorKind::AddrNotAvailable => Some("cannot assign requested address"),
        io::ErrorKind::HostUnreachable => Some("no route to host"),
        io::ErrorKind::NetworkUnreachable => Some("network is unreachable"),
        io::ErrorKind::NetworkDown => Some("network is down"),
        io::ErrorKind::TimedOut => Some("timed out"),
        io::ErrorKind::WouldBlock => Some("resource temporarily unavailable"),
        _ => None,
    }
}

/// HTTP purge client; connection reuse is handled by the library pool, kept
/// to a single idle connection per destination.
pub struct HttpPurger {
    client: reqwest::Client,
    method: Method,
    dest_addr: String,
}

impl HttpPurger {
    pub fn new(addr: &str) -> Result<Self, PurgeError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .build()?;
        let method = Method::from_bytes(b"PURGE").expect("PURGE is a valid method token");
        Ok(Self {
            client,
            method,
            dest_addr: addr.to_string(),
        })
    }

    pub async fn send(&self, host: &str, uri: &str) -> Result<String, PurgeError> {
        let url = format!("http://{}{}", self.dest_addr, uri);
        let response = self
            .client
            .request(self.method.clone(), &url)
            .header(HOST, host)
            .send()
            .await?;
        let status = response.status().as_u16().to_string();
        // Read and discard the body so the connection can be reused.
        response.bytes().await?;
        Ok(status)
    }
}
