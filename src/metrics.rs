//! Process-wide counters and gauges, exposed in Prometheus text format.
//!
//! Counters are plain atomics; labeled families live behind a
//! `parking_lot::RwLock` so every pipeline stage can update them without
//! coordination. The exposition endpoint renders the whole registry with
//! [`Metrics::render`].

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache tier a purge request was sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Layer {
    Backend,
    Frontend,
}

impl Layer {
    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Backend => "backend",
            Layer::Frontend => "frontend",
        }
    }
}

/// Decode outcome of one HTCP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    Good,
    Bad,
}

impl PacketState {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketState::Good => "good",
            PacketState::Bad => "bad",
        }
    }
}

/// Outcome of one bus event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Decoded and dispatched to the ingress channel.
    Ok,
    /// Decoded but older than the configured maximum age.
    Expired,
    /// Could not be decoded.
    Discarded,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Ok => "ok",
            EventStatus::Expired => "expired",
            EventStatus::Discarded => "discarded",
        }
    }
}

/// Registry of every counter and gauge the dispatcher reports.
#[derive(Default)]
pub struct Metrics {
    /// status, layer -> count
    http_requests: RwLock<BTreeMap<(String, Layer), u64>>,
    /// error type -> count
    tcp_errors: RwLock<BTreeMap<String, u64>>,
    htcp_good: AtomicU64,
    htcp_bad: AtomicU64,
    udp_bytes_read: AtomicU64,
    backlog_backend: AtomicU64,
    backlog_frontend: AtomicU64,
    /// tag, status, topic -> count
    events_received: RwLock<BTreeMap<(String, String, String), u64>>,
    /// topic -> lag in nanoseconds
    event_lag: RwLock<BTreeMap<String, u64>>,
}

impl Metrics {
    pub fn inc_http_request(&self, status: &str, layer: Layer) {
        *self
            .http_requests
            .write()
            .entry((status.to_string(), layer))
            .or_insert(0) += 1;
    }

    pub fn inc_tcp_error(&self, error_type: &str) {
        *self
            .tcp_errors
            .write()
            .entry(error_type.to_string())
            .or_insert(0) += 1;
    }

    pub fn inc_htcp_packet(&self, state: PacketState) {
        match state {
            PacketState::Good => self.htcp_good.fetch_add(1, Ordering::Relaxed),
            PacketState::Bad => self.htcp_bad.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn add_udp_bytes(&self, n: u64) {
        self.udp_bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_backlog(&self, layer: Layer, depth: u64) {
        match layer {
            Layer::Backend => self.backlog_backend.store(depth, Ordering::Relaxed),
            Layer::Frontend => self.backlog_frontend.store(depth, Ordering::Relaxed),
        }
    }

    pub fn inc_event(&self, tag: &str, status: EventStatus, topic: &str) {
        *self
            .events_received
            .write()
            .entry((
                tag.to_string(),
                status.as_str().to_string(),
                topic.to_string(),
            ))
            .or_insert(0) += 1;
    }

    pub fn set_event_lag(&self, topic: &str, nanos: u64) {
        self.event_lag.write().insert(topic.to_string(), nanos);
    }

    pub fn http_requests(&self, status: &str, layer: Layer) -> u64 {
        self.http_requests
            .read()
            .get(&(status.to_string(), layer))
            .copied()
            .unwrap_or(0)
    }

    pub fn tcp_errors(&self, error_type: &str) -> u64 {
        self.tcp_errors.read().get(error_type).copied().unwrap_or(0)
    }

    pub fn htcp_packets(&self, state: PacketState) -> u64 {
        match state {
            PacketState::Good => self.htcp_good.load(Ordering::Relaxed),
            PacketState::Bad => self.htcp_bad.load(Ordering::Relaxed),
        }
    }

    pub fn events_received(&self, tag: &str, status: EventStatus, topic: &str) -> u64 {
        self.events_received
            .read()
            .get(&(
                tag.to_string(),
                status.as_str().to_string(),
                topic.to_string(),
            ))
            .copied()
            .unwrap_or(0)
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);

        out.push_str("# HELP purged_http_requests_total Total number of HTTP PURGE sent by status code\n");
        out.push_str("# TYPE purged_http_requests_total counter\n");
        for ((status, layer), count) in self.http_requests.read().iter() {
            let _ = writeln!(
                out,
                "purged_http_requests_total{{status=\"{}\",layer=\"{}\"}} {}",
                status,
                layer.as_str(),
                count
            );
        }

        out.push_str("# HELP purged_tcp_errors_total Total number of TCP read/write errors\n");
        out.push_str("# TYPE purged_tcp_errors_total counter\n");
        for (error_type, count) in self.tcp_errors.read().iter() {
            let _ = writeln!(
                out,
                "purged_tcp_errors_total{{type=\"{}\"}} {}",
                error_type, count
            );
        }

        out.push_str("# HELP purged_backlog Number of messages still to be processed by backend and frontend workers\n");
        out.push_str("# TYPE purged_backlog gauge\n");
        let _ = writeln!(
            out,
            "purged_backlog{{layer=\"backend\"}} {}",
            self.backlog_backend.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "purged_backlog{{layer=\"frontend\"}} {}",
            self.backlog_frontend.load(Ordering::Relaxed)
        );

        out.push_str("# HELP purged_htcp_packets_total Total number of HTCP packets received\n");
        out.push_str("# TYPE purged_htcp_packets_total counter\n");
        let _ = writeln!(
            out,
            "purged_htcp_packets_total{{state=\"good\"}} {}",
            self.htcp_good.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "purged_htcp_packets_total{{state=\"bad\"}} {}",
            self.htcp_bad.load(Ordering::Relaxed)
        );

        out.push_str("# HELP purged_udp_bytes_read_total Total number of UDP bytes read\n");
        out.push_str("# TYPE purged_udp_bytes_read_total counter\n");
        let _ = writeln!(
            out,
            "purged_udp_bytes_read_total {}",
            self.udp_bytes_read.load(Ordering::Relaxed)
        );

        out.push_str("# HELP purged_events_received_total Total number of events received from the bus\n");
        out.push_str("# TYPE purged_events_received_total counter\n");
        for ((tag, status, topic), count) in self.events_received.read().iter() {
            let _ = writeln!(
                out,
                "purged_events_received_total{{tag=\"{}\",status=\"{}\",topic=\"{}\"}} {}",
                tag, status, topic, count
            );
        }

        out.push_str("# HELP purged_event_lag Time passed since the most recent processed event\n");
        out.push_str("# TYPE purged_event_lag gauge\n");
        for (topic, nanos) in self.event_lag.read().iter() {
            let _ = writeln!(out, "purged_event_lag{{topic=\"{}\"}} {}", topic, nanos);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::default();
        metrics.inc_http_request("200", Layer::Backend);
        metrics.inc_http_request("200", Layer::Backend);
        metrics.inc_http_request("", Layer::Frontend);
        assert_eq!(metrics.http_requests("200", Layer::Backend), 2);
        assert_eq!(metrics.http_requests("", Layer::Frontend), 1);
        assert_eq!(metrics.http_requests("404", Layer::Backend), 0);

        metrics.inc_htcp_packet(PacketState::Good);
        metrics.inc_htcp_packet(PacketState::Bad);
        metrics.inc_htcp_packet(PacketState::Bad);
        assert_eq!(metrics.htcp_packets(PacketState::Good), 1);
        assert_eq!(metrics.htcp_packets(PacketState::Bad), 2);
    }

    #[test]
    fn render_exposition_format() {
        let metrics = Metrics::default();
        metrics.inc_http_request("200", Layer::Backend);
        metrics.inc_tcp_error("EOF");
        metrics.add_udp_bytes(512);
        metrics.set_backlog(Layer::Backend, 7);
        metrics.inc_event("test", EventStatus::Ok, "topic1");
        metrics.set_event_lag("topic1", 1_000_000);

        let body = metrics.render();
        assert!(body.contains("purged_http_requests_total{status=\"200\",layer=\"backend\"} 1"));
        assert!(body.contains("purged_tcp_errors_total{type=\"EOF\"} 1"));
        assert!(body.contains("purged_backlog{layer=\"backend\"} 7"));
        assert!(body.contains("purged_backlog{layer=\"frontend\"} 0"));
        assert!(body.contains("purged_htcp_packets_total{state=\"good\"} 0"));
        assert!(body.contains("purged_udp_bytes_read_total 512"));
        assert!(body
            .contains("purged_events_received_total{tag=\"test\",status=\"ok\",topic=\"topic1\"} 1"));
        assert!(body.contains("purged_event_lag{topic=\"topic1\"} 1000000"));
        assert!(body.contains("# TYPE purged_backlog gauge"));
    }

    #[test]
    fn backlog_gauge_overwrites() {
        let metrics = Metrics::default();
        metrics.set_backlog(Layer::Frontend, 10);
        metrics.set_backlog(Layer::Frontend, 3);
        assert!(metrics.render().contains("purged_backlog{layer=\"frontend\"} 3"));
    }
}
