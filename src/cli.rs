//! Command-line flag definitions using clap.

use clap::Parser;
use std::path::PathBuf;

/// purged - send HTTP PURGE requests for multicast HTCP and message-bus
/// purge notifications.
#[derive(Debug, Parser)]
#[command(name = "purged")]
#[command(version)]
#[command(about = "Cache invalidation dispatcher for a two-tier cache hierarchy")]
pub struct Args {
    /// Cache frontend address
    #[arg(long = "frontend_addr", default_value = "127.0.0.1:80")]
    pub frontend_addr: String,

    /// Cache backend address
    #[arg(long = "backend_addr", default_value = "127.0.0.1:3128")]
    pub backend_addr: String,

    /// Comma separated list of multicast addresses
    #[arg(long = "mcast_addrs", default_value = "239.128.0.112,239.128.0.115")]
    pub mcast_addrs: String,

    /// Multicast reader kernel buffer size
    #[arg(long = "mcast_bufsize", default_value_t = 16_777_216)]
    pub mcast_bufsize: usize,

    /// TCP network address for prometheus metrics
    #[arg(long = "prometheus_addr", default_value = ":2112")]
    pub prometheus_addr: String,

    /// Regex filter for valid purge hostnames (default unfiltered)
    #[arg(long = "host_regex", default_value = "")]
    pub host_regex: String,

    /// Number of backend purger workers
    #[arg(long = "backend_workers", default_value_t = 4)]
    pub backend_workers: usize,

    /// Number of frontend purger workers
    #[arg(long = "frontend_workers", default_value_t = 1)]
    pub frontend_workers: usize,

    /// Delay in milliseconds between backend and frontend PURGE
    #[arg(long = "frontend_delay", default_value_t = 1000)]
    pub frontend_delay: u64,

    /// Use the HTTP client transport instead of raw TCP
    #[arg(long = "nethttp")]
    pub nethttp: bool,

    /// Optional, comma-separated list of bus topics to listen to
    #[arg(long = "topics", default_value = "")]
    pub topics: String,

    /// Bus client configuration file
    #[arg(long = "kafkaConfig", default_value = "/etc/purgedkafka.conf")]
    pub kafka_config: PathBuf,

    /// Drop purge events older than this many seconds (0 disables the gate)
    #[arg(long = "purgeMaxAge", default_value_t = 0)]
    pub purge_max_age: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let args = Args::parse_from(["purged"]);
        assert_eq!(args.frontend_addr, "127.0.0.1:80");
        assert_eq!(args.backend_addr, "127.0.0.1:3128");
        assert_eq!(args.mcast_addrs, "239.128.0.112,239.128.0.115");
        assert_eq!(args.mcast_bufsize, 16_777_216);
        assert_eq!(args.prometheus_addr, ":2112");
        assert_eq!(args.host_regex, "");
        assert_eq!(args.backend_workers, 4);
        assert_eq!(args.frontend_workers, 1);
        assert_eq!(args.frontend_delay, 1000);
        assert!(!args.nethttp);
        assert_eq!(args.topics, "");
        assert_eq!(args.kafka_config, PathBuf::from("/etc/purgedkafka.conf"));
        assert_eq!(args.purge_max_age, 0);
    }

    #[test]
    fn flags_accept_overrides() {
        let args = Args::parse_from([
            "purged",
            "--backend_addr",
            "10.0.0.1:3128",
            "--topics",
            "purge.one,purge.two",
            "--purgeMaxAge",
            "60",
            "--nethttp",
        ]);
        assert_eq!(args.backend_addr, "10.0.0.1:3128");
        assert_eq!(args.topics, "purge.one,purge.two");
        assert_eq!(args.purge_max_age, 60);
        assert!(args.nethttp);
    }
}
