//! Runtime configuration derived from command-line flags, plus the opaque
//! bus client configuration map.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Args;

/// Validated, immutable configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct Config {
    pub frontend_addr: String,
    pub backend_addr: String,
    pub mcast_addrs: Vec<Ipv4Addr>,
    pub mcast_bufsize: usize,
    pub prometheus_addr: String,
    pub host_regex: Option<Regex>,
    pub backend_workers: usize,
    pub frontend_workers: usize,
    pub frontend_delay: Duration,
    pub nethttp: bool,
    pub topics: Vec<String>,
    pub kafka_config: PathBuf,
    pub purge_max_age: Duration,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self> {
        let mcast_addrs = args
            .mcast_addrs
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(|addr| {
                addr.parse::<Ipv4Addr>()
                    .with_context(|| format!("invalid multicast address {addr}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let host_regex = if args.host_regex.is_empty() {
            None
        } else {
            Some(Regex::new(&args.host_regex).context("invalid host_regex")?)
        };

        let topics: Vec<String> = args
            .topics
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_string)
            .collect();

        let config = Self {
            frontend_addr: args.frontend_addr,
            backend_addr: args.backend_addr,
            mcast_addrs,
            mcast_bufsize: args.mcast_bufsize,
            prometheus_addr: normalize_bind_addr(&args.prometheus_addr),
            host_regex,
            backend_workers: args.backend_workers,
            frontend_workers: args.frontend_workers,
            frontend_delay: Duration::from_millis(args.frontend_delay),
            nethttp: args.nethttp,
            topics,
            kafka_config: args.kafka_config,
            purge_max_age: Duration::from_secs(args.purge_max_age),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.backend_workers == 0 {
            bail!("backend_workers must be > 0");
        }
        if self.frontend_workers == 0 {
            bail!("frontend_workers must be > 0");
        }
        if self.mcast_addrs.is_empty() {
            bail!("mcast_addrs must name at least one multicast group");
        }
        Ok(())
    }
}

/// Accept the `:port` shorthand for all-interfaces binds.
fn normalize_bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Load the opaque bus client configuration map.
///
/// The file is a flat JSON object. Numeric values are coerced to integers:
/// JSON numbers decode as floats, while the bus client expects integral
/// settings.
pub fn load_bus_config(path: &Path) -> Result<Vec<(String, String)>> {
    let raw = std::fs::read(path)
        .with_context(|| format!("reading bus configuration {}", path.display()))?;
    let map: serde_json::Map<String, Value> =
        serde_json::from_slice(&raw).context("bus configuration is not a JSON object")?;

    let mut entries = Vec::with_capacity(map.len());
    for (key, value) in map {
        let value = match value {
            Value::String(text) => text,
            Value::Number(number) => match number.as_i64() {
                Some(integer) => integer.to_string(),
                None => (number.as_f64().unwrap_or_default() as i64).to_string(),
            },
            Value::Bool(flag) => flag.to_string(),
            other => bail!("unsupported bus configuration value for {key}: {other}"),
        };
        entries.push((key, value));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write as _;

    fn args(argv: &[&str]) -> Args {
        let mut full = vec!["purged"];
        full.extend_from_slice(argv);
        Args::parse_from(full)
    }

    #[test]
    fn builds_from_default_flags() {
        let config = Config::from_args(args(&[])).expect("default flags are valid");
        assert_eq!(
            config.mcast_addrs,
            vec![
                "239.128.0.112".parse::<Ipv4Addr>().unwrap(),
                "239.128.0.115".parse::<Ipv4Addr>().unwrap()
            ]
        );
        assert_eq!(config.prometheus_addr, "0.0.0.0:2112");
        assert!(config.host_regex.is_none());
        assert!(config.topics.is_empty());
        assert_eq!(config.frontend_delay, Duration::from_millis(1000));
        assert_eq!(config.purge_max_age, Duration::ZERO);
    }

    #[test]
    fn splits_topics_and_compiles_regex() {
        let config = Config::from_args(args(&[
            "--topics",
            "purge.a, purge.b",
            "--host_regex",
            "[um][pa][lp][os]",
        ]))
        .expect("valid flags");
        assert_eq!(config.topics, vec!["purge.a", "purge.b"]);
        let regex = config.host_regex.expect("regex compiled");
        assert!(regex.is_match("upload.wikimedia.org"));
        assert!(!regex.is_match("en.wikipedia.org"));
    }

    #[test]
    fn rejects_bad_flags() {
        assert!(Config::from_args(args(&["--mcast_addrs", "not-an-ip"])).is_err());
        assert!(Config::from_args(args(&["--host_regex", "["])).is_err());
        assert!(Config::from_args(args(&["--backend_workers", "0"])).is_err());
        assert!(Config::from_args(args(&["--mcast_addrs", ""])).is_err());
    }

    #[test]
    fn bus_config_coerces_numbers_to_integers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"bootstrap.servers": "localhost:9092",
                 "queue.buffering.max.ms": 50.0,
                 "statistics.interval.ms": 30000,
                 "enable.auto.commit": true}}"#
        )
        .unwrap();

        let mut entries = load_bus_config(file.path()).expect("valid config map");
        entries.sort();
        assert_eq!(
            entries,
            vec![
                ("bootstrap.servers".to_string(), "localhost:9092".to_string()),
                ("enable.auto.commit".to_string(), "true".to_string()),
                ("queue.buffering.max.ms".to_string(), "50".to_string()),
                ("statistics.interval.ms".to_string(), "30000".to_string()),
            ]
        );
    }

    #[test]
    fn bus_config_rejects_nested_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"sasl": {{"mechanism": "PLAIN"}}}}"#).unwrap();
        assert!(load_bus_config(file.path()).is_err());
    }
}
