#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]

//! purged - cache-invalidation dispatcher for a two-tier HTTP cache
//! hierarchy.
//!
//! Purge notifications arrive over a UDP multicast HTCP feed and a Kafka
//! message bus carrying JSON `resource_change` events. Each notification is
//! normalized into a URL and dispatched as an HTTP `PURGE` to the backend
//! cache, then to the frontend cache after a configurable delay, so the
//! backend is re-populatable before the edge invalidates.
//!
//! # Module Organization
//!
//! ## Ingress
//! - `htcp` - HTCP CLR datagram decoding
//! - `multicast` - UDP multicast reader
//! - `event` - `resource_change` JSON decoding
//! - `bus` - bus consumer interface, reader loop, per-topic lag
//! - `kafka` - Kafka implementation of the bus consumer interface
//!
//! ## Dispatch
//! - `purge` - PURGE clients (raw TCP with reconnect, HTTP)
//! - `workers` - backend/frontend worker pools and the delayed handoff
//!
//! ## Infrastructure
//! - `cli` - command-line flags
//! - `config` - validated runtime configuration
//! - `metrics` - counters/gauges and Prometheus exposition
//! - `telemetry` - logging setup and the observation endpoint
//! - `runtime` - channel wiring, task lifecycle, shutdown
//! - `time` - clock abstraction

pub mod bus;
pub mod cli;
pub mod config;
pub mod event;
pub mod htcp;
pub mod kafka;
pub mod metrics;
pub mod multicast;
pub mod purge;
pub mod runtime;
pub mod telemetry;
pub mod time;
pub mod workers;

pub use bus::{BusConsumer, BusEvent, BusReader, LagTracker};
pub use config::Config;
pub use metrics::Metrics;
pub use runtime::Runtime;
