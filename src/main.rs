//! purged - daemon entrypoint.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use purged::cli::Args;
use purged::config::Config;
use purged::metrics::Metrics;
use purged::runtime::Runtime;
use purged::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_handle = telemetry::init_tracing(None)?;
    let config = Config::from_args(args)?;
    let metrics = Arc::new(Metrics::default());

    // Serve prometheus metrics under /metrics.
    telemetry::start_http(&config.prometheus_addr, metrics.clone(), Some(log_handle)).await?;

    Runtime::new(config, metrics).run().await
}
