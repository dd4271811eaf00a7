//! Binary entry point: parse CLI flags, load configuration, initialize
//! logging, and hand off to the accept loop.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cqlproxy::config::{Configuration, Opt};
use cqlproxy::metrics::{MetricsHandler, NoopMetrics};

fn main() -> std::io::Result<()> {
    let opt = Opt::parse();
    init_logging(opt.log_level.as_deref());

    let config = match Configuration::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };

    if opt.config_check {
        tracing::info!(?config, "configuration is valid");
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let metrics: Arc<dyn MetricsHandler> = Arc::new(NoopMetrics);
    runtime.block_on(cqlproxy::server::run(config, metrics))
}

fn init_logging(log_level_override: Option<&str>) {
    let filter = match log_level_override {
        Some(directive) => EnvFilter::new(directive.to_owned()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
