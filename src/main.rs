//! rudderd binary entry point.
//!
//! Loads the daemon configuration, builds the IPVS context and runs
//! until interrupted. The netlink IPVS driver, the HTTP admin surface
//! and the store sync loop are wired in by downstream builds; this
//! entry point keeps the core runnable for development against the
//! in-memory driver.

use rudder::config::DaemonConfig;
use rudder::core::Context;
use rudder::ipvs::MockIpvs;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("starting rudder daemon v{}", env!("CARGO_PKG_VERSION"));

    let path =
        std::env::var("RUDDER_CONFIG").unwrap_or_else(|_| "/etc/rudder.toml".to_string());
    let config = match DaemonConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            info!(path = %path, error = %e, "no usable configuration file, using defaults");
            DaemonConfig::default()
        }
    };

    let ctx = match Context::builder(Box::new(MockIpvs::new()))
        .flush(config.flush)
        .build()
    {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "error while initializing server context");
            std::process::exit(1);
        }
    };

    info!(listen = %config.listen, "context ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to wait for shutdown signal");
    }

    ctx.close().await;
}
