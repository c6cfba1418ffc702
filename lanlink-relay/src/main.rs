//! `lanlink-relay`: joins peers on the same LAN into signaling rooms.
//!
//! ```bash
//! lanlink-relay                      # 0.0.0.0:8765
//! lanlink-relay --bind 127.0.0.1:8080
//! PORT=9000 lanlink-relay
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use lanlink_relay::config::{RelayCliArgs, RelayConfig};
use lanlink_relay::relay::{self, RelayState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match RelayConfig::load(&RelayCliArgs::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("lanlink-relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let state = Arc::new(RelayState::with_limits(config.limits()));
    let (local_addr, server) = match relay::start_server_with_state(&config.bind_addr, state).await
    {
        Ok(bound) => bound,
        Err(e) => {
            tracing::error!(addr = %config.bind_addr, error = %e, "cannot bind relay");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(addr = %local_addr, "relay accepting signaling connections");

    match server.await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "relay task ended abnormally");
            ExitCode::FAILURE
        }
    }
}
