//! `BowlChat` development broker.
//!
//! Serves the token endpoint, the send endpoint and the pub/sub WebSocket
//! in one process, for local development and integration testing.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 127.0.0.1:8000
//! cargo run --bin bowlchat-broker
//!
//! # Run on custom address
//! cargo run --bin bowlchat-broker -- --bind 0.0.0.0:9000
//! ```

use std::sync::Arc;

use bowlchat_broker::config::{BrokerCliArgs, BrokerConfig};
use bowlchat_broker::http;
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = BrokerCliArgs::parse();

    let config = match BrokerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting bowlchat broker");

    let state = Arc::new(config.state());
    if let Some(url) = &config.public_url {
        state.set_public_url(url.as_str()).await;
    }

    match http::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "broker listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "broker server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start broker");
            std::process::exit(1);
        }
    }
}
