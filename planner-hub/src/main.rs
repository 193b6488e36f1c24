//! `planner-hub` -- reference backend for the planner sync engine.
//!
//! An axum WebSocket server holding workload data in memory. Clients
//! join a workspace room, submit moves and edits, and receive every
//! change made by the other viewers.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9100
//! cargo run --bin planner-hub
//!
//! # Run on a custom address with seed data
//! cargo run --bin planner-hub -- --bind 127.0.0.1:8080 --seed-file seed.json
//! ```

use std::sync::Arc;

use clap::Parser;
use planner_hub::config::{HubCliArgs, HubConfig};
use planner_hub::hub::{self, HubState};
use planner_hub::workload::WorkloadStore;

#[tokio::main]
async fn main() {
    let cli = HubCliArgs::parse();

    let config = match HubConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let workload = match &config.seed_file {
        Some(path) => match WorkloadStore::from_seed_file(path) {
            Ok(store) => store,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to load seed data");
                std::process::exit(1);
            }
        },
        None => WorkloadStore::new(),
    };

    tracing::info!(addr = %config.bind_addr, "starting planner hub");

    let state = Arc::new(HubState::with_config(
        workload,
        config.concurrent_edit_window,
    ));

    match hub::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "hub listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "hub server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start hub");
            std::process::exit(1);
        }
    }
}
