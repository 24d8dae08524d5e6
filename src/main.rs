//! echo-bench: a TCP echo responder and load generator
//!
//! Two roles, one binary:
//! - `server`: forks workers that share one listening socket and echo every
//!   byte back to its sender
//! - `client`: forks workers that each keep a fixed number of connections
//!   busy sending a payload and waiting for the echo, then print per-worker
//!   service time statistics
//!
//! Workers multiplex with edge-triggered epoll by default; level-triggered
//! poll(2) and a thread-per-connection responder are also available.

mod config;
mod error;
mod ipc;
mod net;
mod runtime;
mod stats;
mod supervisor;
mod worker;

use clap::error::ErrorKind;
use config::{Config, ConfigError, Mode};
use error::{EX_OK, EX_USAGE};
use std::process;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::Cli(e))
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) =>
        {
            e.exit()
        }
        Err(e) => {
            eprintln!("{e}");
            process::exit(EX_USAGE);
        }
    };

    // Initialize logging before forking so every worker inherits it
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match config.mode {
        Mode::Server(server) => {
            info!(
                port = server.port,
                workers = server.workers,
                events_capacity = server.events_capacity,
                buffer_size = server.buffer_size,
                "Starting echo-bench responder"
            );
            supervisor::run_server(server)
        }
        Mode::Client(client) => {
            info!(
                host = %client.host,
                port = client.port,
                payload_bytes = client.payload.len(),
                duration_ms = client.duration_ms(),
                "Starting echo-bench load generator"
            );
            supervisor::run_client(client)
        }
    };

    match result {
        Ok(()) => process::exit(EX_OK),
        Err(e) => {
            error!(error = %e, "Fatal error");
            process::exit(e.exit_code());
        }
    }
}
