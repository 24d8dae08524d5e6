//! Per-worker connection runtime.
//!
//! Each worker process runs exactly one event loop over its own sockets:
//! - `EdgeReactor`: mio/epoll, edge-triggered
//! - `LevelReactor`: poll(2), level-triggered
//! - `threaded`: blocking thread per connection (responder only)
//!
//! The reactors share the `Reactor` contract; the responder and load
//! generator loops are generic over it.

mod client;
mod connection;
mod epoll;
mod poll;
mod reactor;
mod server;
mod threaded;

pub(crate) use epoll::EdgeReactor;
pub(crate) use poll::LevelReactor;

use client::ClientWorker;
use reactor::Reactor;
use server::EchoServer;

use crate::config::{ClientConfig, ServerConfig, Strategy};
use crate::error::{Error, OsContext};
use crate::net;
use crate::stats::AggregateStats;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Upper bound on how long a loop blocks before re-checking its stop flag.
pub(crate) const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run one responder worker over the shared `listener` until `stop` is set.
pub fn serve(
    worker_id: usize,
    listener: &TcpListener,
    config: &ServerConfig,
    stop: &AtomicBool,
) -> Result<(), Error> {
    match config.strategy {
        Strategy::Edge => {
            let reactor = EdgeReactor::new(config.events_capacity).os_context("epoll_create")?;
            EchoServer::new(worker_id, reactor, listener, config.buffer_size).run(stop)
        }
        Strategy::Level => {
            EchoServer::new(worker_id, LevelReactor::new(), listener, config.buffer_size).run(stop)
        }
        Strategy::Thread => threaded::run(worker_id, listener, config.buffer_size, stop),
    }
}

/// Run one load-generator worker with `clients` slots until `stop` is set.
pub fn generate_load(
    worker_id: usize,
    clients: usize,
    config: &ClientConfig,
    stop: &AtomicBool,
) -> Result<AggregateStats, Error> {
    let addr = net::resolve(&config.host, config.port).os_context("resolve")?;

    match config.strategy {
        Strategy::Level => {
            drive_clients(worker_id, clients, config, addr, LevelReactor::new(), stop)
        }
        Strategy::Edge | Strategy::Thread => {
            let reactor = EdgeReactor::new(config.events_capacity).os_context("epoll_create")?;
            drive_clients(worker_id, clients, config, addr, reactor, stop)
        }
    }
}

fn drive_clients<R: Reactor>(
    worker_id: usize,
    clients: usize,
    config: &ClientConfig,
    addr: SocketAddr,
    reactor: R,
    stop: &AtomicBool,
) -> Result<AggregateStats, Error> {
    let mut worker = ClientWorker::new(
        worker_id,
        reactor,
        addr,
        config.payload.clone(),
        config.transmit_budget(),
        config.buffer_size,
    );
    worker.open(clients).os_context("socket")?;
    worker.run(stop).os_context("epoll_wait")?;
    Ok(worker.into_stats())
}
