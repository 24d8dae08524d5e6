//! Worker process bodies. Each returns the exit code for its process.

use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Error, OsContext, EX_OK};
use crate::ipc::SharedLock;
use crate::runtime;
use crate::stats::StatsReport;
use crate::supervisor::STOP;
use chrono::Local;
use std::io::{self, Write};
use std::net::TcpListener;
use std::process;
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use tracing::{error, info};

pub fn server_main(worker_id: usize, listener: &TcpListener, config: &ServerConfig) -> i32 {
    info!(worker = worker_id, pid = process::id(), "Responder worker started");

    match runtime::serve(worker_id, listener, config, &STOP) {
        Ok(()) => EX_OK,
        Err(e) => {
            error!(worker = worker_id, error = %e, "Responder worker failed");
            e.exit_code()
        }
    }
}

pub fn client_main(
    worker_id: usize,
    clients: usize,
    config: &ClientConfig,
    lock: &SharedLock,
) -> i32 {
    run_client(worker_id, clients, config, lock, &STOP, &mut io::stdout())
}

/// Generate load until `stop` is raised, then write this worker's report
/// to `out` under the cross-process lock.
fn run_client<W: Write>(
    worker_id: usize,
    clients: usize,
    config: &ClientConfig,
    lock: &SharedLock,
    stop: &AtomicBool,
    out: &mut W,
) -> i32 {
    let pid = process::id();
    info!(worker = worker_id, pid, clients, "Load worker started");

    let started_at = Local::now();
    let started = Instant::now();

    let stats = match runtime::generate_load(worker_id, clients, config, stop) {
        Ok(stats) => stats,
        Err(e) => {
            error!(worker = worker_id, error = %e, "Load worker failed");
            return e.exit_code();
        }
    };

    let report = StatsReport {
        pid,
        started_at,
        target_sessions: clients,
        runtime: started.elapsed(),
        stats,
    };

    match print_report(&report, lock, out) {
        Ok(()) => EX_OK,
        Err(e) => {
            error!(worker = worker_id, error = %e, "Failed to print stats");
            e.exit_code()
        }
    }
}

fn print_report<W: Write>(
    report: &StatsReport,
    lock: &SharedLock,
    out: &mut W,
) -> Result<(), Error> {
    let _guard = lock.lock().os_context("sem_wait")?;

    write!(out, "{report}").os_context("write")?;
    out.flush().os_context("write")
}
