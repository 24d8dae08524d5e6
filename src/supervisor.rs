//! Process fan-out and termination.
//!
//! The responder binds its listener before forking so all workers share one
//! accept queue. The load generator forks first and lets every worker open
//! its own connections; only the stats lock is created up front.

use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Error, OsContext};
use crate::ipc::SharedLock;
use crate::net;
use crate::runtime::STOP_POLL_INTERVAL;
use crate::worker;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Raised by SIGINT/SIGTERM. Every event loop polls it between waits.
pub static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_signum: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM to the stop flag. Inherited across fork.
pub fn install_stop_handler() -> io::Result<()> {
    for signum in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only performs an atomic store.
        let previous = unsafe {
            libc::signal(
                signum,
                on_stop_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
            )
        };
        if previous == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Split `total` across `workers`; the first worker absorbs the remainder.
pub fn allocate(total: usize, workers: usize) -> Vec<usize> {
    if workers == 0 {
        return Vec::new();
    }
    let share = total / workers;
    let mut shares = vec![share; workers];
    shares[0] += total % workers;
    shares
}

pub fn run_server(config: ServerConfig) -> Result<(), Error> {
    install_stop_handler().os_context("signal")?;

    let listener = net::create_listening_socket(config.port, true).os_context("bind")?;
    info!(
        port = config.port,
        workers = config.workers,
        strategy = ?config.strategy,
        "Responder listening"
    );

    let children = spawn_workers(config.workers, |worker_id| {
        worker::server_main(worker_id, &listener, &config)
    })?;

    // Workers hold their own copies of the descriptor.
    drop(listener);

    let failed = reap(&children);
    info!(workers = children.len(), failed, "Responder workers exited");
    Ok(())
}

pub fn run_client(config: ClientConfig) -> Result<(), Error> {
    install_stop_handler().os_context("signal")?;

    let lock = SharedLock::new().os_context("mmap")?;
    let shares = allocate(config.clients, config.workers);
    info!(
        host = %config.host,
        port = config.port,
        workers = config.workers,
        clients = config.clients,
        retransmits = config.retransmits,
        strategy = ?config.strategy,
        "Load generator starting"
    );

    let children = spawn_workers(config.workers, |worker_id| {
        worker::client_main(worker_id, shares[worker_id], &config, &lock)
    })?;

    match config.duration {
        Some(duration) => {
            sleep_unless_stopped(duration);
            info!(elapsed_ms = config.duration_ms(), "Run complete, stopping workers");
            signal_process_group(libc::SIGINT);
        }
        None => info!("No duration configured, running until interrupted"),
    }

    let failed = reap(&children);
    info!(workers = children.len(), failed, "Load workers exited");
    Ok(())
}

enum Forked {
    Child,
    Parent(libc::pid_t),
}

fn fork() -> io::Result<Forked> {
    // SAFETY: the process is single-threaded at this point; the child only
    // runs its worker body and then exits.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Forked::Child),
        pid => Ok(Forked::Parent(pid)),
    }
}

/// Fork `count` workers running `body`. Children never return from here.
///
/// A child leaves through `_exit` so it never runs exit handlers inherited
/// from the supervisor; worker bodies flush their own output.
fn spawn_workers<F>(count: usize, body: F) -> Result<Vec<libc::pid_t>, Error>
where
    F: Fn(usize) -> i32,
{
    let mut children = Vec::with_capacity(count);

    for worker_id in 0..count {
        match fork() {
            Ok(Forked::Child) => {
                let code = body(worker_id);
                // SAFETY: terminates only the calling child process.
                unsafe { libc::_exit(code) }
            }
            Ok(Forked::Parent(pid)) => children.push(pid),
            Err(e) => {
                for &pid in &children {
                    // SAFETY: signalling a child we forked.
                    unsafe { libc::kill(pid, libc::SIGTERM) };
                }
                reap(&children);
                return Err(Error::Os {
                    context: "fork",
                    source: e,
                });
            }
        }
    }

    Ok(children)
}

fn sleep_unless_stopped(duration: Duration) {
    let deadline = Instant::now() + duration;
    while !STOP.load(Ordering::Relaxed) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(STOP_POLL_INTERVAL));
    }
}

fn signal_process_group(signum: libc::c_int) {
    // SAFETY: pid 0 addresses our own process group. Our handler only
    // raises the stop flag, so the supervisor survives to reap.
    if unsafe { libc::kill(0, signum) } < 0 {
        warn!(error = %io::Error::last_os_error(), "Failed to signal workers");
    }
}

/// Wait for every child, retrying on EINTR. Returns how many workers did
/// not exit cleanly.
fn reap(children: &[libc::pid_t]) -> usize {
    let mut failed = 0;
    for &pid in children {
        let mut status: libc::c_int = 0;
        loop {
            // SAFETY: `status` is a valid out-pointer.
            if unsafe { libc::waitpid(pid, &mut status, 0) } >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(pid, error = %err, "waitpid failed");
            break;
        }

        if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) != 0 {
            warn!(pid, code = libc::WEXITSTATUS(status), "Worker exited with failure");
            failed += 1;
        } else if libc::WIFSIGNALED(status) {
            warn!(pid, signal = libc::WTERMSIG(status), "Worker killed by signal");
            failed += 1;
        }
    }
    failed
}
