//! Load-generator event loop.
//!
//! A fixed table of slots, one connection each. A slot's index is its
//! reactor token, so readiness maps straight back to the slot. After a
//! session spends its transmit budget the slot's socket is closed and a
//! replacement opened in the same slot.

use super::connection::{drain, ClientCycle, Drained, RoundOutcome, SendProgress};
use super::reactor::{InterestSet, Reactor, Readiness};
use super::STOP_POLL_INTERVAL;
use crate::net;
use crate::stats::AggregateStats;
use mio::Token;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Socket creation attempts when replacing a finished connection.
const REPLACEMENT_ATTEMPTS: usize = 10;

struct ClientSlot {
    /// `None` once the slot has been retired.
    stream: Option<TcpStream>,
    cycle: ClientCycle,
}

/// Everything a worker's event handlers mutate besides the slots.
struct ClientContext {
    addr: SocketAddr,
    payload: Vec<u8>,
    transmit_budget: u32,
    stats: AggregateStats,
    scratch: Vec<u8>,
}

pub struct ClientWorker<R> {
    worker_id: usize,
    reactor: R,
    slots: Vec<ClientSlot>,
    ctx: ClientContext,
}

impl<R: Reactor> ClientWorker<R> {
    pub fn new(
        worker_id: usize,
        reactor: R,
        addr: SocketAddr,
        payload: Vec<u8>,
        transmit_budget: u32,
        buffer_size: usize,
    ) -> Self {
        Self {
            worker_id,
            reactor,
            slots: Vec::new(),
            ctx: ClientContext {
                addr,
                payload,
                transmit_budget: transmit_budget.max(1),
                stats: AggregateStats::new(),
                scratch: vec![0u8; buffer_size.max(1)],
            },
        }
    }

    /// Open `clients` connections and register each for writability.
    pub fn open(&mut self, clients: usize) -> io::Result<()> {
        self.slots.reserve(clients);
        for slot in 0..clients {
            let stream = net::create_connecting_socket(self.ctx.addr, true)?;
            self.reactor
                .register(stream.as_raw_fd(), Token(slot), InterestSet::WriteWait)?;
            self.slots.push(ClientSlot {
                stream: Some(stream),
                cycle: ClientCycle::new(),
            });
        }

        info!(
            worker = self.worker_id,
            clients,
            addr = %self.ctx.addr,
            edge_triggered = self.reactor.is_edge_triggered(),
            "Clients connecting"
        );
        Ok(())
    }

    /// Drive all slots until `stop` is raised.
    pub fn run(&mut self, stop: &AtomicBool) -> io::Result<()> {
        let mut ready = Vec::new();

        while !stop.load(Ordering::Relaxed) {
            self.reactor.wait(Some(STOP_POLL_INTERVAL), &mut ready)?;

            for readiness in &ready {
                self.dispatch(*readiness)?;
            }
        }

        Ok(())
    }

    pub fn into_stats(self) -> AggregateStats {
        self.ctx.stats
    }

    fn dispatch(&mut self, readiness: Readiness) -> io::Result<()> {
        let idx = readiness.token.0;
        let Some(slot) = self.slots.get(idx) else {
            return Ok(());
        };
        if slot.stream.is_none() {
            return Ok(());
        }

        if readiness.closed {
            self.abort(idx, "hangup or socket error");
            return Ok(());
        }

        match slot.cycle.interest() {
            InterestSet::WriteWait if readiness.writable => self.transmit(idx),
            InterestSet::ReadWait if readiness.readable => self.receive(idx),
            _ => Ok(()),
        }
    }

    fn transmit(&mut self, idx: usize) -> io::Result<()> {
        let slot = &mut self.slots[idx];
        let Some(stream) = slot.stream.as_mut() else {
            return Ok(());
        };

        loop {
            let unsent = slot.cycle.unsent(&self.ctx.payload);
            match stream.write(unsent) {
                Ok(0) => break,
                Ok(n) => {
                    let now = Instant::now();
                    match slot.cycle.record_sent(n, self.ctx.payload.len(), now) {
                        SendProgress::Partial => continue,
                        SendProgress::Transmitted { first } => {
                            if first {
                                self.ctx.stats.session_started();
                            }
                            let fd = stream.as_raw_fd();
                            return self.reactor.modify(fd, Token(idx), InterestSet::ReadWait);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(worker = self.worker_id, slot = idx, error = %e, "Send failed");
                    break;
                }
            }
        }

        self.abort(idx, "send failed");
        Ok(())
    }

    fn receive(&mut self, idx: usize) -> io::Result<()> {
        let slot = &mut self.slots[idx];
        let Some(stream) = slot.stream.as_mut() else {
            return Ok(());
        };

        let drained = match drain(stream, &mut self.ctx.scratch, usize::MAX, |_| {}) {
            Ok(drained) => drained,
            Err(e) => {
                debug!(worker = self.worker_id, slot = idx, error = %e, "Receive failed");
                self.abort(idx, "receive failed");
                return Ok(());
            }
        };
        slot.cycle.record_received(drained.bytes());

        let now = Instant::now();
        match slot
            .cycle
            .complete_round(self.ctx.payload.len(), self.ctx.transmit_budget, now)
        {
            RoundOutcome::Incomplete => {
                if let Drained::Eof(_) = drained {
                    self.abort(idx, "peer closed mid-session");
                }
                Ok(())
            }
            RoundOutcome::Retransmit => {
                let fd = stream.as_raw_fd();
                self.reactor.modify(fd, Token(idx), InterestSet::WriteWait)
            }
            RoundOutcome::Finished { service_time } => {
                self.ctx.stats.session_completed(service_time);
                self.recycle(idx)
            }
        }
    }

    /// Close the slot's connection and open a replacement in its place.
    fn recycle(&mut self, idx: usize) -> io::Result<()> {
        self.close_stream(idx);
        self.slots[idx].cycle.reset();

        let mut last_err = None;
        for _ in 0..REPLACEMENT_ATTEMPTS {
            match net::create_connecting_socket(self.ctx.addr, true) {
                Ok(stream) => {
                    self.reactor
                        .register(stream.as_raw_fd(), Token(idx), InterestSet::WriteWait)?;
                    self.slots[idx].stream = Some(stream);
                    debug!(worker = self.worker_id, slot = idx, "Slot recycled");
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }

        if let Some(e) = last_err {
            warn!(
                worker = self.worker_id,
                slot = idx,
                attempts = REPLACEMENT_ATTEMPTS,
                error = %e,
                "Retiring slot after repeated socket failures"
            );
        }
        Ok(())
    }

    /// Tear down a slot whose connection failed; the slot is retired.
    fn abort(&mut self, idx: usize, reason: &'static str) {
        let cycle = &self.slots[idx].cycle;
        let (was_active, transmits, received) =
            (cycle.is_active(), cycle.transmit_count(), cycle.bytes_in_cycle());

        self.close_stream(idx);
        self.slots[idx].cycle.reset();

        if was_active {
            self.ctx.stats.session_failed();
        }
        debug!(
            worker = self.worker_id,
            slot = idx,
            transmits,
            received,
            reason,
            "Slot aborted"
        );
    }

    fn close_stream(&mut self, idx: usize) {
        if let Some(stream) = self.slots[idx].stream.take() {
            let _ = self.reactor.deregister(stream.as_raw_fd());
        }
    }
}
