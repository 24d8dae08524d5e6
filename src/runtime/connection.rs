//! Per-connection state machines.
//!
//! `ClientCycle` is the load-generator side: a pure record of where a slot is
//! in its send/echo/retransmit cycle, with no socket attached so the reactor
//! loop owns all I/O. `EchoConnection` is the responder side and owns its
//! stream, since it is purely reactive.
//!
//! Both move strictly between `WriteWait` and `ReadWait`; closing is decided
//! by the caller from the returned outcome.

use super::reactor::InterestSet;
use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// How a drain of a readable socket ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drained {
    /// Socket has no more data right now.
    WouldBlock(usize),
    /// Peer closed its write side.
    Eof(usize),
    /// Stopped early after reaching the byte limit.
    Limit(usize),
}

impl Drained {
    pub fn bytes(self) -> usize {
        match self {
            Drained::WouldBlock(n) | Drained::Eof(n) | Drained::Limit(n) => n,
        }
    }
}

/// Read from `reader` until it would block, hits EOF, or `limit` bytes were
/// consumed, handing each chunk to `sink`.
///
/// Edge-triggered readiness requires this full drain; stopping at `limit`
/// is only safe when the caller re-arms the socket afterwards.
pub fn drain<R: Read>(
    reader: &mut R,
    scratch: &mut [u8],
    limit: usize,
    mut sink: impl FnMut(&[u8]),
) -> io::Result<Drained> {
    let mut total = 0;

    while total < limit {
        let want = scratch.len().min(limit - total);
        match reader.read(&mut scratch[..want]) {
            Ok(0) => return Ok(Drained::Eof(total)),
            Ok(n) => {
                sink(&scratch[..n]);
                total += n;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(Drained::WouldBlock(total))
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(Drained::Limit(total))
}

/// Result of reporting sent bytes to a `ClientCycle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendProgress {
    /// Only part of the payload went out; keep waiting for writability.
    Partial,
    /// The whole payload went out. `first` marks the session's first send.
    Transmitted { first: bool },
}

/// Result of checking whether the current echo round is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Still waiting for echoed bytes.
    Incomplete,
    /// Round complete and budget remains; send the payload again.
    Retransmit,
    /// Round complete and budget spent; the session is over.
    Finished { service_time: Duration },
}

/// Send/echo bookkeeping for one client slot.
#[derive(Debug, Clone)]
pub struct ClientCycle {
    interest: InterestSet,
    transmit_count: u32,
    bytes_in_cycle: usize,
    sent_in_cycle: usize,
    cycle_start: Option<Instant>,
}

impl Default for ClientCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCycle {
    /// A fresh slot, waiting to send.
    pub fn new() -> Self {
        Self {
            interest: InterestSet::WriteWait,
            transmit_count: 0,
            bytes_in_cycle: 0,
            sent_in_cycle: 0,
            cycle_start: None,
        }
    }

    pub fn interest(&self) -> InterestSet {
        self.interest
    }

    pub fn transmit_count(&self) -> u32 {
        self.transmit_count
    }

    pub fn bytes_in_cycle(&self) -> usize {
        self.bytes_in_cycle
    }

    /// Whether this slot has sent at least once and so counts as a session.
    pub fn is_active(&self) -> bool {
        self.transmit_count > 0
    }

    /// The part of `payload` not yet written in this round.
    pub fn unsent<'a>(&self, payload: &'a [u8]) -> &'a [u8] {
        &payload[self.sent_in_cycle.min(payload.len())..]
    }

    /// Record `n` bytes accepted by the socket.
    pub fn record_sent(&mut self, n: usize, payload_len: usize, now: Instant) -> SendProgress {
        debug_assert_eq!(self.interest, InterestSet::WriteWait);

        self.sent_in_cycle += n;
        if self.sent_in_cycle < payload_len {
            return SendProgress::Partial;
        }

        self.sent_in_cycle = 0;
        self.transmit_count += 1;
        let first = self.transmit_count == 1;
        if first {
            self.cycle_start = Some(now);
        }
        self.interest = InterestSet::ReadWait;

        SendProgress::Transmitted { first }
    }

    /// Record `n` echoed bytes.
    pub fn record_received(&mut self, n: usize) {
        self.bytes_in_cycle += n;
    }

    /// Close out the round if a full payload has been echoed.
    ///
    /// Completion is a threshold check; any surplus bytes carry into the
    /// next round instead of being lost.
    pub fn complete_round(
        &mut self,
        payload_len: usize,
        transmit_budget: u32,
        now: Instant,
    ) -> RoundOutcome {
        if self.interest != InterestSet::ReadWait || self.bytes_in_cycle < payload_len {
            return RoundOutcome::Incomplete;
        }

        self.bytes_in_cycle -= payload_len;

        if self.transmit_count < transmit_budget {
            self.interest = InterestSet::WriteWait;
            return RoundOutcome::Retransmit;
        }

        let start = self.cycle_start.unwrap_or(now);
        RoundOutcome::Finished {
            service_time: now.saturating_duration_since(start),
        }
    }

    /// Clear all counters so the slot can carry a new connection.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// What the responder should do with a connection after handling readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoStep {
    /// Keep the current interest.
    Stay,
    /// Re-register with the new interest.
    Switch(InterestSet),
    /// Peer is gone; close and deregister.
    Close,
}

/// Responder-side connection: reads bytes, echoes exactly those bytes back.
pub struct EchoConnection<S> {
    stream: S,
    interest: InterestSet,
    pending: BytesMut,
    max_pending: usize,
}

impl<S: Read + Write> EchoConnection<S> {
    /// Wrap a freshly accepted stream, initially waiting to read.
    pub fn new(stream: S, max_pending: usize) -> Self {
        Self {
            stream,
            interest: InterestSet::ReadWait,
            pending: BytesMut::with_capacity(max_pending.min(16 * 1024)),
            max_pending: max_pending.max(1),
        }
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn interest(&self) -> InterestSet {
        self.interest
    }

    /// Bytes read but not yet echoed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Handle read readiness.
    pub fn on_readable(&mut self, scratch: &mut [u8]) -> io::Result<EchoStep> {
        if self.interest != InterestSet::ReadWait {
            return Ok(EchoStep::Stay);
        }

        let room = self.max_pending.saturating_sub(self.pending.len());
        let pending = &mut self.pending;
        let drained = drain(&mut self.stream, scratch, room, |chunk| {
            pending.extend_from_slice(chunk)
        })?;

        if let Drained::Eof(_) = drained {
            return Ok(EchoStep::Close);
        }

        if self.pending.is_empty() {
            return Ok(EchoStep::Stay);
        }

        self.interest = InterestSet::WriteWait;
        Ok(EchoStep::Switch(InterestSet::WriteWait))
    }

    /// Handle write readiness: flush the pending echo.
    pub fn on_writable(&mut self) -> io::Result<EchoStep> {
        if self.interest != InterestSet::WriteWait {
            return Ok(EchoStep::Stay);
        }

        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.pending.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(EchoStep::Stay)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.interest = InterestSet::ReadWait;
        Ok(EchoStep::Switch(InterestSet::ReadWait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    /// Stream double: hands out queued read chunks, then WouldBlock (or EOF
    /// once `closed`); accepts at most `write_quota` bytes per write call.
    struct ScriptedStream {
        reads: VecDeque<Vec<u8>>,
        closed: bool,
        written: Vec<u8>,
        write_quota: usize,
        write_budget: usize,
    }

    impl ScriptedStream {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                reads: chunks.into(),
                closed: false,
                written: Vec::new(),
                write_quota: usize::MAX,
                write_budget: usize::MAX,
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.front_mut() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.drain(..n);
                    if chunk.is_empty() {
                        self.reads.pop_front();
                    }
                    Ok(n)
                }
                None if self.closed => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.write_budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.write_quota).min(self.write_budget);
            self.write_budget -= n;
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_drain_until_would_block() {
        let mut stream = ScriptedStream::new(vec![b"abc".to_vec(), b"defg".to_vec()]);
        let mut scratch = [0u8; 2];
        let mut seen = Vec::new();

        let drained = drain(&mut stream, &mut scratch, usize::MAX, |c| {
            seen.extend_from_slice(c)
        })
        .unwrap();

        assert_eq!(drained, Drained::WouldBlock(7));
        assert_eq!(seen, b"abcdefg");
    }

    #[test]
    fn test_drain_reports_eof_and_limit() {
        let mut stream = ScriptedStream::new(vec![b"abc".to_vec()]);
        stream.closed = true;
        let mut scratch = [0u8; 8];
        assert_eq!(
            drain(&mut stream, &mut scratch, usize::MAX, |_| {}).unwrap(),
            Drained::Eof(3)
        );

        let mut stream = ScriptedStream::new(vec![b"abcdef".to_vec()]);
        assert_eq!(
            drain(&mut stream, &mut scratch, 4, |_| {}).unwrap(),
            Drained::Limit(4)
        );
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_received_count(
            chunks in prop::collection::vec(1usize..64, 1..16),
        ) {
            let total: usize = chunks.iter().sum();
            let split = chunks.iter().map(|&n| vec![b'x'; n]).collect();

            let mut chunked = ScriptedStream::new(split);
            let mut whole = ScriptedStream::new(vec![vec![b'x'; total]]);
            let mut scratch = [0u8; 16];

            let mut a = ClientCycle::new();
            let mut b = ClientCycle::new();
            a.record_received(drain(&mut chunked, &mut scratch, usize::MAX, |_| {}).unwrap().bytes());
            b.record_received(drain(&mut whole, &mut scratch, usize::MAX, |_| {}).unwrap().bytes());

            prop_assert_eq!(a.bytes_in_cycle(), total);
            prop_assert_eq!(a.bytes_in_cycle(), b.bytes_in_cycle());
        }
    }

    #[test]
    fn test_client_interest_sequence() {
        let payload = b"PING";
        let now = Instant::now();
        let mut cycle = ClientCycle::new();
        let mut sequence = vec![cycle.interest()];

        for _ in 0..3 {
            let progress = cycle.record_sent(payload.len(), payload.len(), now);
            assert!(matches!(progress, SendProgress::Transmitted { .. }));
            sequence.push(cycle.interest());

            cycle.record_received(payload.len());
            match cycle.complete_round(payload.len(), 3, now) {
                RoundOutcome::Retransmit => sequence.push(cycle.interest()),
                RoundOutcome::Finished { .. } => break,
                RoundOutcome::Incomplete => panic!("round should be complete"),
            }
        }

        use InterestSet::*;
        assert_eq!(
            sequence,
            vec![WriteWait, ReadWait, WriteWait, ReadWait, WriteWait, ReadWait]
        );
        assert_eq!(cycle.transmit_count(), 3);
    }

    #[test]
    fn test_first_transmit_flag() {
        let now = Instant::now();
        let mut cycle = ClientCycle::new();

        assert_eq!(
            cycle.record_sent(4, 4, now),
            SendProgress::Transmitted { first: true }
        );
        cycle.record_received(4);
        assert_eq!(cycle.complete_round(4, 2, now), RoundOutcome::Retransmit);
        assert_eq!(
            cycle.record_sent(4, 4, now),
            SendProgress::Transmitted { first: false }
        );
    }

    #[test]
    fn test_partial_send_stays_in_write_wait() {
        let payload = b"HELLO";
        let mut cycle = ClientCycle::new();
        let now = Instant::now();

        assert_eq!(cycle.record_sent(2, payload.len(), now), SendProgress::Partial);
        assert_eq!(cycle.interest(), InterestSet::WriteWait);
        assert_eq!(cycle.unsent(payload), b"LLO");
        assert_eq!(cycle.transmit_count(), 0);

        cycle.record_sent(3, payload.len(), now);
        assert_eq!(cycle.interest(), InterestSet::ReadWait);
        assert_eq!(cycle.unsent(payload), b"HELLO");
    }

    #[test]
    fn test_round_incomplete_until_threshold() {
        let now = Instant::now();
        let mut cycle = ClientCycle::new();
        cycle.record_sent(4, 4, now);

        cycle.record_received(3);
        assert_eq!(cycle.complete_round(4, 1, now), RoundOutcome::Incomplete);
        assert_eq!(cycle.interest(), InterestSet::ReadWait);

        cycle.record_received(1);
        assert!(matches!(
            cycle.complete_round(4, 1, now),
            RoundOutcome::Finished { .. }
        ));
    }

    #[test]
    fn test_surplus_bytes_carry_over() {
        let now = Instant::now();
        let mut cycle = ClientCycle::new();
        cycle.record_sent(4, 4, now);

        cycle.record_received(6);
        assert_eq!(cycle.complete_round(4, 5, now), RoundOutcome::Retransmit);
        assert_eq!(cycle.bytes_in_cycle(), 2);
    }

    #[test]
    fn test_service_time_measured_from_first_transmit() {
        let start = Instant::now();
        let mut cycle = ClientCycle::new();
        cycle.record_sent(4, 4, start);
        cycle.record_received(4);

        let later = start + Duration::from_millis(25);
        assert_eq!(
            cycle.complete_round(4, 1, later),
            RoundOutcome::Finished {
                service_time: Duration::from_millis(25)
            }
        );

        cycle.reset();
        assert_eq!(cycle.interest(), InterestSet::WriteWait);
        assert_eq!(cycle.transmit_count(), 0);
        assert_eq!(cycle.bytes_in_cycle(), 0);
        assert!(!cycle.is_active());
    }

    #[test]
    fn test_echo_reads_then_writes_back() {
        let stream = ScriptedStream::new(vec![b"hello ".to_vec(), b"world".to_vec()]);
        let mut conn = EchoConnection::new(stream, 1024);
        let mut scratch = [0u8; 4];

        assert_eq!(
            conn.on_readable(&mut scratch).unwrap(),
            EchoStep::Switch(InterestSet::WriteWait)
        );
        assert_eq!(conn.pending(), 11);

        assert_eq!(
            conn.on_writable().unwrap(),
            EchoStep::Switch(InterestSet::ReadWait)
        );
        assert_eq!(conn.stream().written, b"hello world");
        assert_eq!(conn.pending(), 0);
    }

    #[test]
    fn test_echo_partial_write_keeps_write_wait() {
        let mut stream = ScriptedStream::new(vec![b"abcdef".to_vec()]);
        stream.write_budget = 4;
        let mut conn = EchoConnection::new(stream, 1024);
        let mut scratch = [0u8; 16];

        conn.on_readable(&mut scratch).unwrap();
        assert_eq!(conn.on_writable().unwrap(), EchoStep::Stay);
        assert_eq!(conn.interest(), InterestSet::WriteWait);
        assert_eq!(conn.pending(), 2);

        conn.stream.write_budget = usize::MAX;
        assert_eq!(
            conn.on_writable().unwrap(),
            EchoStep::Switch(InterestSet::ReadWait)
        );
        assert_eq!(conn.stream().written, b"abcdef");
    }

    #[test]
    fn test_echo_closes_on_eof() {
        let mut stream = ScriptedStream::new(Vec::new());
        stream.closed = true;
        let mut conn = EchoConnection::new(stream, 1024);
        let mut scratch = [0u8; 16];

        assert_eq!(conn.on_readable(&mut scratch).unwrap(), EchoStep::Close);
    }

    #[test]
    fn test_echo_pending_cap_bounds_reads() {
        let stream = ScriptedStream::new(vec![vec![b'z'; 100]]);
        let mut conn = EchoConnection::new(stream, 40);
        let mut scratch = [0u8; 16];

        conn.on_readable(&mut scratch).unwrap();
        assert_eq!(conn.pending(), 40);

        conn.on_writable().unwrap();
        conn.on_readable(&mut scratch).unwrap();
        conn.on_writable().unwrap();
        conn.on_readable(&mut scratch).unwrap();
        conn.on_writable().unwrap();
        assert_eq!(conn.stream().written.len(), 100);
    }

    #[test]
    fn test_stale_readiness_is_ignored() {
        let stream = ScriptedStream::new(vec![b"x".to_vec()]);
        let mut conn = EchoConnection::new(stream, 1024);

        assert_eq!(conn.on_writable().unwrap(), EchoStep::Stay);
        assert_eq!(conn.interest(), InterestSet::ReadWait);
    }
}
