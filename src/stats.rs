//! Per-process session statistics for the load generator.
//!
//! Each worker keeps its own `AggregateStats`; nothing is merged across
//! processes. The running mean is updated incrementally so no service-time
//! history is kept.

use chrono::{DateTime, Local};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateStats {
    min_service_time: Option<Duration>,
    max_service_time: Option<Duration>,
    avg_service_ms: f64,
    total_sessions: u64,
    failed_sessions: u64,
    peak_concurrent: u64,
    current_concurrent: u64,
}

impl AggregateStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A slot sent its first payload.
    pub fn session_started(&mut self) {
        self.current_concurrent += 1;
        self.peak_concurrent = self.peak_concurrent.max(self.current_concurrent);
    }

    /// A session finished its full transmit budget.
    pub fn session_completed(&mut self, service_time: Duration) {
        self.current_concurrent = self.current_concurrent.saturating_sub(1);
        self.total_sessions += 1;

        self.min_service_time = Some(match self.min_service_time {
            Some(min) => min.min(service_time),
            None => service_time,
        });
        self.max_service_time = Some(match self.max_service_time {
            Some(max) => max.max(service_time),
            None => service_time,
        });

        let sample = as_millis_f64(service_time);
        self.avg_service_ms += (sample - self.avg_service_ms) / self.total_sessions as f64;
    }

    /// An active session was torn down by the peer or a socket error.
    pub fn session_failed(&mut self) {
        self.current_concurrent = self.current_concurrent.saturating_sub(1);
        self.failed_sessions += 1;
    }

    pub fn min_service_time(&self) -> Option<Duration> {
        self.min_service_time
    }

    pub fn max_service_time(&self) -> Option<Duration> {
        self.max_service_time
    }

    /// Mean service time in milliseconds; `None` before the first session.
    pub fn avg_service_ms(&self) -> Option<f64> {
        (self.total_sessions > 0).then_some(self.avg_service_ms)
    }

    pub fn total_sessions(&self) -> u64 {
        self.total_sessions
    }

    pub fn failed_sessions(&self) -> u64 {
        self.failed_sessions
    }

    pub fn peak_concurrent(&self) -> u64 {
        self.peak_concurrent
    }

    pub fn current_concurrent(&self) -> u64 {
        self.current_concurrent
    }
}

fn as_millis_f64(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

/// Final per-worker report printed when the worker is stopped.
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub pid: u32,
    pub started_at: DateTime<Local>,
    pub target_sessions: usize,
    pub runtime: Duration,
    pub stats: AggregateStats,
}

impl StatsReport {
    /// Completed sessions per second over the whole runtime.
    pub fn sessions_rate(&self) -> f64 {
        let secs = self.runtime.as_secs_f64();
        if secs > 0.0 {
            self.stats.total_sessions() as f64 / secs
        } else {
            0.0
        }
    }
}

struct Millis(Option<f64>);

impl fmt::Display for Millis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ms) => write!(f, "{ms:.3} ms"),
            None => f.write_str("n/a"),
        }
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = &self.stats;
        writeln!(f)?;
        writeln!(f, "[{}] started {}", self.pid, self.started_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "    minServiceTime: {}", Millis(stats.min_service_time().map(as_millis_f64)))?;
        writeln!(f, "    maxServiceTime: {}", Millis(stats.max_service_time().map(as_millis_f64)))?;
        writeln!(f, "    avgServiceTime: {}", Millis(stats.avg_service_ms()))?;
        writeln!(f, " totalSessionCount: {}", stats.total_sessions())?;
        writeln!(f, "targetSessionCount: {}", self.target_sessions)?;
        writeln!(f, "  peakSessionCount: {}", stats.peak_concurrent())?;
        writeln!(f, "failedSessionCount: {}", stats.failed_sessions())?;
        writeln!(f, "      sessionsRate: {:.3} sessions served per second", self.sessions_rate())?;
        writeln!(f, "      totalRuntime: {} ms", self.runtime.as_millis())
    }
}
