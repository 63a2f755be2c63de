//! Health and per-worker statistics for the process bridge.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::cache::CacheStats;
use crate::pool::WorkerId;

/// Overall state of a process bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Not initialized yet
    #[default]
    Unknown,
    /// Spawning the initial workers
    Starting,
    /// At least one worker can take a request
    Ready,
    /// Every worker is saturated and callers are queued
    Busy,
    /// Disposed
    Defunct,
}

/// Counters kept for every live worker.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub pid: Option<u32>,
    pub requests: u64,
    pub errors: u64,
    pub total_time: Duration,
    pub last_used: Option<DateTime<Utc>>,
    started: Instant,
}

impl WorkerStats {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            requests: 0,
            errors: 0,
            total_time: Duration::ZERO,
            last_used: None,
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, elapsed: Duration, failed: bool) {
        self.requests += 1;
        if failed {
            self.errors += 1;
        }
        self.total_time += elapsed;
        self.last_used = Some(Utc::now());
    }

    pub fn average_time(&self) -> Duration {
        match u32::try_from(self.requests) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total_time / n,
            Err(_) => Duration::from_secs_f64(self.total_time.as_secs_f64() / self.requests as f64),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub ready: bool,
    pub in_flight: usize,
    pub requests: u64,
    pub errors: u64,
    pub total_time_ms: u64,
    pub average_time_ms: u64,
    pub instances: usize,
    pub uptime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<String>,
    /// RFC 3339.
    pub spawned_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: Health,
    pub workers: Vec<WorkerHealth>,
    pub waiting: usize,
    pub quarantined: u64,
    pub retired: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        matches!(self.status, Health::Ready | Health::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_over_requests() {
        let mut stats = WorkerStats::new(Some(42));
        assert_eq!(stats.average_time(), Duration::ZERO);
        stats.record(Duration::from_millis(10), false);
        stats.record(Duration::from_millis(30), true);
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.average_time(), Duration::from_millis(20));
        assert!(stats.last_used.is_some());
    }

    #[test]
    fn health_serializes_screaming() {
        insta::assert_json_snapshot!(Health::Busy, @r#""BUSY""#);
    }
}
