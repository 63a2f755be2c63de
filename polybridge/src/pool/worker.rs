//! Worker identity and the pool's per-worker bookkeeping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct WorkerId(uuid::Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) struct WorkerSlot {
    pub id: WorkerId,
    pub transport: Arc<dyn Transport>,
    pub in_flight: usize,
    pub served: u64,
    pub last_used: Instant,
    pub spawned_at: DateTime<Utc>,
}

impl WorkerSlot {
    pub fn new(id: WorkerId, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            transport,
            in_flight: 0,
            served: 0,
            last_used: Instant::now(),
            spawned_at: Utc::now(),
        }
    }

    pub fn has_capacity(&self, cap: Option<usize>) -> bool {
        self.transport.is_ready() && cap.is_none_or(|cap| self.in_flight < cap)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            ready: self.transport.is_ready(),
            in_flight: self.in_flight,
            served: self.served,
            idle_for: if self.in_flight == 0 {
                self.last_used.elapsed()
            } else {
                Duration::ZERO
            },
            spawned_at: self.spawned_at,
        }
    }
}

/// Point-in-time view of one pooled worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub ready: bool,
    pub in_flight: usize,
    /// Leases released so far.
    pub served: u64,
    /// Time since the last lease was released; zero while busy.
    #[serde(skip)]
    pub idle_for: Duration,
    pub spawned_at: DateTime<Utc>,
}
