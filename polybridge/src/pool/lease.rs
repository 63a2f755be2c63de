//! Worker lease: returns its slot to the pool on release or drop.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::PoolInner;
use super::worker::WorkerId;
use crate::bridge::codec::EncodedRequest;
use crate::error::BridgeError;
use crate::transport::Transport;

/// Exclusive use of one unit of a worker's concurrency.
///
/// Dropping the lease releases it; a lease never outlives pool disposal in
/// a usable state.
pub struct PooledWorker {
    id: WorkerId,
    transport: Arc<dyn Transport>,
    pool: Weak<PoolInner>,
    released: bool,
}

impl PooledWorker {
    pub(crate) fn new(id: WorkerId, transport: Arc<dyn Transport>, pool: Weak<PoolInner>) -> Self {
        Self {
            id,
            transport,
            pool,
            released: false,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send through the leased worker. Fails once the pool is disposed.
    pub async fn send(
        &self,
        request: &EncodedRequest,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, BridgeError> {
        match self.pool.upgrade() {
            Some(pool) if !pool.is_disposed() => {}
            _ => return Err(BridgeError::disposed("worker pool has been disposed")),
        }
        self.transport.send(request, timeout, cancel).await
    }

    /// Return the lease now instead of on drop.
    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.id);
        }
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl std::fmt::Debug for PooledWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledWorker")
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}
