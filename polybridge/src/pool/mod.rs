//! Bounded pool of transports.
//!
//! Leases are handed out round-robin among workers with spare capacity. When
//! every worker is saturated and the pool is at `max_workers`, callers queue
//! in FIFO order until a lease is released, a worker is removed (making room
//! for a new one) or `queue_timeout` elapses.
//!
//! ```text
//! acquire ─┬─ free slot on a ready worker ──────────► lease
//!          ├─ headroom below max_workers ── create ─► lease
//!          └─ otherwise ── FIFO queue ── release ───► lease
//!                                    └── timeout ───► Timeout
//! ```
//!
//! Total concurrency never exceeds `max_workers * max_concurrent_per_worker`.

mod lease;
mod worker;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::EncodedRequest;
use crate::context::{BoundedContext, ContextState};
use crate::disposable::{Disposable, collect_dispose_errors};
use crate::error::BridgeError;
use crate::transport::{Transport, bounded};

pub use lease::PooledWorker;
pub use worker::{WorkerId, WorkerSnapshot};

use worker::WorkerSlot;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on live workers, including ones being created. At least 1.
    pub max_workers: usize,
    /// Concurrent leases per worker; `None` is unlimited.
    pub max_concurrent_per_worker: Option<usize>,
    /// How long `acquire` may queue. Zero fails immediately when saturated.
    pub queue_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_concurrent_per_worker: Some(1),
            queue_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            ..Self::default()
        }
    }

    pub fn with_max_concurrent_per_worker(mut self, cap: Option<usize>) -> Self {
        self.max_concurrent_per_worker = cap.map(|c| c.max(1));
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }
}

/// Creates the transport behind a new pool worker.
///
/// The pool calls `init` on the returned transport before leasing it.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn create(&self, id: WorkerId) -> Result<Arc<dyn Transport>, BridgeError>;
}

struct Grant {
    id: WorkerId,
    transport: Arc<dyn Transport>,
}

/// `Ok(None)` asks the waiter to re-run placement: capacity to create opened up.
type WaiterMessage = Result<Option<Grant>, BridgeError>;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<WaiterMessage>,
}

#[derive(Default)]
struct PoolState {
    workers: Vec<WorkerSlot>,
    waiters: VecDeque<Waiter>,
    creating: usize,
    cursor: usize,
    next_waiter: u64,
}

impl PoolState {
    fn pick_available(&mut self, cap: Option<usize>) -> Option<usize> {
        let n = self.workers.len();
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            if self.workers[idx].has_capacity(cap) {
                self.cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    fn headroom(&self, max_workers: usize) -> usize {
        max_workers.saturating_sub(self.workers.len() + self.creating)
    }

    fn position(&self, id: WorkerId) -> Option<usize> {
        self.workers.iter().position(|w| w.id == id)
    }

    /// Idle workers whose transport is no longer ready.
    fn take_dead(&mut self) -> Vec<WorkerSlot> {
        let mut dead = Vec::new();
        let mut i = 0;
        while i < self.workers.len() {
            let slot = &self.workers[i];
            if slot.in_flight == 0 && !slot.transport.is_ready() {
                dead.push(self.workers.remove(i));
            } else {
                i += 1;
            }
        }
        dead
    }
}

enum Placement {
    Leased(PooledWorker),
    Create(CreatingGuard),
    Wait(u64, oneshot::Receiver<WaiterMessage>),
}

type PruneHook = Box<dyn Fn(WorkerId) + Send + Sync>;

pub(crate) struct PoolInner {
    name: String,
    config: PoolConfig,
    factory: Arc<dyn WorkerFactory>,
    context: BoundedContext,
    state: StdMutex<PoolState>,
    on_pruned: OnceLock<PruneHook>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        lock(&self.state)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.context.is_disposed()
    }

    fn disposed_error(&self) -> BridgeError {
        BridgeError::disposed(format!("{} has been disposed", self.name))
    }

    pub(crate) fn release(&self, id: WorkerId) {
        let mut state = self.lock();
        let Some(idx) = state.position(id) else {
            return;
        };
        let slot = &mut state.workers[idx];
        slot.in_flight = slot.in_flight.saturating_sub(1);
        slot.served += 1;
        slot.last_used = std::time::Instant::now();
        self.dispatch(&mut state);
    }

    /// Hand free slots to queued waiters, oldest first.
    fn dispatch(&self, state: &mut PoolState) {
        let cap = self.config.max_concurrent_per_worker;
        while !state.waiters.is_empty() {
            let Some(idx) = state.pick_available(cap) else {
                break;
            };
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            let slot = &mut state.workers[idx];
            slot.in_flight += 1;
            let grant = Grant {
                id: slot.id,
                transport: Arc::clone(&slot.transport),
            };
            if waiter.tx.send(Ok(Some(grant))).is_err() {
                // Waiter gave up between queueing and dispatch.
                slot.in_flight -= 1;
            }
        }
        self.wake_creators(state);
    }

    /// Let as many waiters as there is headroom retry placement so they can create.
    fn wake_creators(&self, state: &mut PoolState) {
        let mut headroom = state.headroom(self.config.max_workers);
        while headroom > 0 {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.tx.send(Ok(None)).is_ok() {
                headroom -= 1;
            }
        }
    }

    fn lease(self: &Arc<Self>, id: WorkerId, transport: Arc<dyn Transport>) -> PooledWorker {
        PooledWorker::new(id, transport, Arc::downgrade(self))
    }
}

/// Keeps the `creating` count honest if worker creation is abandoned midway.
struct CreatingGuard {
    pool: Arc<PoolInner>,
    id: WorkerId,
    active: bool,
}

impl CreatingGuard {
    fn finish(mut self, state: &mut PoolState) {
        self.active = false;
        state.creating = state.creating.saturating_sub(1);
    }
}

impl Drop for CreatingGuard {
    fn drop(&mut self) {
        if self.active {
            let mut state = self.pool.lock();
            state.creating = state.creating.saturating_sub(1);
            self.pool.wake_creators(&mut state);
        }
    }
}

/// Disposes every pooled worker and rejects queued waiters.
struct WorkerDrain {
    pool: Weak<PoolInner>,
}

#[async_trait]
impl Disposable for WorkerDrain {
    async fn dispose(&self) -> Result<(), BridgeError> {
        let Some(pool) = self.pool.upgrade() else {
            return Ok(());
        };
        let (workers, waiters) = {
            let mut state = pool.lock();
            let workers: Vec<WorkerSlot> = state.workers.drain(..).collect();
            let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
            (workers, waiters)
        };
        for waiter in waiters {
            let _ = waiter.tx.send(Err(pool.disposed_error()));
        }

        let mut errors = Vec::new();
        for slot in workers {
            tracing::debug!(pool = %pool.name, worker = %slot.id, "Disposing worker");
            if let Err(e) = slot.transport.dispose().await {
                tracing::warn!(pool = %pool.name, worker = %slot.id, error = %e, "Worker disposal failed");
                errors.push(e);
            }
        }
        collect_dispose_errors(errors)
    }
}

/// Cheap to clone; clones share the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, factory: Arc<dyn WorkerFactory>) -> Self {
        Self::named("worker pool", config, factory)
    }

    pub fn named(name: impl Into<String>, mut config: PoolConfig, factory: Arc<dyn WorkerFactory>) -> Self {
        let name = name.into();
        config.max_workers = config.max_workers.max(1);
        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner>| {
            let context = BoundedContext::without_init(name.clone());
            let _ = context.track_resource(Arc::new(WorkerDrain { pool: weak.clone() }));
            PoolInner {
                name,
                config,
                factory,
                context,
                state: StdMutex::new(PoolState::default()),
                on_pruned: OnceLock::new(),
            }
        });
        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ContextState {
        self.inner.context.state()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Live workers, not counting ones being created.
    pub fn len(&self) -> usize {
        self.inner.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Callers currently queued in `acquire`.
    pub fn waiting(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.inner.lock().workers.iter().map(WorkerSlot::snapshot).collect()
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.inner.lock().position(id).is_some()
    }

    /// Run `hook` for every exited worker the pool drops on its own.
    ///
    /// Only the first hook is kept. It runs outside the pool lock.
    pub fn on_worker_pruned<F>(&self, hook: F)
    where
        F: Fn(WorkerId) + Send + Sync + 'static,
    {
        if self.inner.on_pruned.set(Box::new(hook)).is_err() {
            tracing::debug!(pool = %self.inner.name, "Prune hook already set");
        }
    }

    /// Lease a worker, creating one or queueing as needed.
    pub async fn acquire(&self) -> Result<PooledWorker, BridgeError> {
        let deadline = Instant::now() + self.inner.config.queue_timeout;

        loop {
            self.prune_dead().await;

            let placement = self.place()?;
            match placement {
                Placement::Leased(lease) => return Ok(lease),
                Placement::Create(guard) => {
                    let (id, transport) = self.create_worker(guard, true).await?;
                    return Ok(self.inner.lease(id, transport));
                }
                Placement::Wait(waiter_id, mut rx) => {
                    match tokio::time::timeout_at(deadline, &mut rx).await {
                        Ok(Ok(Ok(Some(grant)))) => return Ok(self.inner.lease(grant.id, grant.transport)),
                        Ok(Ok(Ok(None))) => continue,
                        Ok(Ok(Err(e))) => return Err(e),
                        Ok(Err(_)) => return Err(self.inner.disposed_error()),
                        Err(_) => return self.abandon_wait(waiter_id, rx),
                    }
                }
            }
        }
    }

    fn place(&self) -> Result<Placement, BridgeError> {
        let mut state = self.inner.lock();
        if self.inner.is_disposed() {
            return Err(self.inner.disposed_error());
        }

        // Queued callers go first; a newcomer only jumps in when nobody waits.
        if state.waiters.is_empty()
            && let Some(idx) = state.pick_available(self.inner.config.max_concurrent_per_worker)
        {
            let slot = &mut state.workers[idx];
            slot.in_flight += 1;
            return Ok(Placement::Leased(
                self.inner.lease(slot.id, Arc::clone(&slot.transport)),
            ));
        }

        if state.headroom(self.inner.config.max_workers) > 0 {
            state.creating += 1;
            return Ok(Placement::Create(CreatingGuard {
                pool: Arc::clone(&self.inner),
                id: WorkerId::new(),
                active: true,
            }));
        }

        if self.inner.config.queue_timeout.is_zero() {
            return Err(self.exhausted_error());
        }

        let (tx, rx) = oneshot::channel();
        let id = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.push_back(Waiter { id, tx });
        tracing::trace!(pool = %self.inner.name, waiter = id, queued = state.waiters.len(), "Queued for worker");
        Ok(Placement::Wait(id, rx))
    }

    fn abandon_wait(
        &self,
        waiter_id: u64,
        mut rx: oneshot::Receiver<WaiterMessage>,
    ) -> Result<PooledWorker, BridgeError> {
        let mut state = self.inner.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
            state.waiters.remove(pos);
            return Err(self.exhausted_error());
        }
        drop(state);
        // Dispatched under the lock, so whatever was sent is already here.
        match rx.try_recv() {
            Ok(Ok(Some(grant))) => Ok(self.inner.lease(grant.id, grant.transport)),
            Ok(Err(e)) => Err(e),
            _ => Err(self.exhausted_error()),
        }
    }

    fn exhausted_error(&self) -> BridgeError {
        BridgeError::timeout(format!(
            "{} exhausted: no worker available within {}ms",
            self.inner.name,
            self.inner.config.queue_timeout.as_millis()
        ))
    }

    /// Create, init and register a worker. With `leased`, the caller holds
    /// its first concurrency unit.
    async fn create_worker(
        &self,
        guard: CreatingGuard,
        leased: bool,
    ) -> Result<(WorkerId, Arc<dyn Transport>), BridgeError> {
        let id = guard.id;
        tracing::debug!(pool = %self.inner.name, worker = %id, "Creating worker");

        let created = async {
            let transport = self.inner.factory.create(id).await?;
            if let Err(e) = transport.init().await {
                let _ = transport.dispose().await;
                return Err(e);
            }
            Ok(transport)
        }
        .await;

        let transport = match created {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(pool = %self.inner.name, worker = %id, error = %e, "Worker creation failed");
                let mut state = self.inner.lock();
                guard.finish(&mut state);
                self.inner.wake_creators(&mut state);
                return Err(e);
            }
        };

        let registered = {
            let mut state = self.inner.lock();
            guard.finish(&mut state);
            if self.inner.is_disposed() {
                false
            } else {
                let mut slot = WorkerSlot::new(id, Arc::clone(&transport));
                if leased {
                    slot.in_flight = 1;
                }
                state.workers.push(slot);
                self.inner.dispatch(&mut state);
                true
            }
        };

        if !registered {
            let _ = transport.dispose().await;
            return Err(self.inner.disposed_error());
        }
        tracing::info!(pool = %self.inner.name, worker = %id, "Worker ready");
        Ok((id, transport))
    }

    async fn prune_dead(&self) {
        let dead = self.inner.lock().take_dead();
        for slot in dead {
            tracing::info!(pool = %self.inner.name, worker = %slot.id, "Removing exited worker");
            if let Some(hook) = self.inner.on_pruned.get() {
                hook(slot.id);
            }
            if let Err(e) = slot.transport.dispose().await {
                tracing::debug!(worker = %slot.id, error = %e, "Exited worker disposal failed");
            }
        }
    }

    /// Lease a specific worker regardless of its concurrency cap.
    ///
    /// Used to route follow-up calls to the worker that owns an instance.
    pub fn acquire_worker(&self, id: WorkerId) -> Result<PooledWorker, BridgeError> {
        let mut state = self.inner.lock();
        if self.inner.is_disposed() {
            return Err(self.inner.disposed_error());
        }
        let idx = state.position(id).ok_or_else(|| {
            BridgeError::execution("WorkerUnavailable", format!("worker {id} is no longer in the pool"))
        })?;
        let slot = &mut state.workers[idx];
        slot.in_flight += 1;
        Ok(self.inner.lease(id, Arc::clone(&slot.transport)))
    }

    /// Take a worker out of rotation. Outstanding leases stay usable until
    /// dropped; the caller owns the returned transport.
    pub fn remove(&self, id: WorkerId) -> Option<Arc<dyn Transport>> {
        let mut state = self.inner.lock();
        let idx = state.position(id)?;
        let slot = state.workers.remove(idx);
        if state.cursor >= state.workers.len() {
            state.cursor = 0;
        }
        self.inner.wake_creators(&mut state);
        tracing::debug!(pool = %self.inner.name, worker = %id, "Worker removed");
        Some(slot.transport)
    }

    /// Remove idle workers matching `filter`, never dropping below `floor`.
    pub fn retire_idle<F>(&self, floor: usize, filter: F) -> Vec<(WorkerId, Arc<dyn Transport>)>
    where
        F: Fn(&WorkerSnapshot) -> bool,
    {
        let mut state = self.inner.lock();
        let mut retired = Vec::new();
        let mut i = 0;
        while i < state.workers.len() {
            if state.workers.len() <= floor {
                break;
            }
            let slot = &state.workers[i];
            if slot.in_flight == 0 && filter(&slot.snapshot()) {
                let slot = state.workers.remove(i);
                retired.push((slot.id, slot.transport));
            } else {
                i += 1;
            }
        }
        if state.cursor >= state.workers.len() {
            state.cursor = 0;
        }
        if !retired.is_empty() {
            self.inner.wake_creators(&mut state);
        }
        retired
    }

    /// Create workers until at least `count` exist (capped at `max_workers`).
    pub async fn ensure_workers(&self, count: usize) -> Result<(), BridgeError> {
        let target = count.min(self.inner.config.max_workers);
        loop {
            let guard = {
                let mut state = self.inner.lock();
                if self.inner.is_disposed() {
                    return Err(self.inner.disposed_error());
                }
                if state.workers.len() + state.creating >= target {
                    return Ok(());
                }
                state.creating += 1;
                CreatingGuard {
                    pool: Arc::clone(&self.inner),
                    id: WorkerId::new(),
                    active: true,
                }
            };
            self.create_worker(guard, false).await?;
        }
    }

    /// Run `f` with a leased worker; the lease is released however `f` ends.
    pub async fn with_worker<T, F, Fut>(&self, f: F) -> Result<T, BridgeError>
    where
        F: FnOnce(WorkerId, Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        let lease = self.acquire().await?;
        let result = f(lease.id(), Arc::clone(lease.transport())).await;
        lease.release();
        result
    }

    pub async fn dispose(&self) -> Result<(), BridgeError> {
        self.inner.context.dispose().await
    }
}

#[async_trait]
impl Disposable for WorkerPool {
    async fn dispose(&self) -> Result<(), BridgeError> {
        WorkerPool::dispose(self).await
    }
}

/// The pool as a transport: each request leases any worker.
///
/// Requests that depend on a particular worker (instance handles) need
/// routing on top, see `ProcessChannel`.
#[async_trait]
impl Transport for WorkerPool {
    async fn init(&self) -> Result<(), BridgeError> {
        self.inner.context.init().await
    }

    async fn send(
        &self,
        request: &EncodedRequest,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, BridgeError> {
        bounded(
            async {
                let lease = self.acquire().await?;
                lease.send(request, Duration::ZERO, None).await
            },
            timeout,
            cancel,
            "pooled request",
        )
        .await
    }

    fn is_ready(&self) -> bool {
        !self.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::bridge::codec::BridgeCodec;
    use crate::bridge::protocol::{ProtocolMessage, Request};
    use crate::transport::testing::MockTransport;

    struct MockFactory {
        created: StdMutex<Vec<Arc<MockTransport>>>,
        delay: Duration,
        fail_first: AtomicUsize,
    }

    impl MockFactory {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                created: StdMutex::new(Vec::new()),
                delay,
                fail_first: AtomicUsize::new(0),
            })
        }

        fn created(&self) -> Vec<Arc<MockTransport>> {
            lock(&self.created).clone()
        }
    }

    #[async_trait]
    impl WorkerFactory for MockFactory {
        async fn create(&self, _id: WorkerId) -> Result<Arc<dyn Transport>, BridgeError> {
            let failing = self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BridgeError::execution("SpawnError", "no interpreter"));
            }
            let mock = Arc::new(MockTransport::echo().with_delay(self.delay));
            lock(&self.created).push(Arc::clone(&mock));
            Ok(mock)
        }
    }

    fn pool(config: PoolConfig, factory: &Arc<MockFactory>) -> WorkerPool {
        WorkerPool::new(config, Arc::clone(factory) as Arc<dyn WorkerFactory>)
    }

    fn call_line(id: u64, value: i64) -> EncodedRequest {
        BridgeCodec::default()
            .encode_request(&ProtocolMessage::new(
                id,
                Request::Call {
                    module: "math".into(),
                    function_name: "ident".into(),
                    args: vec![json!(value)],
                    kwargs: Default::default(),
                },
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn reuses_released_worker() {
        let factory = MockFactory::new(Duration::ZERO);
        let pool = pool(PoolConfig::new(3), &factory);

        let first = pool.acquire().await.unwrap();
        let id = first.id();
        first.release();
        let second = pool.acquire().await.unwrap();

        assert_eq!(second.id(), id);
        assert_eq!(factory.created().len(), 1);
        assert_eq!(factory.created()[0].inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_workers_times_cap() {
        let factory = MockFactory::new(Duration::from_millis(15));
        let pool = pool(
            PoolConfig::new(2).with_max_concurrent_per_worker(Some(2)),
            &factory,
        );

        let tasks: Vec<_> = (0..24)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let raw = pool.send(&call_line(i, i as i64), Duration::ZERO, None).await?;
                    Ok::<_, BridgeError>(raw)
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let created = factory.created();
        assert!(created.len() <= 2);
        let total: usize = created.iter().map(|m| m.sends.load(Ordering::SeqCst)).sum();
        assert_eq!(total, 24);
        for mock in &created {
            assert!(mock.peak_in_flight.load(Ordering::SeqCst) <= 2);
        }
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let factory = MockFactory::new(Duration::ZERO);
        let pool = pool(PoolConfig::new(1), &factory);
        let order = Arc::new(StdMutex::new(Vec::new()));

        let held = pool.acquire().await.unwrap();
        let mut tasks = Vec::new();
        for n in 1..=3 {
            let pool = pool.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                lock(&order).push(n);
                drop(lease);
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.waiting(), 3);

        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*lock(&order), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn zero_queue_timeout_fails_fast_when_saturated() {
        let factory = MockFactory::new(Duration::ZERO);
        let pool = pool(PoolConfig::new(1).with_queue_timeout(Duration::ZERO), &factory);

        let _held = pool.acquire().await.unwrap();
        let started = std::time::Instant::now();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(ref m) if m.contains("exhausted")));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn queue_timeout_removes_the_waiter() {
        let factory = MockFactory::new(Duration::ZERO);
        let pool = pool(
            PoolConfig::new(1).with_queue_timeout(Duration::from_millis(30)),
            &factory,
        );

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        assert_eq!(pool.waiting(), 0);

        drop(held);
        pool.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn dispose_rejects_waiters_and_disposes_workers() {
        let factory = MockFactory::new(Duration::ZERO);
        let pool = pool(PoolConfig::new(1), &factory);

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.dispose().await.unwrap();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Disposed(_)));
        assert_eq!(factory.created()[0].disposals.load(Ordering::SeqCst), 1);

        let err = held.send(&call_line(1, 1), Duration::ZERO, None).await.unwrap_err();
        assert!(matches!(err, BridgeError::Disposed(_)));
        assert!(matches!(pool.acquire().await, Err(BridgeError::Disposed(_))));
        pool.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn removing_a_worker_lets_a_waiter_create_one() {
        let factory = MockFactory::new(Duration::ZERO);
        let pool = pool(PoolConfig::new(1), &factory);

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|lease| lease.id()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let removed = pool.remove(held.id()).unwrap();
        removed.dispose().await.unwrap();
        let new_id = waiter.await.unwrap().unwrap();

        assert_ne!(new_id, held.id());
        assert_eq!(factory.created().len(), 2);
        // Releasing a lease on a removed worker is a no-op.
        drop(held);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn affinity_lease_ignores_cap() {
        let factory = MockFactory::new(Duration::ZERO);
        let pool = pool(PoolConfig::new(1), &factory);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire_worker(first.id()).unwrap();
        assert_eq!(second.id(), first.id());
        assert_eq!(pool.snapshot()[0].in_flight, 2);

        let err = pool.acquire_worker(WorkerId::new()).unwrap_err();
        assert!(matches!(err, BridgeError::Execution { ref kind, .. } if kind == "WorkerUnavailable"));
    }

    #[tokio::test]
    async fn retire_idle_keeps_floor_and_busy_workers() {
        let factory = MockFactory::new(Duration::ZERO);
        let pool = pool(PoolConfig::new(3), &factory);
        pool.ensure_workers(3).await.unwrap();
        assert_eq!(pool.len(), 3);

        let busy = pool.acquire().await.unwrap();
        let retired = pool.retire_idle(1, |_| true);
        assert_eq!(retired.len(), 2);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.snapshot()[0].id, busy.id());

        drop(busy);
        assert!(pool.retire_idle(1, |_| true).is_empty());
    }

    #[tokio::test]
    async fn failed_creation_frees_the_slot() {
        let factory = MockFactory::new(Duration::ZERO);
        factory.fail_first.store(1, Ordering::SeqCst);
        let pool = pool(PoolConfig::new(1), &factory);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, BridgeError::Execution { ref kind, .. } if kind == "SpawnError"));
        pool.acquire().await.unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn exited_idle_workers_are_replaced() {
        let factory = MockFactory::new(Duration::ZERO);
        let pool = pool(PoolConfig::new(1), &factory);
        let pruned = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&pruned);
        pool.on_worker_pruned(move |id| seen.lock().unwrap().push(id));

        let first = pool.acquire().await.unwrap();
        let first_id = first.id();
        first.release();
        factory.created()[0].dispose().await.unwrap();

        pool.acquire().await.unwrap();
        assert_eq!(factory.created().len(), 2);
        assert!(!pool.contains(first_id));
        assert_eq!(*pruned.lock().unwrap(), vec![first_id]);
    }

    #[tokio::test]
    async fn with_worker_releases_on_error() {
        let factory = MockFactory::new(Duration::ZERO);
        let pool = pool(PoolConfig::new(1), &factory);

        let err = pool
            .with_worker(|_, _| async { Err::<(), _>(BridgeError::execution("ValueError", "boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Execution { .. }));
        assert_eq!(pool.snapshot()[0].in_flight, 0);
        assert_eq!(pool.snapshot()[0].served, 1);
    }
}
