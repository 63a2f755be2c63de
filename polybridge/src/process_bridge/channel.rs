//! Pool-backed transport with instance affinity, quarantine and recycling.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::config::ProcessBridgeConfig;
use super::env::{build_child_env, resolve_interpreter};
use super::health::{WorkerHealth, WorkerStats};
use crate::bridge::codec::{BridgeCodec, EncodedRequest};
use crate::bridge::protocol::{InstanceHandle, Method, ProtocolMessage, ProtocolResponse, Request};
use crate::disposable::Disposable;
use crate::error::BridgeError;
use crate::pool::{PoolConfig, PooledWorker, WorkerFactory, WorkerId, WorkerPool, WorkerSnapshot};
use crate::transport::{ProcessTransport, ProcessTransportConfig, Transport, bounded};

/// Execution kinds that mean the worker itself is gone or unusable.
const FATAL_KINDS: &[&str] = &[
    "WorkerExited",
    "BrokenPipe",
    "ConnectionReset",
    "SpawnError",
    "Quarantined",
];

/// Warm-up ids live far above anything a bridge counter reaches.
const WARMUP_ID_BASE: u64 = 1 << 62;

/// Whether a failed send should take its worker out of rotation.
///
/// A timeout counts only when the caller did not cancel.
pub fn should_quarantine(error: &BridgeError, cancel: Option<&CancellationToken>) -> bool {
    match error {
        BridgeError::Timeout(_) => !cancel.is_some_and(CancellationToken::is_cancelled),
        BridgeError::Execution { kind, .. } => FATAL_KINDS.contains(&kind.as_str()),
        _ => false,
    }
}

fn instance_lost(handle: &InstanceHandle) -> BridgeError {
    BridgeError::execution(
        "InstanceLost",
        format!("instance {handle} is gone: the worker that owned it was replaced"),
    )
}

fn parent_env() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os().filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
}

/// Spawns interpreter processes and runs warm-up calls on them.
pub struct ProcessWorkerFactory {
    config: Arc<ProcessBridgeConfig>,
    codec: Arc<BridgeCodec>,
    stats: Arc<DashMap<WorkerId, WorkerStats>>,
    warmup_ids: AtomicU64,
}

impl ProcessWorkerFactory {
    fn new(
        config: Arc<ProcessBridgeConfig>,
        codec: Arc<BridgeCodec>,
        stats: Arc<DashMap<WorkerId, WorkerStats>>,
    ) -> Self {
        Self {
            config,
            codec,
            stats,
            warmup_ids: AtomicU64::new(WARMUP_ID_BASE),
        }
    }

    fn transport_config(&self) -> Result<ProcessTransportConfig, BridgeError> {
        let env = build_child_env(parent_env(), &self.config)?;
        let mut transport_config = ProcessTransportConfig::new(resolve_interpreter(&self.config))
            .with_args(self.config.child_args())
            .with_env(env)
            .with_max_line_length(self.config.max_line_length)
            .with_kill_grace(self.config.kill_grace);
        if let Some(cwd) = &self.config.cwd {
            transport_config = transport_config.with_cwd(cwd.clone());
        }
        Ok(transport_config)
    }

    /// Failures are logged; a worker whose warm-up failed still serves.
    async fn warm_up(&self, id: WorkerId, transport: &ProcessTransport) {
        for warmup in &self.config.warmups {
            let message = ProtocolMessage::new(
                self.warmup_ids.fetch_add(1, Ordering::Relaxed),
                Request::Call {
                    module: warmup.module.clone(),
                    function_name: warmup.function.clone(),
                    args: warmup.args.clone(),
                    kwargs: None,
                },
            );
            let outcome = async {
                let encoded = self.codec.encode_request(&message)?;
                let raw = transport.send(&encoded, self.config.timeout, None).await?;
                self.codec.decode_response(&raw, encoded.id)
            }
            .await;
            match outcome {
                Ok(_) => tracing::debug!(
                    worker_id = %id,
                    module = %warmup.module,
                    function = %warmup.function,
                    "Warm-up call done"
                ),
                Err(e) => tracing::warn!(
                    worker_id = %id,
                    module = %warmup.module,
                    function = %warmup.function,
                    error = %e,
                    stderr = %transport.stderr_tail(),
                    "Warm-up call failed"
                ),
            }
        }
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn create(&self, id: WorkerId) -> Result<Arc<dyn Transport>, BridgeError> {
        let transport = Arc::new(ProcessTransport::new(self.transport_config()?));
        transport.init().await?;
        tracing::info!(worker_id = %id, pid = ?transport.pid(), "Spawned interpreter worker");
        self.warm_up(id, &transport).await;
        self.stats.insert(id, WorkerStats::new(transport.pid()));
        Ok(transport)
    }
}

/// The transport a [`ProcessBridge`](super::ProcessBridge) talks through.
///
/// Requests go to any pooled worker except instance-bound ones
/// (`call_method`, `dispose_instance`), which go to the worker that created
/// the instance.
pub struct ProcessChannel {
    this: Weak<ProcessChannel>,
    config: Arc<ProcessBridgeConfig>,
    pool: WorkerPool,
    stats: Arc<DashMap<WorkerId, WorkerStats>>,
    owners: DashMap<InstanceHandle, WorkerId>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    sweeping: AtomicBool,
    quarantined: AtomicU64,
    retired: AtomicU64,
}

impl ProcessChannel {
    pub fn new(config: ProcessBridgeConfig, codec: Arc<BridgeCodec>) -> Arc<Self> {
        let config = Arc::new(config);
        let stats = Arc::new(DashMap::new());
        let factory = ProcessWorkerFactory::new(Arc::clone(&config), codec, Arc::clone(&stats));
        Self::assemble(config, Arc::new(factory), stats)
    }

    /// Channel over workers from any factory.
    pub fn with_factory(config: ProcessBridgeConfig, factory: Arc<dyn WorkerFactory>) -> Arc<Self> {
        Self::assemble(Arc::new(config), factory, Arc::new(DashMap::new()))
    }

    fn assemble(
        config: Arc<ProcessBridgeConfig>,
        factory: Arc<dyn WorkerFactory>,
        stats: Arc<DashMap<WorkerId, WorkerStats>>,
    ) -> Arc<Self> {
        let pool_config = PoolConfig::new(config.max_processes)
            .with_max_concurrent_per_worker(config.max_concurrent_per_worker())
            .with_queue_timeout(config.wait_timeout);
        let pool = WorkerPool::named("process pool", pool_config, factory);
        let channel = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            pool,
            stats,
            owners: DashMap::new(),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            sweeping: AtomicBool::new(false),
            quarantined: AtomicU64::new(0),
            retired: AtomicU64::new(0),
        });

        let this = Arc::downgrade(&channel);
        channel.pool.on_worker_pruned(move |worker| {
            if let Some(channel) = this.upgrade() {
                let lost = channel.forget_worker(worker);
                tracing::debug!(worker_id = %worker, lost_instances = lost, "Forgot exited worker");
            }
        });
        channel
    }

    pub fn config(&self) -> &ProcessBridgeConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn quarantined_count(&self) -> u64 {
        self.quarantined.load(Ordering::Relaxed)
    }

    pub fn retired_count(&self) -> u64 {
        self.retired.load(Ordering::Relaxed)
    }

    /// Worker that owns `handle`, if it is still alive.
    pub fn owner_of(&self, handle: &InstanceHandle) -> Option<WorkerId> {
        self.owners.get(handle).map(|entry| *entry.value())
    }

    async fn lease_for(
        &self,
        request: &EncodedRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledWorker, BridgeError> {
        match (request.method, &request.handle) {
            (Method::CallMethod | Method::DisposeInstance, Some(handle)) => {
                let owner = self.owner_of(handle).ok_or_else(|| instance_lost(handle))?;
                self.pool.acquire_worker(owner).map_err(|_| instance_lost(handle))
            }
            _ => bounded(self.pool.acquire(), Duration::ZERO, cancel, "waiting for a worker").await,
        }
    }

    fn bind_instance(&self, worker: WorkerId, raw: &str) {
        let Ok(response) = serde_json::from_str::<ProtocolResponse>(raw) else {
            return;
        };
        if let Some(Value::String(handle)) = response.result
            && !handle.is_empty()
        {
            tracing::debug!(worker_id = %worker, handle = %handle, "Bound instance to worker");
            self.owners.insert(InstanceHandle::new(handle), worker);
        }
    }

    /// Workers already out of the pool get no new entry.
    fn record(&self, worker: WorkerId, elapsed: Duration, failed: bool) {
        if let Some(mut stats) = self.stats.get_mut(&worker) {
            stats.record(elapsed, failed);
        } else if self.pool.contains(worker) {
            self.stats
                .entry(worker)
                .or_insert_with(|| WorkerStats::new(None))
                .record(elapsed, failed);
        }
    }

    #[cfg(test)]
    fn stats_len(&self) -> usize {
        self.stats.len()
    }

    /// Forget a worker's bookkeeping; returns how many instances died with it.
    fn forget_worker(&self, worker: WorkerId) -> usize {
        self.stats.remove(&worker);
        let before = self.owners.len();
        self.owners.retain(|_, owner| *owner != worker);
        before.saturating_sub(self.owners.len())
    }

    /// Remove a worker, terminate it in the background and refill the floor.
    pub(crate) fn quarantine(&self, worker: WorkerId, reason: BridgeError) {
        let Some(transport) = self.pool.remove(worker) else {
            return;
        };
        self.quarantined.fetch_add(1, Ordering::Relaxed);
        let lost = self.forget_worker(worker);
        tracing::warn!(worker_id = %worker, lost_instances = lost, error = %reason, "Quarantining worker");

        self.tracker.spawn(async move {
            if let Err(e) = transport.terminate(reason).await {
                tracing::debug!(worker_id = %worker, error = %e, "Terminating quarantined worker failed");
            }
        });
        self.replenish();
    }

    /// Spawn workers up to `min_processes` without blocking the caller.
    fn replenish(&self) {
        let min = self.config.min_processes;
        if min == 0 || self.shutdown.is_cancelled() || self.pool.len() >= min {
            return;
        }
        let pool = self.pool.clone();
        let token = self.shutdown.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = pool.ensure_workers(min) => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "Failed to respawn workers");
                    }
                }
            }
        });
    }

    /// Recycle worn-out workers and retire idle ones above the floor.
    ///
    /// Workers that own live instances are never touched. Returns how many
    /// workers were retired.
    pub fn sweep(&self) -> usize {
        let owners: HashSet<WorkerId> = self.owners.iter().map(|entry| *entry.value()).collect();
        let idle_timeout = self.config.idle_timeout;
        let max_requests = self.config.max_requests_per_process;
        let free = |w: &WorkerSnapshot| !owners.contains(&w.id);

        let mut retired = self
            .pool
            .retire_idle(0, |w| free(w) && max_requests.is_some_and(|max| w.served >= max));
        if !idle_timeout.is_zero() {
            retired.extend(
                self.pool
                    .retire_idle(self.config.min_processes, |w| free(w) && w.idle_for >= idle_timeout),
            );
        }

        let count = retired.len();
        for (worker, transport) in retired {
            self.retired.fetch_add(1, Ordering::Relaxed);
            self.forget_worker(worker);
            tracing::info!(worker_id = %worker, "Retiring worker");
            self.tracker.spawn(async move {
                if let Err(e) = transport.terminate(BridgeError::disposed("worker retired")).await {
                    tracing::debug!(worker_id = %worker, error = %e, "Terminating retired worker failed");
                }
            });
        }
        self.replenish();
        count
    }

    fn start_sweep(&self) {
        let interval = self.config.sweep_interval;
        if interval.is_zero() || self.sweeping.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.this.clone();
        let token = self.shutdown.clone();
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(channel) = this.upgrade() else {
                    break;
                };
                let retired = channel.sweep();
                if retired > 0 {
                    tracing::debug!(retired, "Sweep finished");
                }
            }
        });
    }

    pub fn worker_health(&self) -> Vec<WorkerHealth> {
        let mut instances: std::collections::HashMap<WorkerId, usize> = Default::default();
        for entry in self.owners.iter() {
            *instances.entry(*entry.value()).or_default() += 1;
        }
        self.pool
            .snapshot()
            .into_iter()
            .map(|w| {
                let stats = self
                    .stats
                    .get(&w.id)
                    .map(|s| s.value().clone())
                    .unwrap_or_else(|| WorkerStats::new(None));
                WorkerHealth {
                    id: w.id,
                    pid: stats.pid,
                    ready: w.ready,
                    in_flight: w.in_flight,
                    requests: stats.requests,
                    errors: stats.errors,
                    total_time_ms: stats.total_time.as_millis() as u64,
                    average_time_ms: stats.average_time().as_millis() as u64,
                    instances: instances.get(&w.id).copied().unwrap_or(0),
                    uptime_ms: stats.uptime().as_millis() as u64,
                    last_used: stats.last_used.map(|t| t.to_rfc3339()),
                    spawned_at: w.spawned_at.to_rfc3339(),
                }
            })
            .collect()
    }
}

#[async_trait]
impl Disposable for ProcessChannel {
    /// Cancels background work without waiting for it and tears down every worker.
    async fn dispose(&self) -> Result<(), BridgeError> {
        self.shutdown.cancel();
        self.tracker.close();
        let result = self.pool.dispose().await;
        self.owners.clear();
        self.stats.clear();
        result
    }
}

#[async_trait]
impl Transport for ProcessChannel {
    async fn init(&self) -> Result<(), BridgeError> {
        self.pool.init().await?;
        self.pool.ensure_workers(self.config.min_processes).await?;
        self.start_sweep();
        Ok(())
    }

    async fn send(
        &self,
        request: &EncodedRequest,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, BridgeError> {
        let lease = self.lease_for(request, cancel).await?;
        let worker = lease.id();
        let started = Instant::now();
        let result = lease.send(request, timeout, cancel).await;
        self.record(worker, started.elapsed(), result.is_err());

        match &result {
            Ok(raw) if request.method == Method::Instantiate => self.bind_instance(worker, raw),
            Err(e) if should_quarantine(e, cancel) => {
                tracing::debug!(request_id = request.id, worker_id = %worker, "Transport failure");
                self.quarantine(worker, e.clone());
            }
            _ => {}
        }
        if request.method == Method::DisposeInstance
            && let Some(handle) = &request.handle
        {
            self.owners.remove(handle);
        }
        drop(lease);
        result
    }

    fn is_ready(&self) -> bool {
        !self.pool.is_disposed()
    }

    async fn terminate(&self, reason: BridgeError) -> Result<(), BridgeError> {
        tracing::info!(reason = %reason, "Terminating process channel");
        self.dispose().await
    }
}
