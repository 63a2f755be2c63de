//! Production entry point: a bridge over a pool of interpreter processes.
//!
//! # Architecture
//!
//! - **config**: `ProcessBridgeConfig` and its environment overrides
//! - **env**: child environment allow-list and virtualenv handling
//! - **channel**: `ProcessChannel`, the pool-backed transport (affinity, quarantine, sweep)
//! - **cache**: opt-in result cache for pure-looking calls
//! - **health**: `Health`, per-worker statistics and snapshots

pub mod cache;
pub mod channel;
pub mod config;
pub mod env;
pub mod health;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bridge::client::{BridgeProtocol, CallOptions};
use crate::bridge::codec::{self, BridgeCodec};
use crate::bridge::protocol::{BridgeInfo, InstanceHandle, Request};
use crate::context::ContextState;
use crate::disposable::Disposable;
use crate::error::BridgeError;
use crate::transport::Transport;
use crate::version::VersionInfo;

pub use cache::{CacheStats, ResultCache};
pub use channel::ProcessChannel;
pub use config::{CacheConfig, ProcessBridgeConfig, WarmupCall};
pub use health::{Health, HealthSnapshot, WorkerHealth};

pub struct ProcessBridge {
    protocol: BridgeProtocol,
    channel: Arc<ProcessChannel>,
    cache: Option<ResultCache>,
}

impl ProcessBridge {
    pub fn new(config: ProcessBridgeConfig) -> Self {
        Self::with_codec(config, Arc::new(BridgeCodec::new()))
    }

    /// Share `codec` (and its registered envelope decoders) with warm-up calls.
    pub fn with_codec(config: ProcessBridgeConfig, codec: Arc<BridgeCodec>) -> Self {
        let options = config.bridge_options();
        let cache = config.cache.clone().map(ResultCache::new);
        let channel = ProcessChannel::new(config, Arc::clone(&codec));
        let protocol = BridgeProtocol::with_codec(
            Arc::clone(&channel) as Arc<dyn Transport>,
            codec,
            options,
        );
        Self {
            protocol,
            channel,
            cache,
        }
    }

    pub fn protocol(&self) -> &BridgeProtocol {
        &self.protocol
    }

    pub fn channel(&self) -> &ProcessChannel {
        &self.channel
    }

    pub fn codec(&self) -> &BridgeCodec {
        self.protocol.codec()
    }

    pub fn state(&self) -> ContextState {
        self.protocol.state()
    }

    /// Spawn `min_processes` workers and start the idle sweep.
    pub async fn init(&self) -> Result<(), BridgeError> {
        self.protocol.init().await
    }

    pub async fn dispose(&self) -> Result<(), BridgeError> {
        let result = self.protocol.dispose().await;
        self.clear_cache();
        result
    }

    pub async fn call<A>(&self, module: &str, function: &str, args: &A) -> Result<Value, BridgeError>
    where
        A: Serialize + ?Sized,
    {
        self.call_kw(module, function, args, &()).await
    }

    pub async fn call_kw<A, K>(
        &self,
        module: &str,
        function: &str,
        args: &A,
        kwargs: &K,
    ) -> Result<Value, BridgeError>
    where
        A: Serialize + ?Sized,
        K: Serialize + ?Sized,
    {
        self.call_with(module, function, args, kwargs, &CallOptions::default())
            .await
    }

    /// Call with per-call options, consulting the result cache when enabled.
    pub async fn call_with<A, K>(
        &self,
        module: &str,
        function: &str,
        args: &A,
        kwargs: &K,
        options: &CallOptions,
    ) -> Result<Value, BridgeError>
    where
        A: Serialize + ?Sized,
        K: Serialize + ?Sized,
    {
        let state = self.state();
        if state.is_terminating() {
            return Err(BridgeError::disposed("process bridge has been disposed"));
        }
        let args = codec::to_args(args)?;
        let kwargs = codec::to_kwargs(kwargs)?;

        let cache_key = self.cache.as_ref().and_then(|_| {
            cache::is_cacheable(function, &args, kwargs.as_ref())
                .then(|| cache::cache_key(module, function, &args, kwargs.as_ref()))
        });
        // Hits are only served once the workers are up.
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key)
            && state == ContextState::Ready
            && let Some(value) = cache.get(key)
        {
            tracing::trace!(module, function, "Result cache hit");
            return Ok(value);
        }

        let request = Request::Call {
            module: module.to_string(),
            function_name: function.to_string(),
            args,
            kwargs,
        };
        let value = self.protocol.send_request(request, options).await?;

        if let (Some(cache), Some(key)) = (&self.cache, cache_key)
            && !self.state().is_terminating()
        {
            cache.insert(key, value.clone());
        }
        Ok(value)
    }

    pub async fn call_as<T, A>(&self, module: &str, function: &str, args: &A) -> Result<T, BridgeError>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let value = self.call(module, function, args).await?;
        serde_json::from_value(value).map_err(|e| {
            BridgeError::protocol(format!("{module}.{function} returned an unexpected shape: {e}"))
        })
    }

    pub async fn instantiate<A>(
        &self,
        module: &str,
        class: &str,
        args: &A,
    ) -> Result<InstanceHandle, BridgeError>
    where
        A: Serialize + ?Sized,
    {
        self.protocol.instantiate(module, class, args).await
    }

    pub async fn instantiate_kw<A, K>(
        &self,
        module: &str,
        class: &str,
        args: &A,
        kwargs: &K,
    ) -> Result<InstanceHandle, BridgeError>
    where
        A: Serialize + ?Sized,
        K: Serialize + ?Sized,
    {
        self.protocol.instantiate_kw(module, class, args, kwargs).await
    }

    pub async fn call_method<A>(
        &self,
        handle: &InstanceHandle,
        method: &str,
        args: &A,
    ) -> Result<Value, BridgeError>
    where
        A: Serialize + ?Sized,
    {
        self.protocol.call_method(handle, method, args).await
    }

    pub async fn call_method_kw<A, K>(
        &self,
        handle: &InstanceHandle,
        method: &str,
        args: &A,
        kwargs: &K,
    ) -> Result<Value, BridgeError>
    where
        A: Serialize + ?Sized,
        K: Serialize + ?Sized,
    {
        self.protocol.call_method_kw(handle, method, args, kwargs).await
    }

    pub async fn dispose_instance(&self, handle: &InstanceHandle) -> Result<(), BridgeError> {
        self.protocol.dispose_instance(handle).await
    }

    pub async fn get_bridge_info(&self, refresh: bool) -> Result<BridgeInfo, BridgeError> {
        self.protocol.get_bridge_info(refresh).await
    }

    pub async fn version_info(&self) -> Result<VersionInfo, BridgeError> {
        self.protocol.version_info().await
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    /// Run one idle/worn-out sweep now. Returns how many workers were retired.
    pub fn sweep(&self) -> usize {
        self.channel.sweep()
    }

    pub fn health(&self) -> HealthSnapshot {
        let workers = self.channel.worker_health();
        let pool = self.channel.pool();
        let waiting = pool.waiting();
        let cap = pool.config().max_concurrent_per_worker;

        let status = match self.state() {
            ContextState::Idle => Health::Unknown,
            ContextState::Initializing => Health::Starting,
            ContextState::Disposing | ContextState::Disposed => Health::Defunct,
            ContextState::Ready => {
                let saturated = workers
                    .iter()
                    .all(|w| !w.ready || cap.is_some_and(|cap| w.in_flight >= cap));
                let at_ceiling = workers.len() >= pool.config().max_workers;
                if waiting > 0 || (saturated && at_ceiling) {
                    Health::Busy
                } else {
                    Health::Ready
                }
            }
        };

        HealthSnapshot {
            status,
            workers,
            waiting,
            quarantined: self.channel.quarantined_count(),
            retired: self.channel.retired_count(),
            cache: self.cache.as_ref().map(ResultCache::stats),
        }
    }
}

#[async_trait]
impl Disposable for ProcessBridge {
    async fn dispose(&self) -> Result<(), BridgeError> {
        ProcessBridge::dispose(self).await
    }
}
