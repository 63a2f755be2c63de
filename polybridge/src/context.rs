//! Lifecycle and bounded execution shared by every bridge.
//!
//! State machine:
//! ```text
//! Idle -> Initializing -> Ready
//!           |  (failure)
//!           v
//!          Idle
//! Idle | Initializing | Ready -> Disposing -> Disposed (terminal)
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::disposable::{Disposable, dispose_all};
use crate::error::BridgeError;
use crate::transport::bounded;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Idle,
    Initializing,
    Ready,
    Disposing,
    Disposed,
}

impl ContextState {
    pub fn is_terminating(&self) -> bool {
        matches!(self, Self::Disposing | Self::Disposed)
    }
}

/// Per-call execution policy.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Zero means no deadline.
    pub timeout: Duration,
    /// Extra attempts after the first for retryable failures.
    pub retries: u32,
    /// Backoff unit; attempt `n` waits `retry_delay * n` before retrying.
    pub retry_delay: Duration,
    pub cancel: Option<CancellationToken>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            retries: 0,
            retry_delay: Duration::from_millis(100),
            cancel: None,
        }
    }
}

impl ExecuteOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn caller_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

type InitFuture = Shared<BoxFuture<'static, Result<(), BridgeError>>>;
type Initializer = Box<dyn Fn() -> BoxFuture<'static, Result<(), BridgeError>> + Send + Sync>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct BoundedContext {
    name: String,
    state: watch::Sender<ContextState>,
    initializer: Initializer,
    in_flight_init: StdMutex<Option<InitFuture>>,
    shutdown: CancellationToken,
    resources: StdMutex<Vec<(ResourceId, Arc<dyn Disposable>)>>,
    next_resource: AtomicU64,
}

impl BoundedContext {
    pub fn new<F, Fut>(name: impl Into<String>, initializer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        let (state, _) = watch::channel(ContextState::Idle);
        Self {
            name: name.into(),
            state,
            initializer: Box::new(move || initializer().boxed()),
            in_flight_init: StdMutex::new(None),
            shutdown: CancellationToken::new(),
            resources: StdMutex::new(Vec::new()),
            next_resource: AtomicU64::new(1),
        }
    }

    /// Context whose initialization has nothing to do.
    pub fn without_init(name: impl Into<String>) -> Self {
        Self::new(name, || async { Ok(()) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ContextState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ContextState::Ready
    }

    pub fn is_disposed(&self) -> bool {
        self.state().is_terminating()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ContextState> {
        self.state.subscribe()
    }

    fn disposed_error(&self) -> BridgeError {
        BridgeError::disposed(format!("{} has been disposed", self.name))
    }

    /// Run the initializer once. Concurrent callers share the same attempt;
    /// a failed attempt returns the context to `Idle` so a later call retries.
    pub async fn init(&self) -> Result<(), BridgeError> {
        let attempt = {
            let mut slot = lock(&self.in_flight_init);
            match self.state() {
                ContextState::Ready => return Ok(()),
                state if state.is_terminating() => return Err(self.disposed_error()),
                _ => {}
            }
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let fresh = (self.initializer)().shared();
                    *slot = Some(fresh.clone());
                    self.state.send_replace(ContextState::Initializing);
                    tracing::debug!(context = %self.name, "Initializing");
                    fresh
                }
            }
        };

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(self.disposed_error()),
            result = attempt.clone() => result,
        };

        {
            let mut slot = lock(&self.in_flight_init);
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&attempt)) {
                *slot = None;
                if !self.state().is_terminating() {
                    let next = if result.is_ok() {
                        ContextState::Ready
                    } else {
                        ContextState::Idle
                    };
                    self.state.send_replace(next);
                    match &result {
                        Ok(()) => tracing::info!(context = %self.name, "Ready"),
                        Err(e) => tracing::warn!(context = %self.name, error = %e, "Initialization failed"),
                    }
                }
            }
        }

        if self.state().is_terminating() {
            return Err(self.disposed_error());
        }
        result
    }

    /// Tear down once. Later and concurrent callers wait for `Disposed` and
    /// return `Ok`. Tracked resources are disposed newest first; every one is
    /// attempted even when some fail.
    pub async fn dispose(&self) -> Result<(), BridgeError> {
        let mut first = false;
        self.state.send_if_modified(|state| {
            if state.is_terminating() {
                false
            } else {
                *state = ContextState::Disposing;
                first = true;
                true
            }
        });

        if !first {
            let mut rx = self.state.subscribe();
            let _ = rx.wait_for(|s| *s == ContextState::Disposed).await;
            return Ok(());
        }

        tracing::info!(context = %self.name, "Disposing");
        self.shutdown.cancel();

        let resources: Vec<Arc<dyn Disposable>> = lock(&self.resources)
            .drain(..)
            .rev()
            .map(|(_, resource)| resource)
            .collect();
        let result = dispose_all(resources).await;

        lock(&self.in_flight_init).take();
        self.state.send_replace(ContextState::Disposed);
        tracing::debug!(context = %self.name, "Disposed");
        result
    }

    /// Register a resource to be disposed with this context.
    pub fn track_resource(&self, resource: Arc<dyn Disposable>) -> Result<ResourceId, BridgeError> {
        let mut resources = lock(&self.resources);
        if self.state().is_terminating() {
            return Err(self.disposed_error());
        }
        let id = ResourceId(self.next_resource.fetch_add(1, Ordering::Relaxed));
        resources.push((id, resource));
        Ok(id)
    }

    /// Stop tracking a resource without disposing it.
    pub fn untrack_resource(&self, id: ResourceId) -> Option<Arc<dyn Disposable>> {
        let mut resources = lock(&self.resources);
        let index = resources.iter().position(|(rid, _)| *rid == id)?;
        Some(resources.remove(index).1)
    }

    async fn ensure_ready(&self) -> Result<(), BridgeError> {
        match self.state() {
            ContextState::Ready => Ok(()),
            state if state.is_terminating() => Err(self.disposed_error()),
            _ => self.init().await,
        }
    }

    pub async fn execute<T, F, Fut>(
        &self,
        options: &ExecuteOptions,
        operation: F,
    ) -> Result<T, BridgeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        self.execute_validated(options, operation, |_| Ok(())).await
    }

    /// Run `operation` under the context's lifecycle and `options`.
    ///
    /// The operation receives the attempt number (from 1). Retryable failures
    /// are retried up to `options.retries` times; `validate` runs on success and
    /// its failure is a protocol error, never retried.
    pub async fn execute_validated<T, F, Fut, V>(
        &self,
        options: &ExecuteOptions,
        mut operation: F,
        validate: V,
    ) -> Result<T, BridgeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
        V: Fn(&T) -> Result<(), String>,
    {
        self.ensure_ready().await?;

        let mut attempt: u32 = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Err(BridgeError::disposed(format!(
                    "{} disposed while an operation was in flight",
                    self.name
                ))),
                result = bounded(operation(attempt), options.timeout, options.cancel.as_ref(), "operation") => result,
            };

            match result {
                Ok(value) => {
                    validate(&value).map_err(|reason| {
                        BridgeError::protocol(format!("result validation failed: {reason}"))
                    })?;
                    return Ok(value);
                }
                Err(e)
                    if e.is_retryable()
                        && attempt <= options.retries
                        && !options.caller_cancelled()
                        && !self.is_disposed() =>
                {
                    let delay = options.retry_delay * attempt;
                    tracing::debug!(
                        context = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying operation"
                    );
                    bounded(
                        async {
                            tokio::select! {
                                _ = self.shutdown.cancelled() => Err(self.disposed_error()),
                                _ = tokio::time::sleep(delay) => Ok(()),
                            }
                        },
                        Duration::ZERO,
                        options.cancel.as_ref(),
                        "retry backoff",
                    )
                    .await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait::async_trait]
impl Disposable for BoundedContext {
    async fn dispose(&self) -> Result<(), BridgeError> {
        BoundedContext::dispose(self).await
    }
}
