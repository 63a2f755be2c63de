//! Public call surface: functions, classes, methods and instance release.
//!
//! Every operation runs as `execute -> encode -> transport.send -> decode`
//! inside the bridge's [`BoundedContext`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::codec::{self, BridgeCodec};
use super::protocol::{BridgeInfo, InstanceHandle, ProtocolMessage, Request, RequestId};
use crate::context::{BoundedContext, ContextState, ExecuteOptions};
use crate::disposable::Disposable;
use crate::error::BridgeError;
use crate::transport::Transport;
use crate::version::VersionInfo;

/// Defaults applied to every call unless overridden per call.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(
                std::env::var("POLYBRIDGE_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(30_000),
            ),
            retries: 0,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl BridgeOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Hands the transport to the context's resource registry.
struct TransportResource(Arc<dyn Transport>);

#[async_trait]
impl Disposable for TransportResource {
    async fn dispose(&self) -> Result<(), BridgeError> {
        self.0.dispose().await
    }
}

pub struct BridgeProtocol {
    context: BoundedContext,
    codec: Arc<BridgeCodec>,
    transport: Arc<dyn Transport>,
    options: BridgeOptions,
    next_id: AtomicU64,
    info: StdMutex<Option<BridgeInfo>>,
}

impl BridgeProtocol {
    pub fn new(transport: Arc<dyn Transport>, options: BridgeOptions) -> Self {
        Self::with_codec(transport, Arc::new(BridgeCodec::new()), options)
    }

    pub fn with_codec(
        transport: Arc<dyn Transport>,
        codec: Arc<BridgeCodec>,
        options: BridgeOptions,
    ) -> Self {
        let init_transport = Arc::clone(&transport);
        let context = BoundedContext::new("bridge", move || {
            let transport = Arc::clone(&init_transport);
            async move { transport.init().await }
        });
        // A fresh context cannot be disposed yet.
        let _ = context.track_resource(Arc::new(TransportResource(Arc::clone(&transport))));

        Self {
            context,
            codec,
            transport,
            options,
            next_id: AtomicU64::new(1),
            info: StdMutex::new(None),
        }
    }

    pub fn codec(&self) -> &BridgeCodec {
        &self.codec
    }

    pub fn context(&self) -> &BoundedContext {
        &self.context
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn state(&self) -> ContextState {
        self.context.state()
    }

    pub async fn init(&self) -> Result<(), BridgeError> {
        self.context.init().await
    }

    pub async fn dispose(&self) -> Result<(), BridgeError> {
        self.context.dispose().await
    }

    fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
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
        let request = Request::Call {
            module: module.to_string(),
            function_name: function.to_string(),
            args: codec::to_args(args)?,
            kwargs: codec::to_kwargs(kwargs)?,
        };
        self.send_request(request, &CallOptions::default()).await
    }

    /// [`call`](Self::call) with the result deserialized into `T`.
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
        self.instantiate_kw(module, class, args, &()).await
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
        let request = Request::Instantiate {
            module: module.to_string(),
            class_name: class.to_string(),
            args: codec::to_args(args)?,
            kwargs: codec::to_kwargs(kwargs)?,
        };
        let value = self.send_request(request, &CallOptions::default()).await?;
        handle_from_value(value)
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
        self.call_method_kw(handle, method, args, &()).await
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
        let request = Request::CallMethod {
            handle: handle.clone(),
            method_name: method.to_string(),
            args: codec::to_args(args)?,
            kwargs: codec::to_kwargs(kwargs)?,
        };
        self.send_request(request, &CallOptions::default()).await
    }

    pub async fn dispose_instance(&self, handle: &InstanceHandle) -> Result<(), BridgeError> {
        let request = Request::DisposeInstance {
            handle: handle.clone(),
        };
        self.send_request(request, &CallOptions::default())
            .await
            .map(|_| ())
    }

    /// Remote capability snapshot, cached after the first valid answer.
    pub async fn get_bridge_info(&self, refresh: bool) -> Result<BridgeInfo, BridgeError> {
        if !refresh
            && let Some(info) = self.cached_info()
        {
            return Ok(info);
        }

        let (id, raw) = self.round_trip(Request::Meta, &CallOptions::default()).await?;
        let info = self.codec.decode_info(&raw, id)?;
        tracing::debug!(
            interpreter = %info.interpreter,
            version = %info.interpreter_version,
            pid = info.pid,
            "Fetched bridge info"
        );
        if let Ok(mut slot) = self.info.lock() {
            *slot = Some(info.clone());
        }
        Ok(info)
    }

    /// Local versions plus the remote interpreter's, as reported by `meta`.
    pub async fn version_info(&self) -> Result<VersionInfo, BridgeError> {
        let info = self.get_bridge_info(false).await?;
        Ok(VersionInfo::new()
            .with_interpreter(format!("{} {}", info.interpreter, info.interpreter_version)))
    }

    fn cached_info(&self) -> Option<BridgeInfo> {
        self.info.lock().ok().and_then(|slot| slot.clone())
    }

    /// Send any request and decode its result.
    pub async fn send_request(
        &self,
        request: Request,
        options: &CallOptions,
    ) -> Result<Value, BridgeError> {
        let (id, raw) = self.round_trip(request, options).await?;
        self.codec.decode_response_async(&raw, id).await
    }

    async fn round_trip(
        &self,
        request: Request,
        options: &CallOptions,
    ) -> Result<(RequestId, String), BridgeError> {
        self.codec.validate_request(&request)?;

        let timeout = options.timeout.unwrap_or(self.options.timeout);
        // The transport owns the deadline so its diagnostics reach the caller.
        let execute = ExecuteOptions {
            timeout: Duration::ZERO,
            retries: options.retries.unwrap_or(self.options.retries),
            retry_delay: self.options.retry_delay,
            cancel: options.cancel.clone(),
        };

        let request = &request;
        self.context
            .execute(&execute, |attempt| {
                let message = ProtocolMessage::new(self.next_id(), request.clone());
                async move {
                    let encoded = self.codec.encode_request(&message)?;
                    tracing::debug!(
                        request_id = encoded.id,
                        method = %encoded.method,
                        attempt,
                        "Sending request"
                    );
                    let raw = self
                        .transport
                        .send(&encoded, timeout, options.cancel.as_ref())
                        .await?;
                    Ok((encoded.id, raw))
                }
            })
            .await
    }
}

fn handle_from_value(value: Value) -> Result<InstanceHandle, BridgeError> {
    match value {
        Value::String(handle) if !handle.is_empty() => Ok(InstanceHandle::new(handle)),
        other => Err(BridgeError::protocol(format!(
            "instantiate returned {other} instead of an instance handle"
        ))),
    }
}

#[async_trait]
impl Disposable for BridgeProtocol {
    async fn dispose(&self) -> Result<(), BridgeError> {
        BridgeProtocol::dispose(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::RemoteError;
    use crate::transport::testing::MockTransport;
    use serde_json::json;

    fn bridge(transport: Arc<MockTransport>) -> BridgeProtocol {
        BridgeProtocol::new(transport, BridgeOptions::default().with_timeout(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn call_returns_remote_result() {
        let transport = Arc::new(MockTransport::echo());
        let bridge = bridge(Arc::clone(&transport));
        assert_eq!(bridge.call("math", "sqrt", &[16]).await.unwrap(), json!(16));
        let typed: u32 = bridge.call_as("math", "sqrt", &[9]).await.unwrap();
        assert_eq!(typed, 9);
        assert_eq!(bridge.state(), ContextState::Ready);
    }

    #[tokio::test]
    async fn ids_strictly_increase() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let transport = Arc::new(MockTransport::with_responder(move |msg| {
            record.lock().unwrap().push(msg.id);
            Ok(Value::Null)
        }));
        let bridge = Arc::new(bridge(transport));

        let calls: Vec<_> = (0..20)
            .map(|i| {
                let bridge = Arc::clone(&bridge);
                tokio::spawn(async move { bridge.call("m", "f", &[i]).await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }

        let mut ids = seen.lock().unwrap().clone();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn concurrent_first_calls_init_transport_once() {
        let transport = Arc::new(MockTransport::echo().with_init_delay(Duration::from_millis(30)));
        let bridge = Arc::new(bridge(Arc::clone(&transport)));

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let bridge = Arc::clone(&bridge);
                tokio::spawn(async move { bridge.call("m", "f", &()).await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }
        assert_eq!(transport.inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_finite_args_never_reach_the_transport() {
        let transport = Arc::new(MockTransport::echo());
        let bridge = bridge(Arc::clone(&transport));

        let err = bridge.call("m", "f", &[1.0, f64::INFINITY]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
        let err = bridge.call("bad module", "f", &()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));

        assert_eq!(transport.sends.load(Ordering::SeqCst), 0);
        assert_eq!(transport.inits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remote_errors_surface_as_execution() {
        let transport = Arc::new(MockTransport::with_responder(|_| {
            Err(RemoteError {
                kind: "ZeroDivisionError".to_string(),
                message: "division by zero".to_string(),
                trace: Some("Traceback ...".to_string()),
            })
        }));
        let bridge = bridge(transport);
        let err = bridge.call("operator", "truediv", &[1, 0]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Execution { ref kind, .. } if kind == "ZeroDivisionError"));
        assert_eq!(err.trace(), Some("Traceback ..."));
    }

    #[tokio::test]
    async fn instances_roundtrip() {
        let transport = Arc::new(MockTransport::echo());
        let bridge = bridge(transport);

        let handle = bridge.instantiate("counter", "Counter", &()).await.unwrap();
        assert!(handle.as_str().starts_with("Counter-"));
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("step".to_string(), json!(2));
        bridge
            .call_method_kw(&handle, "increment", &(), &kwargs)
            .await
            .unwrap();
        bridge.dispose_instance(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn bridge_info_is_cached_until_refresh() {
        let transport = Arc::new(MockTransport::echo());
        let bridge = bridge(Arc::clone(&transport));

        let info = bridge.get_bridge_info(false).await.unwrap();
        assert_eq!(info.interpreter, "Mock");
        bridge.get_bridge_info(false).await.unwrap();
        assert_eq!(transport.sends.load(Ordering::SeqCst), 1);
        bridge.get_bridge_info(true).await.unwrap();
        assert_eq!(transport.sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_use_fresh_ids() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let transport = Arc::new(MockTransport::with_responder(move |msg| {
            record.lock().unwrap().push(msg.id);
            Ok(json!("ok"))
        }));
        transport.fail_next_sends.store(1, Ordering::SeqCst);
        let bridge = BridgeProtocol::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            BridgeOptions::default().with_retries(2, Duration::from_millis(1)),
        );

        assert_eq!(bridge.call("m", "f", &()).await.unwrap(), json!("ok"));
        assert_eq!(transport.sends.load(Ordering::SeqCst), 2);
        // The failed attempt used id 1; the retry answered with id 2.
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_final() {
        let transport = Arc::new(MockTransport::echo());
        let bridge = bridge(Arc::clone(&transport));
        bridge.init().await.unwrap();

        bridge.dispose().await.unwrap();
        bridge.dispose().await.unwrap();
        assert_eq!(transport.disposals.load(Ordering::SeqCst), 1);

        let err = bridge.call("m", "f", &()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Disposed(_)));
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let transport = Arc::new(MockTransport::echo().with_delay(Duration::from_secs(5)));
        let bridge = bridge(transport);
        let err = bridge
            .send_request(
                Request::Meta,
                &CallOptions::default().with_timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
    }
}
