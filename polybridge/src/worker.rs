//! Remote side of the line protocol.
//!
//! Reads request lines from stdin, runs each on its own task and writes
//! responses to stdout as they complete, so responses may leave out of order.
//! Logging must go to stderr; stdout carries protocol frames only.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::task::TaskTracker;

use crate::bridge::codec::{BoundedLinesCodec, DEFAULT_MAX_LINE_LENGTH, LineFrame};
use crate::bridge::protocol::{
    BridgeInfo, InstanceHandle, Kwargs, ProtocolMessage, ProtocolResponse, RemoteError, Request,
    ResponseHeader,
};

/// What a worker exposes to the bridge.
#[async_trait]
pub trait WorkerHandler: Send + Sync + 'static {
    async fn call(
        &self,
        module: &str,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, RemoteError>;

    /// Construct an object and return the handle it is kept under.
    async fn instantiate(
        &self,
        module: &str,
        class: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<InstanceHandle, RemoteError>;

    async fn call_method(
        &self,
        handle: &InstanceHandle,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, RemoteError>;

    async fn dispose_instance(&self, handle: &InstanceHandle) -> Result<(), RemoteError>;

    fn info(&self) -> BridgeInfo;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_line_length: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Serve requests on stdin/stdout until stdin closes.
pub async fn run_worker<H: WorkerHandler>(handler: Arc<H>, config: WorkerConfig) -> io::Result<()> {
    serve(handler, tokio::io::stdin(), tokio::io::stdout(), config).await
}

/// Serve requests from `input`, writing responses to `output`.
///
/// Returns once `input` reaches EOF and every started request has answered.
pub async fn serve<H, R, W>(handler: Arc<H>, input: R, output: W, config: WorkerConfig) -> io::Result<()>
where
    H: WorkerHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = FramedRead::new(input, BoundedLinesCodec::new(config.max_line_length));
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let max_line_length = config.max_line_length;
    let writer_task = tokio::spawn(async move {
        let mut writer = FramedWrite::new(output, BoundedLinesCodec::new(max_line_length));
        while let Some(line) = rx.recv().await {
            writer.send(line).await?;
        }
        Ok::<_, io::Error>(())
    });

    let tracker = TaskTracker::new();
    while let Some(frame) = reader.next().await {
        match frame? {
            LineFrame::Line(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let handler = Arc::clone(&handler);
                let tx = tx.clone();
                tracker.spawn(async move {
                    let Some(response) = handle_line(handler.as_ref(), &line).await else {
                        return;
                    };
                    match serde_json::to_string(&response) {
                        Ok(encoded) => {
                            let _ = tx.send(encoded);
                        }
                        Err(e) => tracing::error!(request_id = response.id, error = %e, "Failed to encode response"),
                    }
                });
            }
            LineFrame::Oversized => tracing::warn!(max_line_length, "Dropped oversized request line"),
            LineFrame::Malformed(reason) => tracing::warn!(%reason, "Dropped malformed request line"),
        }
    }

    tracker.close();
    tracker.wait().await;
    drop(tx);
    tracing::debug!("Input closed, worker exiting");
    writer_task
        .await
        .map_err(|e| io::Error::other(format!("writer task failed: {e}")))?
}

/// Answer one request line. Lines without a readable id get no answer.
pub async fn handle_line<H: WorkerHandler + ?Sized>(handler: &H, line: &str) -> Option<ProtocolResponse> {
    let message: ProtocolMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            let Some(id) = ResponseHeader::peek(line) else {
                tracing::warn!(error = %e, "Dropped request without an id");
                return None;
            };
            return Some(ProtocolResponse::failure(
                id,
                RemoteError::new("ProtocolError", format!("invalid request: {e}")),
            ));
        }
    };
    let id = message.id;
    if let Err(e) = message.check_protocol() {
        return Some(ProtocolResponse::failure(
            id,
            RemoteError::new("ProtocolError", e.to_string()),
        ));
    }

    tracing::trace!(request_id = id, method = %message.request.method(), "Handling request");
    let result = match message.request {
        Request::Call {
            module,
            function_name,
            args,
            kwargs,
        } => {
            handler
                .call(&module, &function_name, args, kwargs.unwrap_or_default())
                .await
        }
        Request::Instantiate {
            module,
            class_name,
            args,
            kwargs,
        } => handler
            .instantiate(&module, &class_name, args, kwargs.unwrap_or_default())
            .await
            .map(|handle| json!(handle.as_str())),
        Request::CallMethod {
            handle,
            method_name,
            args,
            kwargs,
        } => {
            handler
                .call_method(&handle, &method_name, args, kwargs.unwrap_or_default())
                .await
        }
        Request::DisposeInstance { handle } => {
            handler.dispose_instance(&handle).await.map(|()| Value::Null)
        }
        Request::Meta => serde_json::to_value(handler.info())
            .map_err(|e| RemoteError::new("ProtocolError", e.to_string())),
    };

    Some(match result {
        Ok(value) => ProtocolResponse::success(id, value),
        Err(error) => ProtocolResponse::failure(id, error),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::version::{PROTOCOL_ID, PROTOCOL_VERSION};

    struct Echo;

    #[async_trait]
    impl WorkerHandler for Echo {
        async fn call(
            &self,
            _module: &str,
            function: &str,
            args: Vec<Value>,
            _kwargs: Kwargs,
        ) -> Result<Value, RemoteError> {
            match function {
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!("slow"))
                }
                "fail" => Err(RemoteError::new("ValueError", "asked to fail")),
                _ => Ok(args.into_iter().next().unwrap_or(Value::Null)),
            }
        }

        async fn instantiate(
            &self,
            _module: &str,
            class: &str,
            _args: Vec<Value>,
            _kwargs: Kwargs,
        ) -> Result<InstanceHandle, RemoteError> {
            Ok(InstanceHandle::new(format!("{class}-1")))
        }

        async fn call_method(
            &self,
            handle: &InstanceHandle,
            method: &str,
            _args: Vec<Value>,
            _kwargs: Kwargs,
        ) -> Result<Value, RemoteError> {
            Ok(json!(format!("{handle}.{method}")))
        }

        async fn dispose_instance(&self, _handle: &InstanceHandle) -> Result<(), RemoteError> {
            Ok(())
        }

        fn info(&self) -> BridgeInfo {
            BridgeInfo {
                protocol: PROTOCOL_ID.to_string(),
                protocol_version: PROTOCOL_VERSION,
                interpreter: "Echo".into(),
                interpreter_version: "1".into(),
                pid: std::process::id(),
                columnar_codec: false,
                optional_packages: BTreeMap::new(),
                instances: 0,
            }
        }
    }

    fn line(id: u64, method: &str, params: Value) -> String {
        json!({"id": id, "protocol": PROTOCOL_ID, "method": method, "params": params}).to_string()
    }

    #[tokio::test]
    async fn dispatches_each_method() {
        let call = handle_line(&Echo, &line(1, "call", json!({"module": "m", "functionName": "f", "args": [7]})))
            .await
            .unwrap();
        assert_eq!(call.result, Some(json!(7)));

        let created = handle_line(
            &Echo,
            &line(2, "instantiate", json!({"module": "m", "className": "Counter", "args": []})),
        )
        .await
        .unwrap();
        assert_eq!(created.result, Some(json!("Counter-1")));

        let method = handle_line(
            &Echo,
            &line(3, "call_method", json!({"handle": "Counter-1", "methodName": "value", "args": []})),
        )
        .await
        .unwrap();
        assert_eq!(method.result, Some(json!("Counter-1.value")));

        let meta_line = json!({"id": 4, "protocol": PROTOCOL_ID, "method": "meta"}).to_string();
        let meta = handle_line(&Echo, &meta_line).await.unwrap();
        let info: BridgeInfo = serde_json::from_value(meta.result.unwrap()).unwrap();
        info.validate().unwrap();
    }

    #[tokio::test]
    async fn remote_errors_and_bad_requests() {
        let failed = handle_line(&Echo, &line(5, "call", json!({"module": "m", "functionName": "fail", "args": []})))
            .await
            .unwrap();
        assert_eq!(failed.error.unwrap().kind, "ValueError");

        let wrong_protocol = json!({"id": 6, "protocol": "other/9", "method": "meta"}).to_string();
        let response = handle_line(&Echo, &wrong_protocol).await.unwrap();
        assert_eq!(response.id, 6);
        assert_eq!(response.error.unwrap().kind, "ProtocolError");

        let unknown = json!({"id": 7, "protocol": PROTOCOL_ID, "method": "teleport"}).to_string();
        assert_eq!(handle_line(&Echo, &unknown).await.unwrap().error.unwrap().kind, "ProtocolError");

        assert!(handle_line(&Echo, "not json").await.is_none());
    }

    #[tokio::test]
    async fn serves_concurrently_and_answers_out_of_order() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let worker = tokio::spawn(serve(Arc::new(Echo), server_read, server_write, WorkerConfig::default()));

        let requests = [
            line(1, "call", json!({"module": "m", "functionName": "slow", "args": []})),
            line(2, "call", json!({"module": "m", "functionName": "fast", "args": [2]})),
        ];
        for request in &requests {
            client.write_all(request.as_bytes()).await.unwrap();
            client.write_all(b"\n").await.unwrap();
        }

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut lines = BufReader::new(client_read).lines();
        let first: ProtocolResponse = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let second: ProtocolResponse = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!((first.id, second.id), (2, 1));

        client_write.shutdown().await.unwrap();
        drop(client_write);
        drop(lines);
        worker.await.unwrap().unwrap();
    }
}
