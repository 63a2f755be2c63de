//! HTTP transport: each request line is POSTed to a remote interpreter
//! endpoint and the response body is the response line.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use tokio_util::sync::CancellationToken;

use super::{Transport, bounded};
use crate::bridge::codec::EncodedRequest;
use crate::disposable::Disposable;
use crate::error::BridgeError;
use crate::version::BRIDGE_VERSION;

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub url: String,
    /// Sent as `Authorization: Bearer <token>`.
    pub token: Option<String>,
    pub headers: Vec<(String, String)>,
    pub connect_timeout: Duration,
}

impl HttpTransportConfig {
    /// Token defaults to `POLYBRIDGE_HTTP_TOKEN` when set.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: std::env::var("POLYBRIDGE_HTTP_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            headers: Vec::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    ready: AtomicBool,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, BridgeError> {
        let mut headers = HeaderMap::new();

        if let Some(token) = &config.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| BridgeError::protocol(format!("invalid bearer token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let user_agent = format!("polybridge/{BRIDGE_VERSION}");
        if let Ok(value) = HeaderValue::from_str(&user_agent) {
            headers.insert(USER_AGENT, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| BridgeError::protocol(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| BridgeError::protocol(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| BridgeError::execution("HttpError", format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            url: config.url,
            client,
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, request: &EncodedRequest) -> Result<String, BridgeError> {
        let response = self
            .client
            .post(&self.url)
            .body(request.line.clone())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), request_id = request.id, "Interpreter endpoint returned error status");
            let snippet: String = body.chars().take(512).collect();
            return Err(BridgeError::execution(
                "HttpError",
                format!("HTTP {status}: {snippet}"),
            ));
        }
        tracing::trace!(request_id = request.id, body_bytes = body.len(), "Received response");
        Ok(body.trim_end().to_string())
    }
}

#[async_trait]
impl Disposable for HttpTransport {
    async fn dispose(&self) -> Result<(), BridgeError> {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn init(&self) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::disposed("HTTP transport has been shut down"));
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(
        &self,
        request: &EncodedRequest,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::disposed("HTTP transport has been shut down"));
        }
        bounded(
            self.post(request),
            timeout,
            cancel,
            &format!("{} request {}", request.method, request.id),
        )
        .await
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Method;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(id: u64) -> EncodedRequest {
        EncodedRequest {
            id,
            method: Method::Meta,
            handle: None,
            line: format!(r#"{{"id":{id},"protocol":"polybridge/1","method":"meta"}}"#),
        }
    }

    #[tokio::test]
    async fn posts_line_with_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(header("authorization", "Bearer secret"))
            .and(header("x-tenant", "blue"))
            .and(body_string_contains(r#""method":"meta""#))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"id\":3,\"result\":1}\n"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(
            HttpTransportConfig::new(format!("{}/rpc", server.uri()))
                .with_token("secret")
                .with_header("x-tenant", "blue"),
        )
        .unwrap();
        transport.init().await.unwrap();
        assert!(transport.is_ready());

        let body = transport
            .send(&request(3), Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(body, r#"{"id":3,"result":1}"#);
    }

    #[tokio::test]
    async fn error_status_is_execution_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(HttpTransportConfig::new(server.uri())).unwrap();
        let err = transport
            .send(&request(1), Duration::from_secs(5), None)
            .await
            .unwrap_err();
        match err {
            BridgeError::Execution { kind, message, .. } => {
                assert_eq!(kind, "HttpError");
                assert!(message.contains("503"));
                assert!(message.contains("overloaded"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"id":1}"#)
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(HttpTransportConfig::new(server.uri())).unwrap();
        let err = transport
            .send(&request(1), Duration::from_millis(100), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport =
            HttpTransport::new(HttpTransportConfig::new(format!("http://127.0.0.1:{port}/rpc")))
                .unwrap();
        let err = transport
            .send(&request(1), Duration::from_secs(5), None)
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }

    #[tokio::test]
    async fn disposed_transport_rejects_sends() {
        let transport =
            HttpTransport::new(HttpTransportConfig::new("http://127.0.0.1:9/rpc")).unwrap();
        transport.dispose().await.unwrap();
        let err = transport
            .send(&request(1), Duration::ZERO, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Disposed(_)));
        assert!(transport.init().await.is_err());
    }
}
