//! Transports move encoded request lines to an interpreter and raw response
//! lines back.
//!
//! - [`process`]: child process over stdin/stdout pipes
//! - [`http`]: remote interpreter behind an HTTP endpoint
//! - `wasm`: interpreter embedded in a WASM module (feature `wasm`)

pub mod http;
pub mod process;
#[cfg(feature = "wasm")]
pub mod wasm;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::EncodedRequest;
use crate::disposable::Disposable;
use crate::error::BridgeError;

pub use http::{HttpTransport, HttpTransportConfig};
pub use process::{ProcessTransport, ProcessTransportConfig};
#[cfg(feature = "wasm")]
pub use wasm::{WasmTransport, WasmTransportConfig};

#[async_trait]
pub trait Transport: Disposable {
    /// Bring the transport up. Idempotent.
    async fn init(&self) -> Result<(), BridgeError>;

    /// Send one encoded request and wait for its raw response line.
    ///
    /// `timeout` of zero means no deadline; `cancel` is honored either way.
    async fn send(
        &self,
        request: &EncodedRequest,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, BridgeError>;

    fn is_ready(&self) -> bool;

    /// Tear down immediately, failing pending requests with `reason`.
    async fn terminate(&self, reason: BridgeError) -> Result<(), BridgeError> {
        tracing::debug!(reason = %reason, "Terminating transport");
        self.dispose().await
    }
}

/// Race `future` against a deadline (zero = none) and an optional cancellation token.
///
/// Both deadline and cancellation resolve to timeout-kind errors.
pub async fn bounded<T, F>(
    future: F,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
    what: &str,
) -> Result<T, BridgeError>
where
    F: Future<Output = Result<T, BridgeError>>,
{
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let deadline = async {
        if timeout.is_zero() {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(timeout).await
        }
    };

    tokio::select! {
        biased;
        _ = cancelled => Err(BridgeError::timeout(format!("{what} cancelled"))),
        _ = deadline => Err(BridgeError::timeout(format!(
            "{what} timed out after {}ms",
            timeout.as_millis()
        ))),
        result = future => result,
    }
}
