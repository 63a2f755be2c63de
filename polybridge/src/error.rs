//! Error taxonomy shared by every bridge layer.
//!
//! Errors are typed by [`ErrorKind`]. Untyped failures coming from foreign code
//! (I/O, anyhow chains) are classified by their message text.

use serde::{Deserialize, Serialize};

/// Coarse error category used for retry decisions and caller matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Operation attempted on a torn-down context.
    Disposed,
    /// Deadline elapsed or the caller cancelled.
    Timeout,
    /// Malformed message, identity mismatch or local validation failure.
    Protocol,
    /// The remote side (or the channel to it) failed while executing.
    Execution,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disposed => "disposed",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol",
            Self::Execution => "execution",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const DISPOSED_VOCABULARY: &[&str] = &["disposed", "has been shut down"];
const TIMEOUT_VOCABULARY: &[&str] = &[
    "timed out",
    "timeout",
    "deadline",
    "aborted",
    "abort",
    "cancelled",
    "canceled",
];
const PROTOCOL_VOCABULARY: &[&str] = &[
    "protocol",
    "parse",
    "malformed",
    "invalid",
    "validation",
    "serialize",
    "deserialize",
    "unexpected token",
];
const CONNECTION_RESET_VOCABULARY: &[&str] = &[
    "econnreset",
    "epipe",
    "connection reset",
    "broken pipe",
    "socket hang up",
    "connection refused",
];

fn mentions(message: &str, vocabulary: &[&str]) -> bool {
    let lower = message.to_ascii_lowercase();
    vocabulary.iter().any(|word| lower.contains(word))
}

/// Classify a free-form error message.
pub fn classify(message: &str) -> ErrorKind {
    if mentions(message, DISPOSED_VOCABULARY) {
        ErrorKind::Disposed
    } else if mentions(message, TIMEOUT_VOCABULARY) {
        ErrorKind::Timeout
    } else if mentions(message, PROTOCOL_VOCABULARY) {
        ErrorKind::Protocol
    } else {
        ErrorKind::Execution
    }
}

/// Whether the message describes a dropped connection that is worth retrying.
pub fn is_connection_reset(message: &str) -> bool {
    mentions(message, CONNECTION_RESET_VOCABULARY)
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge disposed: {0}")]
    Disposed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Remote exception or channel failure. `kind` is the remote exception
    /// type (e.g. `ValueError`) or a local channel label (`WorkerExited`).
    #[error("{kind}: {message}")]
    Execution {
        kind: String,
        message: String,
        trace: Option<String>,
    },

    /// Several failures collected while disposing resources.
    #[error("{} errors during dispose: {}", .0.len(), summarize(.0))]
    Aggregate(Vec<BridgeError>),
}

fn summarize(errors: &[BridgeError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl BridgeError {
    pub fn disposed(message: impl Into<String>) -> Self {
        Self::Disposed(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn execution(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    /// Build a typed error from an untyped message using [`classify`].
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify(&message) {
            ErrorKind::Disposed => Self::Disposed(message),
            ErrorKind::Timeout => Self::Timeout(message),
            ErrorKind::Protocol => Self::Protocol(message),
            ErrorKind::Execution => Self::execution("Error", message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Disposed(_) => ErrorKind::Disposed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Execution { .. } | Self::Aggregate(_) => ErrorKind::Execution,
        }
    }

    /// Timeouts and connection-reset style execution errors are retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Execution { kind, message, .. } => {
                is_connection_reset(kind) || is_connection_reset(message)
            }
            _ => false,
        }
    }

    /// Remote traceback, when the remote side reported one.
    pub fn trace(&self) -> Option<&str> {
        match self {
            Self::Execution { trace, .. } => trace.as_deref(),
            _ => None,
        }
    }

    /// Append diagnostic context (e.g. captured stderr) to the message.
    pub fn with_context(self, context: &str) -> Self {
        if context.is_empty() {
            return self;
        }
        match self {
            Self::Disposed(m) => Self::Disposed(format!("{m}\n{context}")),
            Self::Timeout(m) => Self::Timeout(format!("{m}\n{context}")),
            Self::Protocol(m) => Self::Protocol(format!("{m}\n{context}")),
            Self::Execution {
                kind,
                message,
                trace,
            } => Self::Execution {
                kind,
                message: format!("{message}\n{context}"),
                trace,
            },
            aggregate @ Self::Aggregate(_) => aggregate,
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match e.kind() {
            Io::TimedOut => Self::Timeout(e.to_string()),
            Io::BrokenPipe => Self::execution("BrokenPipe", format!("broken pipe: {e}")),
            Io::ConnectionReset | Io::ConnectionAborted => {
                Self::execution("ConnectionReset", format!("connection reset: {e}"))
            }
            Io::InvalidData | Io::InvalidInput => Self::Protocol(e.to_string()),
            _ => Self::from_message(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid JSON: {e}"))
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(format!("HTTP request timed out: {e}"))
        } else if e.is_connect() {
            Self::execution("ConnectionError", format!("connection refused: {e}"))
        } else if e.is_decode() || e.is_body() {
            Self::Protocol(format!("invalid HTTP response body: {e}"))
        } else {
            Self::execution("HttpError", e.to_string())
        }
    }
}

impl From<anyhow::Error> for BridgeError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<BridgeError>() {
            Ok(typed) => typed,
            Err(other) => Self::from_message(format!("{other:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_vocabulary() {
        assert_eq!(classify("context was disposed"), ErrorKind::Disposed);
        assert_eq!(classify("request timed out after 30s"), ErrorKind::Timeout);
        assert_eq!(classify("operation aborted by caller"), ErrorKind::Timeout);
        assert_eq!(classify("failed to parse response"), ErrorKind::Protocol);
        assert_eq!(classify("Validation failed for args"), ErrorKind::Protocol);
        assert_eq!(classify("ZeroDivisionError: division by zero"), ErrorKind::Execution);
    }

    #[test]
    fn retryable_kinds() {
        assert!(BridgeError::timeout("slow").is_retryable());
        assert!(BridgeError::execution("OSError", "read ECONNRESET").is_retryable());
        assert!(BridgeError::execution("Error", "socket hang up").is_retryable());
        assert!(!BridgeError::execution("ValueError", "bad value").is_retryable());
        assert!(!BridgeError::protocol("bad id").is_retryable());
        assert!(!BridgeError::disposed("gone").is_retryable());
    }

    #[test]
    fn io_errors_map_to_kinds() {
        let e: BridgeError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(e.kind(), ErrorKind::Timeout);

        let e: BridgeError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert_eq!(e.kind(), ErrorKind::Execution);
        assert!(e.is_retryable());
    }

    #[test]
    fn anyhow_preserves_typed_errors() {
        let original = BridgeError::protocol("mismatch");
        let wrapped = anyhow::Error::new(original);
        let back: BridgeError = wrapped.into();
        assert!(matches!(back, BridgeError::Protocol(m) if m == "mismatch"));
    }

    #[test]
    fn aggregate_display_lists_every_error() {
        let err = BridgeError::Aggregate(vec![
            BridgeError::execution("WorkerExited", "worker 1 died"),
            BridgeError::timeout("worker 2 did not stop"),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("2 errors during dispose"));
        assert!(text.contains("worker 1 died"));
        assert!(text.contains("worker 2 did not stop"));
    }

    #[test]
    fn with_context_appends_to_message() {
        let err = BridgeError::timeout("no response").with_context("stderr: boom");
        assert_eq!(err.to_string(), "timed out: no response\nstderr: boom");
    }
}
