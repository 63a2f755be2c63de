//! Wire protocol types for caller-interpreter communication.
//!
//! One JSON object per line in each direction:
//! - **Request**: `{id, protocol, method, params}`, where `method`/`params` come
//!   from the closed [`Request`] union.
//! - **Response**: `{id, result?, error?}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BridgeError;
use crate::version::{PROTOCOL_ID, PROTOCOL_VERSION};

/// Request identifier, unique for the lifetime of one bridge.
pub type RequestId = u64;

/// Keyword arguments as sent on the wire.
pub type Kwargs = Map<String, Value>;

/// Opaque identifier of an object living inside the remote interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceHandle(String);

impl InstanceHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Method discriminant without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Call,
    Instantiate,
    CallMethod,
    DisposeInstance,
    Meta,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Instantiate => "instantiate",
            Self::CallMethod => "call_method",
            Self::DisposeInstance => "dispose_instance",
            Self::Meta => "meta",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations the remote interpreter understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    Call {
        module: String,
        function_name: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kwargs: Option<Kwargs>,
    },

    Instantiate {
        module: String,
        class_name: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kwargs: Option<Kwargs>,
    },

    CallMethod {
        handle: InstanceHandle,
        method_name: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kwargs: Option<Kwargs>,
    },

    DisposeInstance {
        handle: InstanceHandle,
    },

    /// Capability/diagnostic snapshot of the remote side.
    Meta,
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Self::Call { .. } => Method::Call,
            Self::Instantiate { .. } => Method::Instantiate,
            Self::CallMethod { .. } => Method::CallMethod,
            Self::DisposeInstance { .. } => Method::DisposeInstance,
            Self::Meta => Method::Meta,
        }
    }

    /// Instance the request targets, for handle-bound methods.
    pub fn handle(&self) -> Option<&InstanceHandle> {
        match self {
            Self::CallMethod { handle, .. } | Self::DisposeInstance { handle } => Some(handle),
            _ => None,
        }
    }
}

/// A request with its correlation id and protocol identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub id: RequestId,
    pub protocol: String,
    #[serde(flatten)]
    pub request: Request,
}

impl ProtocolMessage {
    pub fn new(id: RequestId, request: Request) -> Self {
        Self {
            id,
            protocol: PROTOCOL_ID.to_string(),
            request,
        }
    }

    pub fn check_protocol(&self) -> Result<(), BridgeError> {
        if self.protocol == PROTOCOL_ID {
            Ok(())
        } else {
            Err(BridgeError::protocol(format!(
                "protocol mismatch: expected {PROTOCOL_ID}, got {}",
                self.protocol
            )))
        }
    }
}

/// Exception reported by the remote interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Exception type name, e.g. `ValueError`.
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }
}

impl From<RemoteError> for BridgeError {
    fn from(e: RemoteError) -> Self {
        BridgeError::Execution {
            kind: e.kind,
            message: e.message,
            trace: e.trace,
        }
    }
}

/// Response to a single request.
///
/// At most one of `result`/`error` is present; neither means a void success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolResponse {
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl ProtocolResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: RemoteError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, BridgeError> {
        match (self.result, self.error) {
            (Some(_), Some(_)) => Err(BridgeError::protocol(format!(
                "response {} carries both result and error",
                self.id
            ))),
            (_, Some(error)) => Err(error.into()),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Minimal view of a response line, used to route it before a full decode.
#[derive(Debug, Deserialize)]
pub struct ResponseHeader {
    pub id: Option<RequestId>,
}

impl ResponseHeader {
    pub fn peek(line: &str) -> Option<RequestId> {
        serde_json::from_str::<ResponseHeader>(line)
            .ok()
            .and_then(|h| h.id)
    }
}

/// Remote-side capability and diagnostic snapshot returned by `meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeInfo {
    pub protocol: String,
    pub protocol_version: u32,
    /// Interpreter implementation, e.g. `CPython`.
    pub interpreter: String,
    pub interpreter_version: String,
    pub pid: u32,
    /// Whether the remote side can emit columnar-binary envelopes.
    pub columnar_codec: bool,
    /// Optional numeric/ML packages and whether they import.
    #[serde(default)]
    pub optional_packages: BTreeMap<String, bool>,
    /// Live instance count on the remote side.
    pub instances: u64,
}

impl BridgeInfo {
    /// Reject a remote speaking a different protocol identity or revision.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.protocol != PROTOCOL_ID {
            return Err(BridgeError::protocol(format!(
                "remote protocol mismatch: expected {PROTOCOL_ID}, got {}",
                self.protocol
            )));
        }
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(BridgeError::protocol(format!(
                "remote protocol version mismatch: expected {PROTOCOL_VERSION}, got {}",
                self.protocol_version
            )));
        }
        Ok(())
    }
}
