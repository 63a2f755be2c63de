//! Tagged envelopes for values plain JSON carries poorly (tables, arrays).
//!
//! Wire shape:
//! `{"__polybridge__": "ndarray", "encoding": "columnar-binary", "b64": "...", "shape": [2, 3], "dtype": "float64"}`
//! or with `"encoding": "plain"` and the value inline under `"data"`.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// Key marking an object as an envelope. Reserved in outgoing payloads.
pub const ENVELOPE_MARKER: &str = "__polybridge__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeTag {
    Dataframe,
    Series,
    Ndarray,
}

impl EnvelopeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dataframe => "dataframe",
            Self::Series => "series",
            Self::Ndarray => "ndarray",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeEncoding {
    /// Base64 payload in a columnar binary format (e.g. Arrow IPC).
    ColumnarBinary,
    /// Inline JSON structure.
    Plain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecEnvelope {
    #[serde(rename = "__polybridge__")]
    pub tag: EnvelopeTag,
    pub encoding: EnvelopeEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
}

impl CodecEnvelope {
    pub fn columnar(tag: EnvelopeTag, bytes: &[u8]) -> Self {
        Self {
            tag,
            encoding: EnvelopeEncoding::ColumnarBinary,
            b64: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            data: None,
            shape: None,
            dtype: None,
        }
    }

    pub fn plain(tag: EnvelopeTag, data: Value) -> Self {
        Self {
            tag,
            encoding: EnvelopeEncoding::Plain,
            b64: None,
            data: Some(data),
            shape: None,
            dtype: None,
        }
    }

    pub fn with_shape(mut self, shape: Vec<usize>) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn with_dtype(mut self, dtype: impl Into<String>) -> Self {
        self.dtype = Some(dtype.into());
        self
    }

    /// Whether a JSON value is an envelope rather than ordinary data.
    pub fn is_envelope(value: &Value) -> bool {
        value
            .as_object()
            .is_some_and(|o| o.contains_key(ENVELOPE_MARKER))
    }

    pub fn from_value(value: Value) -> Result<Self, BridgeError> {
        serde_json::from_value(value)
            .map_err(|e| BridgeError::protocol(format!("malformed envelope: {e}")))
    }

    /// Decoded binary payload of a columnar envelope.
    pub fn bytes(&self) -> Result<Vec<u8>, BridgeError> {
        let b64 = self.b64.as_deref().ok_or_else(|| {
            BridgeError::protocol(format!(
                "{} envelope with columnar-binary encoding has no payload",
                self.tag.as_str()
            ))
        })?;
        base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| BridgeError::protocol(format!("invalid base64 envelope payload: {e}")))
    }
}

/// Converts a columnar-binary payload into a structured value.
pub trait EnvelopeDecoder: Send + Sync {
    fn decode(&self, envelope: &CodecEnvelope, bytes: &[u8]) -> Result<Value, BridgeError>;
}

/// Decodes little-endian `float64` ndarrays into nested JSON arrays using `shape`.
///
/// Non-finite elements have no JSON form and are rejected.
pub struct Float64ArrayDecoder;

impl EnvelopeDecoder for Float64ArrayDecoder {
    fn decode(&self, envelope: &CodecEnvelope, bytes: &[u8]) -> Result<Value, BridgeError> {
        if let Some(dtype) = envelope.dtype.as_deref()
            && dtype != "float64"
        {
            return Err(BridgeError::protocol(format!(
                "float64 decoder cannot read dtype {dtype}"
            )));
        }
        if bytes.len() % 8 != 0 {
            return Err(BridgeError::protocol(format!(
                "float64 payload length {} is not a multiple of 8",
                bytes.len()
            )));
        }
        let mut numbers = Vec::with_capacity(bytes.len() / 8);
        for chunk in bytes.chunks_exact(8) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            let value = f64::from_le_bytes(raw);
            let number = serde_json::Number::from_f64(value).ok_or_else(|| {
                BridgeError::protocol(format!("ndarray contains non-finite value {value}"))
            })?;
            numbers.push(Value::Number(number));
        }

        let shape = envelope.shape.clone().unwrap_or_else(|| vec![numbers.len()]);
        let expected: usize = shape.iter().product();
        if expected != numbers.len() {
            return Err(BridgeError::protocol(format!(
                "ndarray shape {shape:?} needs {expected} elements, payload has {}",
                numbers.len()
            )));
        }
        Ok(reshape(numbers, &shape))
    }
}

fn reshape(flat: Vec<Value>, shape: &[usize]) -> Value {
    match shape {
        [] | [_] => Value::Array(flat),
        [_, inner @ ..] => {
            let stride: usize = inner.iter().product();
            if stride == 0 {
                return Value::Array(Vec::new());
            }
            let mut rows = Vec::with_capacity(flat.len() / stride);
            let mut iter = flat.into_iter();
            loop {
                let chunk: Vec<Value> = iter.by_ref().take(stride).collect();
                if chunk.is_empty() {
                    break;
                }
                rows.push(reshape(chunk, inner));
            }
            Value::Array(rows)
        }
    }
}
