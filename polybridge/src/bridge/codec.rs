//! Request encoding, response decoding and line framing.
//!
//! [`BridgeCodec`] validates everything it can before bytes leave the process
//! and turns raw response lines back into values, converting envelopes on the way.
//! [`BoundedLinesCodec`] frames newline-delimited JSON over any
//! AsyncRead/AsyncWrite (pipes, sockets).

use std::future::Future;
use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::envelope::{
    CodecEnvelope, ENVELOPE_MARKER, EnvelopeDecoder, EnvelopeEncoding, EnvelopeTag,
};
use super::protocol::{
    BridgeInfo, InstanceHandle, Kwargs, Method, ProtocolMessage, ProtocolResponse, Request,
    RequestId,
};
use crate::error::BridgeError;
use crate::validators;

/// Default upper bound for a single protocol line.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024 * 1024;

/// One frame read off a newline-delimited stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineFrame {
    Line(String),
    /// The line exceeded the length limit and was skipped up to its newline.
    Oversized,
    /// The line was not valid UTF-8.
    Malformed(String),
}

/// [`LinesCodec`] that reports oversized and non-UTF-8 lines as frames instead
/// of errors, so a single bad line does not end the stream.
pub struct BoundedLinesCodec {
    inner: LinesCodec,
}

impl Default for BoundedLinesCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl BoundedLinesCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
        }
    }

    pub fn max_length(&self) -> usize {
        self.inner.max_length()
    }

    fn map(result: Result<Option<String>, LinesCodecError>) -> Result<Option<LineFrame>, io::Error> {
        match result {
            Ok(Some(line)) => Ok(Some(LineFrame::Line(line))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(LineFrame::Oversized)),
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Ok(Some(LineFrame::Malformed(e.to_string())))
            }
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for BoundedLinesCodec {
    type Item = LineFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::map(self.inner.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::map(self.inner.decode_eof(src))
    }
}

impl<T: AsRef<str>> Encoder<T> for BoundedLinesCodec {
    type Error = io::Error;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = line.as_ref();
        tracing::trace!(line_bytes = line.len(), "Encoding line");
        if line.len() > 100_000 {
            tracing::debug!(
                line_bytes = line.len(),
                line_kb = line.len() / 1024,
                "Large line being encoded"
            );
        }
        self.inner.encode(line, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => e,
            LinesCodecError::MaxLineLengthExceeded => {
                io::Error::new(io::ErrorKind::InvalidData, "line exceeds maximum length")
            }
        })
    }
}

/// Convert any serializable value into a wire payload.
///
/// Non-finite floats are rejected with their path, since serde_json would
/// otherwise write them as `null`.
pub fn to_payload<T: Serialize + ?Sized>(value: &T, name: &str) -> Result<Value, BridgeError> {
    validators::assert_no_special_floats(value, name)?;
    serde_json::to_value(value)
        .map_err(|e| BridgeError::protocol(format!("{name} is not serializable: {e}")))
}

/// Positional arguments: any value serializing to an array. `()` and `null` mean none.
pub fn to_args<T: Serialize + ?Sized>(args: &T) -> Result<Vec<Value>, BridgeError> {
    match to_payload(args, "args")? {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items),
        other => Err(BridgeError::protocol(format!(
            "args must serialize to an array, got {}",
            json_type(&other)
        ))),
    }
}

/// Keyword arguments: any value serializing to an object. `()` and `null` mean none.
pub fn to_kwargs<T: Serialize + ?Sized>(kwargs: &T) -> Result<Option<Kwargs>, BridgeError> {
    match to_payload(kwargs, "kwargs")? {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        other => Err(BridgeError::protocol(format!(
            "kwargs must serialize to an object, got {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A validated request line plus the routing facts transports need.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRequest {
    pub id: RequestId,
    pub method: Method,
    pub handle: Option<InstanceHandle>,
    pub line: String,
}

type DecoderLoader =
    Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn EnvelopeDecoder>, BridgeError>> + Send + Sync>;

struct LazyDecoder {
    loader: DecoderLoader,
    loaded: OnceCell<Arc<dyn EnvelopeDecoder>>,
}

/// Validating encoder and envelope-aware decoder.
#[derive(Default)]
pub struct BridgeCodec {
    decoders: DashMap<EnvelopeTag, Arc<dyn EnvelopeDecoder>>,
    lazy: DashMap<EnvelopeTag, Arc<LazyDecoder>>,
}

impl BridgeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_decoder(&self, tag: EnvelopeTag, decoder: Arc<dyn EnvelopeDecoder>) {
        self.decoders.insert(tag, decoder);
    }

    /// Register a decoder that is only built when a response first needs it.
    /// Only [`decode_response_async`](Self::decode_response_async) triggers loading.
    pub fn register_lazy_decoder<F, Fut>(&self, tag: EnvelopeTag, loader: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn EnvelopeDecoder>, BridgeError>> + Send + 'static,
    {
        let loader: DecoderLoader = Box::new(move || Box::pin(loader()));
        self.lazy.insert(
            tag,
            Arc::new(LazyDecoder {
                loader,
                loaded: OnceCell::new(),
            }),
        );
    }

    /// Check names, key policy and argument shapes without encoding.
    pub fn validate_request(&self, request: &Request) -> Result<(), BridgeError> {
        validate_request(request)
    }

    pub fn encode_request(&self, message: &ProtocolMessage) -> Result<EncodedRequest, BridgeError> {
        message.check_protocol()?;
        validate_request(&message.request)?;

        let line = serde_json::to_string(message)
            .map_err(|e| BridgeError::protocol(format!("failed to serialize request: {e}")))?;
        tracing::trace!(
            request_id = message.id,
            method = %message.request.method(),
            line_bytes = line.len(),
            "Encoded request"
        );

        Ok(EncodedRequest {
            id: message.id,
            method: message.request.method(),
            handle: message.request.handle().cloned(),
            line,
        })
    }

    pub fn decode_response(&self, raw: &str, expected: RequestId) -> Result<Value, BridgeError> {
        let value = parse_response(raw, expected)?;
        self.convert(value)
    }

    /// Like [`decode_response`](Self::decode_response), loading lazily registered
    /// decoders the response needs first.
    pub async fn decode_response_async(
        &self,
        raw: &str,
        expected: RequestId,
    ) -> Result<Value, BridgeError> {
        let value = parse_response(raw, expected)?;

        let mut tags = Vec::new();
        collect_columnar_tags(&value, &mut tags);
        for tag in tags {
            if self.decoders.contains_key(&tag) {
                continue;
            }
            let Some(lazy) = self.lazy.get(&tag).map(|entry| Arc::clone(entry.value())) else {
                continue;
            };
            let decoder = lazy
                .loaded
                .get_or_try_init(|| (lazy.loader)())
                .await?
                .clone();
            tracing::debug!(tag = tag.as_str(), "Loaded envelope decoder");
            self.decoders.insert(tag, decoder);
        }

        self.convert(value)
    }

    pub fn decode_info(&self, raw: &str, expected: RequestId) -> Result<BridgeInfo, BridgeError> {
        let value = parse_response(raw, expected)?;
        let info: BridgeInfo = serde_json::from_value(value)
            .map_err(|e| BridgeError::protocol(format!("invalid bridge info: {e}")))?;
        info.validate()?;
        Ok(info)
    }

    fn convert(&self, value: Value) -> Result<Value, BridgeError> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| self.convert(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) if map.contains_key(ENVELOPE_MARKER) => {
                self.decode_envelope(CodecEnvelope::from_value(Value::Object(map))?)
            }
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| self.convert(v).map(|v| (k, v)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object),
            other => Ok(other),
        }
    }

    fn decode_envelope(&self, envelope: CodecEnvelope) -> Result<Value, BridgeError> {
        match envelope.encoding {
            EnvelopeEncoding::Plain => envelope.data.ok_or_else(|| {
                BridgeError::protocol(format!(
                    "{} envelope with plain encoding has no data",
                    envelope.tag.as_str()
                ))
            }),
            EnvelopeEncoding::ColumnarBinary => {
                let bytes = envelope.bytes()?;
                let decoder = self
                    .decoders
                    .get(&envelope.tag)
                    .map(|entry| Arc::clone(entry.value()));
                match decoder {
                    Some(decoder) => decoder.decode(&envelope, &bytes),
                    None => Ok(Value::Array(bytes.into_iter().map(Value::from).collect())),
                }
            }
        }
    }
}

fn parse_response(raw: &str, expected: RequestId) -> Result<Value, BridgeError> {
    let response: ProtocolResponse = serde_json::from_str(raw)
        .map_err(|e| BridgeError::protocol(format!("invalid response: {e}")))?;
    if response.id != expected {
        return Err(BridgeError::protocol(format!(
            "response id mismatch: expected {expected}, got {}",
            response.id
        )));
    }
    response.into_result()
}

fn collect_columnar_tags(value: &Value, tags: &mut Vec<EnvelopeTag>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_columnar_tags(v, tags)),
        Value::Object(map) if map.contains_key(ENVELOPE_MARKER) => {
            let tag = map
                .get(ENVELOPE_MARKER)
                .and_then(|t| serde_json::from_value::<EnvelopeTag>(t.clone()).ok());
            let columnar = map.get("encoding").and_then(Value::as_str) == Some("columnar-binary");
            if let Some(tag) = tag
                && columnar
                && !tags.contains(&tag)
            {
                tags.push(tag);
            }
        }
        Value::Object(map) => map.values().for_each(|v| collect_columnar_tags(v, tags)),
        _ => {}
    }
}

fn validate_request(request: &Request) -> Result<(), BridgeError> {
    match request {
        Request::Call {
            module,
            function_name,
            args,
            kwargs,
        } => {
            validators::assert_module_name(module)?;
            validators::assert_identifier(function_name, "function name")?;
            validate_arguments(args, kwargs.as_ref())
        }
        Request::Instantiate {
            module,
            class_name,
            args,
            kwargs,
        } => {
            validators::assert_module_name(module)?;
            validators::assert_identifier(class_name, "class name")?;
            validate_arguments(args, kwargs.as_ref())
        }
        Request::CallMethod {
            handle,
            method_name,
            args,
            kwargs,
        } => {
            validate_handle(handle)?;
            validators::assert_identifier(method_name, "method name")?;
            validate_arguments(args, kwargs.as_ref())
        }
        Request::DisposeInstance { handle } => validate_handle(handle),
        Request::Meta => Ok(()),
    }
}

fn validate_handle(handle: &InstanceHandle) -> Result<(), BridgeError> {
    validators::assert_non_empty_string(handle.as_str(), "instance handle")?;
    validators::assert_no_path_traversal(handle.as_str(), "instance handle")?;
    Ok(())
}

fn validate_arguments(args: &[Value], kwargs: Option<&Kwargs>) -> Result<(), BridgeError> {
    for (i, arg) in args.iter().enumerate() {
        reject_reserved_keys(arg, &format!("args[{i}]"))?;
    }
    if let Some(kwargs) = kwargs {
        for (name, value) in kwargs {
            if !validators::is_identifier(name) {
                return Err(BridgeError::protocol(format!(
                    "invalid keyword argument name {name:?}"
                )));
            }
            reject_reserved_keys(value, &format!("kwargs.{name}"))?;
        }
    }
    Ok(())
}

fn reject_reserved_keys(value: &Value, path: &str) -> Result<(), BridgeError> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(i, v)| reject_reserved_keys(v, &format!("{path}[{i}]"))),
        Value::Object(map) => {
            if map.contains_key(ENVELOPE_MARKER) {
                return Err(BridgeError::protocol(format!(
                    "{path} uses reserved key {ENVELOPE_MARKER:?}"
                )));
            }
            map.iter()
                .try_for_each(|(k, v)| reject_reserved_keys(v, &format!("{path}.{k}")))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::envelope::Float64ArrayDecoder;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn call(module: &str, function: &str, args: Vec<Value>) -> ProtocolMessage {
        ProtocolMessage::new(
            1,
            Request::Call {
                module: module.to_string(),
                function_name: function.to_string(),
                args,
                kwargs: None,
            },
        )
    }

    #[test]
    fn encode_roundtrips_message() {
        let codec = BridgeCodec::new();
        let message = call("math", "sqrt", vec![json!(16)]);
        let encoded = codec.encode_request(&message).unwrap();

        assert_eq!(encoded.id, 1);
        assert_eq!(encoded.method, Method::Call);
        assert!(encoded.handle.is_none());
        assert!(!encoded.line.contains('\n'));
        let parsed: ProtocolMessage = serde_json::from_str(&encoded.line).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn encode_carries_handle() {
        let codec = BridgeCodec::new();
        let message = ProtocolMessage::new(
            9,
            Request::CallMethod {
                handle: InstanceHandle::new("obj-1"),
                method_name: "increment".to_string(),
                args: vec![],
                kwargs: None,
            },
        );
        let encoded = codec.encode_request(&message).unwrap();
        assert_eq!(encoded.handle, Some(InstanceHandle::new("obj-1")));
    }

    #[test]
    fn encode_rejects_bad_names() {
        let codec = BridgeCodec::new();
        for (module, function) in [("", "f"), ("../etc", "f"), ("math", ""), ("math", "a b")] {
            let err = codec
                .encode_request(&call(module, function, vec![]))
                .unwrap_err();
            assert!(matches!(err, BridgeError::Protocol(_)), "{module}.{function}");
        }
    }

    #[test]
    fn encode_rejects_reserved_key_and_bad_kwargs() {
        let codec = BridgeCodec::new();
        let err = codec
            .encode_request(&call(
                "m",
                "f",
                vec![json!({"nested": {"__polybridge__": "ndarray"}})],
            ))
            .unwrap_err();
        assert!(err.to_string().contains("args[0].nested"));

        let mut kwargs = Kwargs::new();
        kwargs.insert("not valid".to_string(), json!(1));
        let message = ProtocolMessage::new(
            2,
            Request::Call {
                module: "m".to_string(),
                function_name: "f".to_string(),
                args: vec![],
                kwargs: Some(kwargs),
            },
        );
        assert!(codec.encode_request(&message).is_err());
    }

    #[test]
    fn payload_rejects_non_finite_floats() {
        let err = to_args(&(1.0, f64::NAN)).unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
        assert!(err.to_string().contains("args[1]"));
        assert!(to_kwargs(&json!({"x": 1})).unwrap().is_some());
        assert!(to_kwargs(&()).unwrap().is_none());
        assert_eq!(to_args(&()).unwrap(), Vec::<Value>::new());
        assert!(to_args(&"scalar").is_err());
    }

    #[test]
    fn decode_plain_and_error_responses() {
        let codec = BridgeCodec::new();
        assert_eq!(
            codec.decode_response(r#"{"id":1,"result":4.0}"#, 1).unwrap(),
            json!(4.0)
        );
        assert_eq!(codec.decode_response(r#"{"id":1}"#, 1).unwrap(), Value::Null);

        let err = codec
            .decode_response(
                r#"{"id":1,"error":{"kind":"ValueError","message":"bad","trace":"tb"}}"#,
                1,
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::Execution { ref kind, .. } if kind == "ValueError"));
        assert_eq!(err.trace(), Some("tb"));
    }

    #[test]
    fn decode_rejects_mismatch_and_garbage() {
        let codec = BridgeCodec::new();
        assert!(matches!(
            codec.decode_response(r#"{"id":2,"result":1}"#, 1),
            Err(BridgeError::Protocol(_))
        ));
        assert!(matches!(
            codec.decode_response("not json", 1),
            Err(BridgeError::Protocol(_))
        ));
        assert!(matches!(
            codec.decode_response(
                r#"{"id":1,"result":1,"error":{"kind":"E","message":"m"}}"#,
                1
            ),
            Err(BridgeError::Protocol(_))
        ));
    }

    #[test]
    fn decode_envelopes_recursively() {
        let codec = BridgeCodec::new();
        let plain = CodecEnvelope::plain(EnvelopeTag::Series, json!([1, 2, 3]));
        let columnar = CodecEnvelope::columnar(EnvelopeTag::Dataframe, &[7, 8]);
        let raw = serde_json::to_string(&json!({
            "id": 3,
            "result": {"s": plain, "frames": [columnar]}
        }))
        .unwrap();

        assert_eq!(
            codec.decode_response(&raw, 3).unwrap(),
            json!({"s": [1, 2, 3], "frames": [[7, 8]]})
        );
    }

    #[test]
    fn decode_uses_registered_decoder() {
        let codec = BridgeCodec::new();
        codec.register_decoder(EnvelopeTag::Ndarray, Arc::new(Float64ArrayDecoder));
        let bytes: Vec<u8> = [1.5f64, 2.5].iter().flat_map(|v| v.to_le_bytes()).collect();
        let env = CodecEnvelope::columnar(EnvelopeTag::Ndarray, &bytes).with_shape(vec![2]);
        let raw = serde_json::to_string(&json!({"id": 1, "result": env})).unwrap();
        assert_eq!(codec.decode_response(&raw, 1).unwrap(), json!([1.5, 2.5]));
    }

    #[tokio::test]
    async fn lazy_decoder_loads_once() {
        let codec = BridgeCodec::new();
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        codec.register_lazy_decoder(EnvelopeTag::Ndarray, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(Float64ArrayDecoder) as Arc<dyn EnvelopeDecoder>)
            }
        });

        let bytes: Vec<u8> = 3.0f64.to_le_bytes().to_vec();
        let env = CodecEnvelope::columnar(EnvelopeTag::Ndarray, &bytes);
        let raw = serde_json::to_string(&json!({"id": 1, "result": env})).unwrap();

        // Sync decode never triggers the loader.
        assert_eq!(codec.decode_response(&raw, 1).unwrap(), json!(bytes));
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        for _ in 0..3 {
            assert_eq!(codec.decode_response_async(&raw, 1).await.unwrap(), json!([3.0]));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn decode_info_validates() {
        let codec = BridgeCodec::new();
        let good = r#"{"id":1,"result":{"protocol":"polybridge/1","protocolVersion":1,"interpreter":"CPython","interpreterVersion":"3.12.1","pid":10,"columnarCodec":false,"optionalPackages":{"numpy":true},"instances":0}}"#;
        let info = codec.decode_info(good, 1).unwrap();
        assert_eq!(info.pid, 10);
        assert_eq!(info.optional_packages.get("numpy"), Some(&true));

        let wrong = good.replace("polybridge/1", "polybridge/9");
        assert!(matches!(codec.decode_info(&wrong, 1), Err(BridgeError::Protocol(_))));
        assert!(codec.decode_info(r#"{"id":1,"result":{"pid":"x"}}"#, 1).is_err());
    }

    #[test]
    fn lines_codec_skips_oversized_lines() {
        let mut codec = BoundedLinesCodec::new(8);
        let mut buf = BytesMut::from(&b"{\"id\":1}\nthis line is far too long\n{\"id\":2}\n"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(LineFrame::Line("{\"id\":1}".to_string()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(LineFrame::Oversized));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(LineFrame::Line("{\"id\":2}".to_string()))
        );
    }

    #[test]
    fn lines_codec_encodes_with_newline() {
        let mut codec = BoundedLinesCodec::default();
        let mut buf = BytesMut::new();
        codec.encode("{\"id\":1}", &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"id\":1}\n");
    }
}
