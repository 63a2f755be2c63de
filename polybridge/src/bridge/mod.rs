//! Caller side of the interpreter bridge.
//!
//! # Architecture
//!
//! - **protocol**: message types (`ProtocolMessage`/`Request`, `ProtocolResponse`, `BridgeInfo`)
//! - **envelope**: tagged envelopes for columnar and array values
//! - **codec**: validating encoder, envelope-aware decoder, line framing
//! - **client**: `BridgeProtocol`, the public call surface

pub mod client;
pub mod codec;
pub mod envelope;
pub mod protocol;

pub use client::{BridgeOptions, BridgeProtocol, CallOptions};
pub use codec::{BridgeCodec, EncodedRequest};
pub use envelope::{CodecEnvelope, EnvelopeDecoder, EnvelopeTag};
pub use protocol::{BridgeInfo, InstanceHandle, Method, ProtocolMessage, ProtocolResponse, Request};
