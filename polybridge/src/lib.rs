//! polybridge: call functions, classes and methods inside interpreter
//! processes (or a WASM sandbox) with type-safe value transport.
//!
//! # Architecture
//!
//! - **transport**: moves request lines to an interpreter (process pipes, HTTP, WASM)
//! - **bridge**: wire protocol, validating codec and the `BridgeProtocol` call surface
//! - **context**: `BoundedContext`, the init/dispose lifecycle and bounded execution
//! - **pool**: bounded pool of transports with a FIFO wait queue
//! - **process_bridge**: `ProcessBridge`, the production process pool with
//!   quarantine, recycling and instance affinity
//! - **worker**: remote side of the protocol, used by the `polybridge-worker` binary

pub mod bridge;
pub mod context;
pub mod disposable;
pub mod error;
pub mod logging;
pub mod pool;
pub mod process_bridge;
pub mod transport;
pub mod validators;
pub mod version;
pub mod worker;

pub use bridge::{
    BridgeCodec, BridgeInfo, BridgeOptions, BridgeProtocol, CallOptions, InstanceHandle,
    ProtocolMessage, ProtocolResponse, Request,
};
pub use context::{BoundedContext, ContextState, ExecuteOptions};
pub use disposable::Disposable;
pub use error::{BridgeError, ErrorKind};
pub use pool::{PoolConfig, PooledWorker, WorkerFactory, WorkerId, WorkerPool};
pub use process_bridge::{Health, HealthSnapshot, ProcessBridge, ProcessBridgeConfig};
pub use transport::{HttpTransport, HttpTransportConfig, ProcessTransport, ProcessTransportConfig, Transport};
#[cfg(feature = "wasm")]
pub use transport::{WasmTransport, WasmTransportConfig};
pub use version::{BRIDGE_VERSION, PROTOCOL_ID, PROTOCOL_VERSION, VersionInfo};
pub use worker::{WorkerHandler, run_worker};
