//! In-process transport backed by an interpreter compiled to WASM.
//!
//! Guest ABI (all i32):
//! - `memory` export
//! - `allocate(len) -> ptr`, `deallocate(ptr, len)`
//! - `dispatch(ptr, len, out_len_ptr) -> ptr`: takes one request line,
//!   returns one response line and writes its length to `out_len_ptr`
//! - optional `bootstrap()`, run once after instantiation
//!
//! The store lives as long as the transport, so interpreter state (instances)
//! persists across calls.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use wasmtime::{Config, Engine, Instance, Memory, Module, Store, TypedFunc};

use super::{Transport, bounded};
use crate::bridge::codec::EncodedRequest;
use crate::disposable::Disposable;
use crate::error::BridgeError;

#[derive(Debug, Clone)]
pub enum WasmSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct WasmTransportConfig {
    pub source: WasmSource,
    /// Fuel granted to each dispatch. `None` disables metering.
    pub fuel_per_call: Option<u64>,
}

impl WasmTransportConfig {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            source: WasmSource::Bytes(bytes.into()),
            fuel_per_call: None,
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: WasmSource::File(path.into()),
            fuel_per_call: None,
        }
    }

    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel_per_call = Some(fuel);
        self
    }
}

struct Guest {
    store: Store<()>,
    instance: Instance,
    memory: Memory,
    allocate: TypedFunc<i32, i32>,
    deallocate: TypedFunc<(i32, i32), ()>,
    dispatch: TypedFunc<(i32, i32, i32), i32>,
}

fn wasm_error(context: &str, e: impl std::fmt::Display) -> BridgeError {
    BridgeError::execution("WasmError", format!("{context}: {e}"))
}

fn to_i32(len: usize) -> Result<i32, BridgeError> {
    i32::try_from(len).map_err(|_| BridgeError::protocol(format!("buffer of {len} bytes exceeds guest address space")))
}

impl Guest {
    fn load(config: &WasmTransportConfig) -> Result<Self, BridgeError> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(config.fuel_per_call.is_some());
        let engine = Engine::new(&engine_config).map_err(|e| wasm_error("engine setup failed", e))?;

        let module = match &config.source {
            WasmSource::Bytes(bytes) => Module::new(&engine, bytes),
            WasmSource::File(path) => Module::from_file(&engine, path),
        }
        .map_err(|e| wasm_error("failed to compile module", e))?;

        let mut store = Store::new(&engine, ());
        if let Some(fuel) = config.fuel_per_call {
            store
                .set_fuel(fuel)
                .map_err(|e| wasm_error("failed to set fuel", e))?;
        }
        let instance = Instance::new(&mut store, &module, &[])
            .map_err(|e| wasm_error("failed to instantiate module", e))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| BridgeError::protocol("WASM module must export 'memory'"))?;
        let allocate = instance
            .get_typed_func::<i32, i32>(&mut store, "allocate")
            .map_err(|_| BridgeError::protocol("WASM module must export 'allocate(i32) -> i32'"))?;
        let deallocate = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "deallocate")
            .map_err(|_| BridgeError::protocol("WASM module must export 'deallocate(i32, i32)'"))?;
        let dispatch = instance
            .get_typed_func::<(i32, i32, i32), i32>(&mut store, "dispatch")
            .map_err(|_| {
                BridgeError::protocol("WASM module must export 'dispatch(i32, i32, i32) -> i32'")
            })?;

        if let Ok(bootstrap) = instance.get_typed_func::<(), ()>(&mut store, "bootstrap") {
            tracing::debug!("Running WASM bootstrap");
            bootstrap
                .call(&mut store, ())
                .map_err(|e| wasm_error("bootstrap failed", e))?;
        }

        Ok(Self {
            store,
            instance,
            memory,
            allocate,
            deallocate,
            dispatch,
        })
    }

    /// Run one request through the guest. Every buffer allocated for the
    /// call is released afterwards, whether or not the call succeeded.
    fn call(&mut self, input: &[u8], fuel: Option<u64>) -> Result<String, BridgeError> {
        if let Some(fuel) = fuel {
            self.store
                .set_fuel(fuel)
                .map_err(|e| wasm_error("failed to set fuel", e))?;
        }
        let mut allocations = Vec::new();
        let result = self.call_inner(input, &mut allocations);
        for (ptr, len) in allocations {
            if let Err(e) = self.deallocate.call(&mut self.store, (ptr, len)) {
                tracing::warn!(ptr, len, error = %e, "Failed to release guest buffer");
            }
        }
        result
    }

    fn alloc(&mut self, len: i32, allocations: &mut Vec<(i32, i32)>) -> Result<i32, BridgeError> {
        let ptr = self
            .allocate
            .call(&mut self.store, len)
            .map_err(|e| wasm_error("allocate failed", e))?;
        if ptr == 0 {
            return Err(wasm_error("allocate failed", format!("null pointer for {len} bytes")));
        }
        allocations.push((ptr, len));
        Ok(ptr)
    }

    fn call_inner(
        &mut self,
        input: &[u8],
        allocations: &mut Vec<(i32, i32)>,
    ) -> Result<String, BridgeError> {
        let input_len = to_i32(input.len())?;
        let input_ptr = self.alloc(input_len, allocations)?;
        self.memory
            .write(&mut self.store, input_ptr as usize, input)
            .map_err(|e| wasm_error("failed to write request", e))?;

        let out_len_ptr = self.alloc(4, allocations)?;
        let result_ptr = self
            .dispatch
            .call(&mut self.store, (input_ptr, input_len, out_len_ptr))
            .map_err(|e| wasm_error("dispatch trapped", e))?;
        if result_ptr == 0 {
            return Err(wasm_error("dispatch failed", "null response pointer"));
        }

        let mut len_bytes = [0u8; 4];
        self.memory
            .read(&self.store, out_len_ptr as usize, &mut len_bytes)
            .map_err(|e| wasm_error("failed to read response length", e))?;
        let output_len = i32::from_le_bytes(len_bytes);
        allocations.push((result_ptr, output_len));

        let mut output = vec![0u8; usize::try_from(output_len).unwrap_or(0)];
        self.memory
            .read(&self.store, result_ptr as usize, &mut output)
            .map_err(|e| wasm_error("failed to read response", e))?;
        String::from_utf8(output)
            .map_err(|e| BridgeError::protocol(format!("guest response is not UTF-8: {e}")))
    }

    fn live_allocations(&mut self) -> Option<i32> {
        self.instance
            .get_global(&mut self.store, "live_allocations")
            .and_then(|g| g.get(&mut self.store).i32())
    }
}

pub struct WasmTransport {
    config: WasmTransportConfig,
    guest: Arc<StdMutex<Option<Guest>>>,
    init_lock: tokio::sync::Mutex<()>,
    ready: AtomicBool,
    closed: AtomicBool,
}

impl WasmTransport {
    pub fn new(config: WasmTransportConfig) -> Self {
        Self {
            config,
            guest: Arc::new(StdMutex::new(None)),
            init_lock: tokio::sync::Mutex::new(()),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Value of the guest's optional `live_allocations` global.
    pub async fn live_allocations(&self) -> Option<i32> {
        let guest = Arc::clone(&self.guest);
        tokio::task::spawn_blocking(move || {
            let mut slot = guest.lock().ok()?;
            slot.as_mut()?.live_allocations()
        })
        .await
        .ok()
        .flatten()
    }

    async fn dispatch(&self, line: String) -> Result<String, BridgeError> {
        let guest = Arc::clone(&self.guest);
        let fuel = self.config.fuel_per_call;
        tokio::task::spawn_blocking(move || {
            let mut slot = guest
                .lock()
                .map_err(|_| wasm_error("guest unavailable", "previous call panicked"))?;
            let guest = slot
                .as_mut()
                .ok_or_else(|| BridgeError::disposed("WASM transport has been shut down"))?;
            guest.call(line.as_bytes(), fuel)
        })
        .await
        .map_err(|e| wasm_error("dispatch task failed", e))?
    }
}

#[async_trait]
impl Disposable for WasmTransport {
    async fn dispose(&self) -> Result<(), BridgeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ready.store(false, Ordering::SeqCst);
        let guest = Arc::clone(&self.guest);
        tokio::task::spawn_blocking(move || {
            if let Ok(mut slot) = guest.lock() {
                slot.take();
            }
        })
        .await
        .map_err(|e| wasm_error("dispose task failed", e))?;
        tracing::debug!("WASM guest released");
        Ok(())
    }
}

#[async_trait]
impl Transport for WasmTransport {
    async fn init(&self) -> Result<(), BridgeError> {
        let _init = self.init_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::disposed("WASM transport has been shut down"));
        }
        if self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }

        let config = self.config.clone();
        let guest = tokio::task::spawn_blocking(move || Guest::load(&config))
            .await
            .map_err(|e| wasm_error("load task failed", e))??;
        match self.guest.lock() {
            Ok(mut slot) => *slot = Some(guest),
            Err(poisoned) => *poisoned.into_inner() = Some(guest),
        }
        self.ready.store(true, Ordering::SeqCst);
        tracing::info!("WASM interpreter ready");
        Ok(())
    }

    async fn send(
        &self,
        request: &EncodedRequest,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::disposed("WASM transport has been shut down"));
        }
        if !self.ready.load(Ordering::SeqCst) {
            self.init().await?;
        }
        // A timed-out dispatch keeps running on its blocking thread; the
        // guest lock serializes the next call behind it.
        bounded(
            self.dispatch(request.line.clone()),
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
