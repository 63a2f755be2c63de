//! Reference worker speaking the polybridge line protocol on stdin/stdout.
//!
//! Modules:
//! - `math`: `sqrt`, `pow`, `add`, `ident`
//! - `counter`: class `Counter(start=0)` with `increment(by=1)` and `value()`
//! - `helpers`: `sleep`, `fail`, `exit`, `env`, `echo`, `frame`, `pid`, `get_call_count`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};

use polybridge::bridge::envelope::{CodecEnvelope, EnvelopeTag};
use polybridge::bridge::protocol::{BridgeInfo, InstanceHandle, Kwargs, RemoteError};
use polybridge::logging::init_tracing;
use polybridge::version::{BRIDGE_VERSION, PROTOCOL_ID, PROTOCOL_VERSION};
use polybridge::worker::{WorkerConfig, WorkerHandler, run_worker};

fn type_error(message: impl Into<String>) -> RemoteError {
    RemoteError::new("TypeError", message)
}

/// Positional argument `index`, falling back to keyword `name`.
fn arg<'a>(args: &'a [Value], kwargs: &'a Kwargs, index: usize, name: &str) -> Option<&'a Value> {
    args.get(index).or_else(|| kwargs.get(name))
}

fn number(args: &[Value], kwargs: &Kwargs, index: usize, name: &str) -> Result<f64, RemoteError> {
    arg(args, kwargs, index, name)
        .and_then(Value::as_f64)
        .ok_or_else(|| type_error(format!("argument '{name}' must be a number")))
}

fn integer(args: &[Value], kwargs: &Kwargs, index: usize, name: &str, default: i64) -> Result<i64, RemoteError> {
    match arg(args, kwargs, index, name) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_i64()
            .ok_or_else(|| type_error(format!("argument '{name}' must be an integer"))),
    }
}

fn text<'a>(args: &'a [Value], kwargs: &'a Kwargs, index: usize, name: &str) -> Result<&'a str, RemoteError> {
    arg(args, kwargs, index, name)
        .and_then(Value::as_str)
        .ok_or_else(|| type_error(format!("argument '{name}' must be a string")))
}

/// JSON cannot carry NaN or infinities.
fn finite(value: f64, function: &str) -> Result<Value, RemoteError> {
    if value.is_finite() {
        Ok(json!(value))
    } else {
        Err(RemoteError::new(
            "ValueError",
            format!("{function} produced a non-finite result"),
        ))
    }
}

#[derive(Default)]
struct ReferenceWorker {
    counters: DashMap<String, AtomicI64>,
    next_instance: AtomicU64,
    calls: AtomicU64,
}

impl ReferenceWorker {
    fn math(&self, function: &str, args: &[Value], kwargs: &Kwargs) -> Result<Value, RemoteError> {
        match function {
            "sqrt" => {
                let x = number(args, kwargs, 0, "x")?;
                if x < 0.0 {
                    return Err(RemoteError::new("ValueError", "math domain error"));
                }
                finite(x.sqrt(), function)
            }
            "pow" => finite(
                number(args, kwargs, 0, "x")?.powf(number(args, kwargs, 1, "y")?),
                function,
            ),
            "add" => finite(
                number(args, kwargs, 0, "a")? + number(args, kwargs, 1, "b")?,
                function,
            ),
            "ident" => Ok(arg(args, kwargs, 0, "value").cloned().unwrap_or(Value::Null)),
            _ => Err(no_attribute("math", function)),
        }
    }

    async fn helpers(&self, function: &str, args: &[Value], kwargs: &Kwargs) -> Result<Value, RemoteError> {
        match function {
            "sleep" => {
                let ms = integer(args, kwargs, 0, "ms", 0)?.max(0) as u64;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            }
            "fail" => {
                let message = text(args, kwargs, 0, "message").unwrap_or("failure requested");
                Err(RemoteError {
                    kind: "ValueError".into(),
                    message: message.to_string(),
                    trace: Some(format!("Traceback (most recent call last):\n  helpers.fail\nValueError: {message}")),
                })
            }
            "exit" => {
                let code = integer(args, kwargs, 0, "code", 1)?;
                tracing::warn!(code, "Exiting on request");
                std::process::exit(code as i32);
            }
            "env" => {
                let name = text(args, kwargs, 0, "name")?;
                Ok(std::env::var(name).map(Value::String).unwrap_or(Value::Null))
            }
            "echo" => Ok(arg(args, kwargs, 0, "value").cloned().unwrap_or(Value::Null)),
            "frame" => {
                let values: Vec<f64> = arg(args, kwargs, 0, "values")
                    .and_then(Value::as_array)
                    .ok_or_else(|| type_error("argument 'values' must be a list of numbers"))?
                    .iter()
                    .map(|v| v.as_f64().ok_or_else(|| type_error("argument 'values' must be a list of numbers")))
                    .collect::<Result<_, _>>()?;
                let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                let envelope = CodecEnvelope::columnar(EnvelopeTag::Ndarray, &bytes)
                    .with_shape(vec![values.len()])
                    .with_dtype("float64");
                serde_json::to_value(envelope).map_err(|e| RemoteError::new("TypeError", e.to_string()))
            }
            "pid" => Ok(json!(std::process::id())),
            "get_call_count" => Ok(json!(self.calls.load(Ordering::SeqCst))),
            _ => Err(no_attribute("helpers", function)),
        }
    }

    fn counter(&self, handle: &InstanceHandle) -> Result<dashmap::mapref::one::Ref<'_, String, AtomicI64>, RemoteError> {
        self.counters.get(handle.as_str()).ok_or_else(|| {
            RemoteError::new("KeyError", format!("no live instance {handle}"))
        })
    }
}

fn no_attribute(module: &str, name: &str) -> RemoteError {
    RemoteError::new(
        "AttributeError",
        format!("module '{module}' has no attribute '{name}'"),
    )
}

#[async_trait]
impl WorkerHandler for ReferenceWorker {
    async fn call(
        &self,
        module: &str,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match module {
            "math" => self.math(function, &args, &kwargs),
            "helpers" => self.helpers(function, &args, &kwargs).await,
            _ => Err(RemoteError::new(
                "ModuleNotFoundError",
                format!("No module named '{module}'"),
            )),
        }
    }

    async fn instantiate(
        &self,
        module: &str,
        class: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<InstanceHandle, RemoteError> {
        if (module, class) != ("counter", "Counter") {
            return Err(no_attribute(module, class));
        }
        let start = integer(&args, &kwargs, 0, "start", 0)?;
        let n = self.next_instance.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = format!("Counter-{}-{n}", std::process::id());
        self.counters.insert(handle.clone(), AtomicI64::new(start));
        tracing::debug!(%handle, start, "Created counter");
        Ok(InstanceHandle::new(handle))
    }

    async fn call_method(
        &self,
        handle: &InstanceHandle,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, RemoteError> {
        let counter = self.counter(handle)?;
        match method {
            "increment" => {
                let by = integer(&args, &kwargs, 0, "by", 1)?;
                Ok(json!(counter.fetch_add(by, Ordering::SeqCst) + by))
            }
            "value" => Ok(json!(counter.load(Ordering::SeqCst))),
            _ => Err(RemoteError::new(
                "AttributeError",
                format!("'Counter' object has no attribute '{method}'"),
            )),
        }
    }

    async fn dispose_instance(&self, handle: &InstanceHandle) -> Result<(), RemoteError> {
        match self.counters.remove(handle.as_str()) {
            Some(_) => Ok(()),
            None => Err(RemoteError::new("KeyError", format!("no live instance {handle}"))),
        }
    }

    fn info(&self) -> BridgeInfo {
        BridgeInfo {
            protocol: PROTOCOL_ID.to_string(),
            protocol_version: PROTOCOL_VERSION,
            interpreter: "polybridge-worker".to_string(),
            interpreter_version: BRIDGE_VERSION.to_string(),
            pid: std::process::id(),
            columnar_codec: true,
            optional_packages: BTreeMap::from([("numpy".to_string(), false)]),
            instances: self.counters.len() as u64,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!(pid = std::process::id(), version = BRIDGE_VERSION, "Worker starting");

    run_worker(Arc::new(ReferenceWorker::default()), WorkerConfig::default())
        .await
        .context("worker loop failed")?;

    tracing::info!("Worker stopped");
    Ok(())
}
