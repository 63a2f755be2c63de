use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::bridge::client::BridgeOptions;
use crate::bridge::codec::DEFAULT_MAX_LINE_LENGTH;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// A call made on every freshly spawned worker before it takes traffic.
#[derive(Debug, Clone)]
pub struct WarmupCall {
    pub module: String,
    pub function: String,
    pub args: Vec<Value>,
}

impl WarmupCall {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            capacity: 1000,
        }
    }
}

/// Configuration for [`ProcessBridge`](super::ProcessBridge).
///
/// Environment overrides applied by `Default`:
/// - `POLYBRIDGE_PYTHON`: interpreter executable (default `python3`)
/// - `POLYBRIDGE_TIMEOUT_MS`: per-request timeout (default 30000)
/// - `POLYBRIDGE_MAX_PROCESSES`: pool ceiling (default 1)
#[derive(Debug, Clone)]
pub struct ProcessBridgeConfig {
    /// Interpreter executable. A bare name is looked up in the virtualenv first.
    pub interpreter: PathBuf,
    /// Bridge script handed to the interpreter as its first argument.
    pub script: Option<PathBuf>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub min_processes: usize,
    pub max_processes: usize,
    /// How long a call may wait for a free worker.
    pub wait_timeout: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub kill_grace: Duration,
    /// Idle workers above `min_processes` are retired after this long. Zero disables.
    pub idle_timeout: Duration,
    /// Recycle a worker after it served this many requests.
    pub max_requests_per_process: Option<u64>,
    pub sweep_interval: Duration,
    /// Result caching; `None` disables it.
    pub cache: Option<CacheConfig>,
    pub warmups: Vec<WarmupCall>,
    pub virtual_env: Option<PathBuf>,
    /// Pass the whole parent environment instead of the allow-list.
    pub inherit_env: bool,
    /// Applied last, over everything else.
    pub env: BTreeMap<String, String>,
    pub max_line_length: usize,
}

impl Default for ProcessBridgeConfig {
    fn default() -> Self {
        let max_processes = env_parse::<usize>("POLYBRIDGE_MAX_PROCESSES")
            .unwrap_or(1)
            .max(1);
        Self {
            interpreter: std::env::var_os("POLYBRIDGE_PYTHON")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("python3")),
            script: None,
            args: Vec::new(),
            cwd: None,
            min_processes: 1,
            max_processes,
            wait_timeout: Duration::from_secs(30),
            timeout: Duration::from_millis(env_parse("POLYBRIDGE_TIMEOUT_MS").unwrap_or(30_000)),
            retries: 0,
            kill_grace: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(300),
            max_requests_per_process: None,
            sweep_interval: Duration::from_secs(30),
            cache: None,
            warmups: Vec::new(),
            virtual_env: None,
            inherit_env: false,
            env: BTreeMap::new(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl ProcessBridgeConfig {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            ..Self::default()
        }
    }

    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Clamps to `0 <= min <= max` with `max >= 1`.
    pub fn with_processes(mut self, min: usize, max: usize) -> Self {
        self.max_processes = max.max(1);
        self.min_processes = min.min(self.max_processes);
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_requests_per_process(mut self, max: u64) -> Self {
        self.max_requests_per_process = Some(max.max(1));
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_warmup(mut self, warmup: WarmupCall) -> Self {
        self.warmups.push(warmup);
        self
    }

    pub fn with_virtual_env(mut self, venv: impl Into<PathBuf>) -> Self {
        self.virtual_env = Some(venv.into());
        self
    }

    pub fn with_inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    /// A single worker multiplexes requests by id; several workers take one each.
    pub fn max_concurrent_per_worker(&self) -> Option<usize> {
        if self.max_processes == 1 { None } else { Some(1) }
    }

    pub(crate) fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions::default()
            .with_timeout(self.timeout)
            .with_retries(self.retries, Duration::from_millis(100))
    }

    pub(crate) fn child_args(&self) -> Vec<String> {
        self.script
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect()
    }
}
