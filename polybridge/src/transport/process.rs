//! Child-process transport: newline-delimited JSON over stdin/stdout.
//!
//! A reader task routes response lines to pending requests by id, so any
//! number of requests may be in flight on one child. Stderr is kept in a small
//! ring buffer and attached to timeout and exit diagnostics.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, OnceCell, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::{Transport, bounded};
use crate::bridge::codec::{BoundedLinesCodec, DEFAULT_MAX_LINE_LENGTH, EncodedRequest, LineFrame};
use crate::bridge::protocol::{RequestId, ResponseHeader};
use crate::disposable::Disposable;
use crate::error::BridgeError;

/// Bytes of stderr retained for diagnostics.
pub const STDERR_TAIL_BYTES: usize = 8 * 1024;

const STDERR_DRAIN_GRACE: Duration = Duration::from_millis(250);

pub struct ProcessTransportConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Complete child environment. `None` inherits the parent's.
    pub env: Option<BTreeMap<String, String>>,
    pub max_line_length: usize,
    /// Time between SIGTERM and SIGKILL on terminate.
    pub kill_grace: Duration,
}

impl ProcessTransportConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: None,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            kill_grace: Duration::from_secs(2),
        }
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

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

type PendingMap = DashMap<RequestId, oneshot::Sender<Result<String, BridgeError>>>;

/// Bounded tail of the child's stderr.
#[derive(Default)]
struct StderrTail {
    buf: StdMutex<VecDeque<u8>>,
}

impl StderrTail {
    fn push_line(&self, line: &str) {
        let mut buf = match self.buf.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buf.extend(line.as_bytes());
        buf.push_back(b'\n');
        let excess = buf.len().saturating_sub(STDERR_TAIL_BYTES);
        buf.drain(..excess);
    }

    fn snapshot(&self) -> String {
        let buf = match self.buf.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bytes: Vec<u8> = buf.iter().copied().collect();
        String::from_utf8_lossy(&bytes).trim_end().to_string()
    }

    fn context(&self) -> String {
        let tail = self.snapshot();
        if tail.is_empty() {
            String::new()
        } else {
            format!("stderr:\n{tail}")
        }
    }
}

struct Running {
    pid: Option<u32>,
    child: Mutex<Child>,
    writer: Mutex<Option<FramedWrite<ChildStdin, BoundedLinesCodec>>>,
    pending: Arc<PendingMap>,
    stderr: Arc<StderrTail>,
    exited: Arc<AtomicBool>,
}

/// Removes a pending entry when the sender stops waiting for any reason.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

pub struct ProcessTransport {
    config: ProcessTransportConfig,
    running: OnceCell<Arc<Running>>,
    closed: AtomicBool,
}

impl ProcessTransport {
    pub fn new(config: ProcessTransportConfig) -> Self {
        Self {
            config,
            running: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// OS process id, once spawned.
    pub fn pid(&self) -> Option<u32> {
        self.running.get().and_then(|r| r.pid)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.running.get().map_or(0, |r| r.pending.len())
    }

    /// Recent stderr output of the child.
    pub fn stderr_tail(&self) -> String {
        self.running
            .get()
            .map(|r| r.stderr.snapshot())
            .unwrap_or_default()
    }

    fn spawn(&self) -> Result<Arc<Running>, BridgeError> {
        let config = &self.config;
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        if let Some(env) = &config.env {
            command.env_clear().envs(env);
        }

        tracing::info!(program = %config.program.display(), "Spawning interpreter process");
        let mut child = command.spawn().map_err(|e| {
            BridgeError::execution(
                "SpawnError",
                format!("failed to spawn {}: {e}", config.program.display()),
            )
        })?;
        let pid = child.id();

        let stdin = take_pipe(child.stdin.take(), "stdin")?;
        let stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stderr = take_pipe(child.stderr.take(), "stderr")?;

        let pending = Arc::new(PendingMap::new());
        let tail = Arc::new(StderrTail::default());
        let exited = Arc::new(AtomicBool::new(false));

        let stderr_task = tokio::spawn(read_stderr(
            FramedRead::new(stderr, BoundedLinesCodec::new(STDERR_TAIL_BYTES)),
            Arc::clone(&tail),
            pid,
        ));
        tokio::spawn(read_responses(
            FramedRead::new(stdout, BoundedLinesCodec::new(config.max_line_length)),
            stderr_task,
            Arc::clone(&pending),
            Arc::clone(&tail),
            Arc::clone(&exited),
            pid,
        ));

        tracing::debug!(?pid, "Interpreter process started");
        Ok(Arc::new(Running {
            pid,
            child: Mutex::new(child),
            writer: Mutex::new(Some(FramedWrite::new(
                stdin,
                BoundedLinesCodec::new(config.max_line_length),
            ))),
            pending,
            stderr: tail,
            exited,
        }))
    }

    async fn running(&self) -> Result<&Arc<Running>, BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::disposed("process transport has been shut down"));
        }
        self.running.get_or_try_init(|| async { self.spawn() }).await
    }

    async fn exchange(
        &self,
        running: &Running,
        request: &EncodedRequest,
    ) -> Result<String, BridgeError> {
        let (tx, rx) = oneshot::channel();
        running.pending.insert(request.id, tx);
        let _guard = PendingGuard {
            pending: &running.pending,
            id: request.id,
        };

        if running.exited.load(Ordering::SeqCst) {
            return Err(worker_exited(running));
        }

        {
            let mut writer = running.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(worker_exited(running));
            };
            tracing::trace!(request_id = request.id, method = %request.method, "Writing request");
            writer
                .send(request.line.as_str())
                .await
                .map_err(|e| BridgeError::from(e).with_context(&running.stderr.context()))?;
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(worker_exited(running)),
        }
    }

    async fn shutdown(&self, reason: BridgeError) -> Result<(), BridgeError> {
        self.closed.store(true, Ordering::SeqCst);
        let Some(running) = self.running.get() else {
            return Ok(());
        };

        fail_pending(&running.pending, &reason);
        // Closing stdin lets a well-behaved worker exit on EOF.
        running.writer.lock().await.take();

        let mut child = running.child.lock().await;
        if matches!(child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }

        send_sigterm(running.pid);
        match tokio::time::timeout(self.config.kill_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid = ?running.pid, %status, "Interpreter process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::warn!(
                    pid = ?running.pid,
                    grace_ms = self.config.kill_grace.as_millis() as u64,
                    "Interpreter ignored SIGTERM, killing"
                );
                child.kill().await.map_err(BridgeError::from)
            }
        }
    }
}

fn take_pipe<T>(pipe: Option<T>, name: &str) -> Result<T, BridgeError> {
    pipe.ok_or_else(|| BridgeError::execution("SpawnError", format!("{name} not captured")))
}

fn worker_exited(running: &Running) -> BridgeError {
    let pid = running
        .pid
        .map_or_else(|| "?".to_string(), |p| p.to_string());
    BridgeError::execution("WorkerExited", format!("worker process {pid} exited"))
        .with_context(&running.stderr.context())
}

fn fail_pending(pending: &PendingMap, reason: &BridgeError) {
    let ids: Vec<RequestId> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(reason.clone()));
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: Option<u32>) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>) {}

async fn read_responses(
    mut reader: FramedRead<ChildStdout, BoundedLinesCodec>,
    stderr_task: tokio::task::JoinHandle<()>,
    pending: Arc<PendingMap>,
    stderr: Arc<StderrTail>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
) {
    let max_line_length = reader.decoder().max_length();
    loop {
        match reader.next().await {
            Some(Ok(LineFrame::Line(line))) => {
                let Some(id) = ResponseHeader::peek(&line) else {
                    tracing::warn!(?pid, line_bytes = line.len(), "Dropping line without response id");
                    continue;
                };
                match pending.remove(&id) {
                    Some((_, tx)) => {
                        tracing::trace!(?pid, request_id = id, "Routing response");
                        let _ = tx.send(Ok(line));
                    }
                    None => {
                        tracing::warn!(?pid, request_id = id, "Dropping response for unknown request");
                    }
                }
            }
            Some(Ok(LineFrame::Oversized)) => {
                tracing::warn!(?pid, max_line_length, "Discarding line over maximum length");
            }
            Some(Ok(LineFrame::Malformed(error))) => {
                tracing::warn!(?pid, %error, "Discarding malformed line");
            }
            Some(Err(e)) => {
                tracing::error!(?pid, error = %e, "Interpreter stdout read failed");
                break;
            }
            None => break,
        }
    }

    exited.store(true, Ordering::SeqCst);
    // Let the last stderr lines land in the tail before reporting.
    let _ = tokio::time::timeout(STDERR_DRAIN_GRACE, stderr_task).await;
    let reason = BridgeError::execution(
        "WorkerExited",
        format!(
            "worker process {} exited",
            pid.map_or_else(|| "?".to_string(), |p| p.to_string())
        ),
    )
    .with_context(&stderr.context());
    if !pending.is_empty() {
        tracing::error!(?pid, pending = pending.len(), "Interpreter exited with requests in flight");
    }
    fail_pending(&pending, &reason);
}

async fn read_stderr(
    mut reader: FramedRead<ChildStderr, BoundedLinesCodec>,
    tail: Arc<StderrTail>,
    pid: Option<u32>,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(LineFrame::Line(line)) => {
                tracing::debug!(target: "polybridge::worker_stderr", ?pid, "{}", line);
                tail.push_line(&line);
            }
            Ok(LineFrame::Oversized) => tail.push_line("[stderr line truncated]"),
            Ok(LineFrame::Malformed(_)) => tail.push_line("[non-UTF-8 stderr output]"),
            Err(_) => break,
        }
    }
}

#[async_trait]
impl Disposable for ProcessTransport {
    async fn dispose(&self) -> Result<(), BridgeError> {
        if self.closed.swap(true, Ordering::SeqCst) && self.running.get().is_none() {
            return Ok(());
        }
        self.shutdown(BridgeError::disposed("process transport disposed"))
            .await
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn init(&self) -> Result<(), BridgeError> {
        self.running().await.map(|_| ())
    }

    async fn send(
        &self,
        request: &EncodedRequest,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, BridgeError> {
        let running = self.running().await?;
        let result = bounded(
            self.exchange(running, request),
            timeout,
            cancel,
            &format!("{} request {}", request.method, request.id),
        )
        .await;

        match result {
            Err(BridgeError::Timeout(message)) => {
                Err(BridgeError::Timeout(message).with_context(&running.stderr.context()))
            }
            other => other,
        }
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self
                .running
                .get()
                .is_some_and(|r| !r.exited.load(Ordering::SeqCst))
    }

    async fn terminate(&self, reason: BridgeError) -> Result<(), BridgeError> {
        tracing::info!(pid = ?self.pid(), reason = %reason, "Terminating interpreter process");
        self.shutdown(reason).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bridge::protocol::Method;

    fn sh(script: &str) -> ProcessTransport {
        ProcessTransport::new(
            ProcessTransportConfig::new("/bin/sh")
                .with_args(["-c", script])
                .with_kill_grace(Duration::from_millis(200)),
        )
    }

    fn request(id: RequestId) -> EncodedRequest {
        EncodedRequest {
            id,
            method: Method::Call,
            handle: None,
            line: format!(r#"{{"id":{id},"protocol":"polybridge/1","method":"meta"}}"#),
        }
    }

    #[tokio::test]
    async fn routes_responses_by_id() {
        // Echo each request line back; the id is preserved.
        let transport = sh("while IFS= read -r line; do echo \"$line\"; done");
        transport.init().await.unwrap();
        assert!(transport.is_ready());

        let (req1, req2) = (request(1), request(2));
        let (a, b) = tokio::join!(
            transport.send(&req1, Duration::from_secs(5), None),
            transport.send(&req2, Duration::from_secs(5), None),
        );
        assert!(a.unwrap().contains(r#""id":1"#));
        assert!(b.unwrap().contains(r#""id":2"#));
        assert_eq!(transport.pending_count(), 0);
        transport.dispose().await.unwrap();
        assert!(!transport.is_ready());
    }

    #[tokio::test]
    async fn unmatched_and_oversized_lines_are_skipped() {
        let transport = ProcessTransport::new(
            ProcessTransportConfig::new("/bin/sh")
                .with_args([
                    "-c",
                    "read -r line; echo '{\"id\":999,\"result\":0}'; \
                     echo 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx'; \
                     echo '{\"id\":1,\"result\":4}'; sleep 5",
                ])
                .with_max_line_length(40)
                .with_kill_grace(Duration::from_millis(200)),
        );
        let response = transport
            .send(&request(1), Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(response, r#"{"id":1,"result":4}"#);
        transport.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn exit_fails_pending_with_stderr() {
        let transport = sh("read -r line; echo 'fatal: boom' >&2; exit 3");
        let err = transport
            .send(&request(1), Duration::from_secs(5), None)
            .await
            .unwrap_err();
        match err {
            BridgeError::Execution { kind, message, .. } => {
                assert_eq!(kind, "WorkerExited");
                assert!(message.contains("fatal: boom"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!transport.is_ready());
        assert!(transport.stderr_tail().contains("fatal: boom"));
    }

    #[tokio::test]
    async fn timeout_and_cancel_are_timeout_kind() {
        let transport = sh("sleep 30");
        let err = transport
            .send(&request(1), Duration::from_millis(50), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = transport
            .send(&request(2), Duration::ZERO, Some(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        assert_eq!(transport.pending_count(), 0);
        transport.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn terminate_rejects_pending_with_reason() {
        let transport = Arc::new(sh("trap '' TERM; sleep 30"));
        transport.init().await.unwrap();

        let sender = Arc::clone(&transport);
        let in_flight = tokio::spawn(async move {
            sender.send(&request(1), Duration::ZERO, None).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        transport
            .terminate(BridgeError::execution("Quarantined", "worker quarantined"))
            .await
            .unwrap();
        let err = in_flight.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Execution { ref kind, .. } if kind == "Quarantined"));

        let err = transport
            .send(&request(2), Duration::ZERO, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Disposed(_)));
    }

    #[tokio::test]
    async fn spawn_failure_is_execution_error() {
        let transport = ProcessTransport::new(ProcessTransportConfig::new(
            "/nonexistent/polybridge-interpreter",
        ));
        let err = transport.init().await.unwrap_err();
        assert!(matches!(err, BridgeError::Execution { ref kind, .. } if kind == "SpawnError"));
    }
}
