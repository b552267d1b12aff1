//! Worker client and its builder.
//!
//! The [`ClientBuilder`] configures how the worker is launched and which wire
//! format envelopes use. The [`WorkerClient`] manages the lifecycle:
//! 1. Spawn the worker lazily on the first call
//! 2. Start a reader task that routes responses to waiting calls by id
//! 3. Queue whole request frames to a writer task that owns the stdin pipe
//! 4. Fail every pending call when the worker's output ends
//!
//! # Example
//!
//! ```no_run
//! use pipe_offload::{CallOptions, ClientBuilder, PayloadCodec, WorkerCommand};
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> pipe_offload::Result<()> {
//!     let client = ClientBuilder::new()
//!         .command(WorkerCommand::new("pipe-offload-worker"))
//!         .build()?;
//!
//!     let options = CallOptions::new().codec(PayloadCodec::Json);
//!     let reply: Value = client.call("echo", &json!({"a": 1}), &options).await?;
//!     assert_eq!(reply, json!({"a": 1}));
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

mod options;
mod pending;

pub use options::{
    AfterRecvHook, BeforeSendHook, CallOptions, CancelCheck, MetricsHook, OffloadResponse,
    RequestMeta, ResponseMeta, CANCEL_POLL_INTERVAL, DEFAULT_CALL_TIMEOUT,
};

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{
    decode_envelope, encode_envelope, encode_payload, peek_request_id, PayloadCodec, WireFormat,
};
use crate::error::{OffloadError, Result};
use crate::protocol::{
    check_length, write_frame, FrameBuffer, RequestEnvelope, ResponseEnvelope, ResponseStatus,
    DEFAULT_MAX_FRAME_SIZE,
};
use crate::transport::{terminate, WorkerCommand, DEFAULT_EXIT_GRACE};
use pending::{CloseReason, Delivery, PendingCalls};

/// Worker launch command, whitespace separated.
pub const ENV_WORKER_CMD: &str = "PIPE_OFFLOAD_WORKER_CMD";
/// Envelope wire format: `json` or `msgpack`.
pub const ENV_WIRE: &str = "PIPE_OFFLOAD_WIRE";
/// Maximum frame size in bytes, shared by client and worker.
pub const ENV_MAX_FRAME_BYTES: &str = "PIPE_OFFLOAD_MAX_FRAME_BYTES";

/// Default number of automatic restarts for idempotent calls.
pub const DEFAULT_MAX_RESTARTS: u32 = 1;

/// Size of the reader task's read buffer.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Builder for configuring and creating a [`WorkerClient`].
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    command: Option<WorkerCommand>,
    env: Vec<(OsString, OsString)>,
    cwd: Option<PathBuf>,
    wire: WireFormat,
    max_frame_size: usize,
    restart_on_failure: bool,
    max_restarts: u32,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            command: None,
            env: Vec::new(),
            cwd: None,
            wire: WireFormat::preferred(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            restart_on_failure: true,
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }

    /// Create a builder from `PIPE_OFFLOAD_*` environment variables.
    ///
    /// `PIPE_OFFLOAD_WORKER_CMD` is required; `PIPE_OFFLOAD_WIRE` and
    /// `PIPE_OFFLOAD_MAX_FRAME_BYTES` are optional.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let line = lookup(ENV_WORKER_CMD)
            .ok_or_else(|| OffloadError::Config(format!("{ENV_WORKER_CMD} is not set")))?;
        let mut builder = Self::new().command(WorkerCommand::from_command_line(&line)?);

        if let Some(wire) = lookup(ENV_WIRE) {
            let wire = wire.trim().parse::<WireFormat>().map_err(|_| {
                OffloadError::Config(format!("invalid {ENV_WIRE} '{wire}' (expected json or msgpack)"))
            })?;
            builder = builder.wire(wire);
        }

        if let Some(max) = lookup(ENV_MAX_FRAME_BYTES) {
            builder = builder.max_frame_size(parse_frame_size(&max)?);
        }

        Ok(builder)
    }

    /// Command used to launch the worker.
    pub fn command(mut self, command: WorkerCommand) -> Self {
        self.command = Some(command);
        self
    }

    /// Add an environment variable for the worker process.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Working directory for the worker process.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Envelope wire format.
    ///
    /// Default: msgpack when compiled in, else JSON.
    pub fn wire(mut self, wire: WireFormat) -> Self {
        self.wire = wire;
        self
    }

    /// Maximum frame size in either direction.
    ///
    /// Default: 64 MiB
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Whether idempotent calls may restart a failed worker and retry.
    ///
    /// Default: true
    pub fn restart_on_failure(mut self, enabled: bool) -> Self {
        self.restart_on_failure = enabled;
        self
    }

    /// Maximum restarts per call.
    ///
    /// Default: 1
    pub fn max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = max;
        self
    }

    fn validate(&self) -> Result<()> {
        self.wire.ensure_available()?;
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(OffloadError::Config(format!(
                "max frame size must be between 1 and {} bytes, got {}",
                u32::MAX,
                self.max_frame_size
            )));
        }
        Ok(())
    }

    fn into_client(self, command: Option<WorkerCommand>, state: State) -> WorkerClient {
        WorkerClient {
            command,
            wire: self.wire,
            max_frame_size: self.max_frame_size,
            restart_on_failure: self.restart_on_failure,
            max_restarts: self.max_restarts,
            next_id: AtomicU64::new(1),
            state: Mutex::new(state),
        }
    }

    /// Build a client. The worker is not started until the first call.
    ///
    /// # Errors
    ///
    /// `Config` if no command was set or the frame size is out of range,
    /// `CodecUnavailable` if the wire format is not compiled in.
    pub fn build(self) -> Result<WorkerClient> {
        self.validate()?;
        let mut command = self
            .command
            .clone()
            .ok_or_else(|| OffloadError::Config("no worker command configured".to_string()))?;
        for (key, value) in &self.env {
            command = command.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            command = command.current_dir(dir);
        }
        Ok(self.into_client(Some(command), State::Unstarted))
    }

    /// Build a client that talks to an already running peer over the given
    /// streams instead of spawning a process.
    ///
    /// Such a client cannot restart its worker. Must be called inside a
    /// tokio runtime.
    pub fn connect<R, W>(self, reader: R, writer: W) -> Result<WorkerClient>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.validate()?;
        let connection = Connection::open(reader, Box::new(writer), None, self.wire, self.max_frame_size);
        Ok(self.into_client(None, State::Running(Arc::new(connection))))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_frame_size(value: &str) -> Result<usize> {
    value.trim().parse::<usize>().map_err(|e| {
        OffloadError::Config(format!("invalid {ENV_MAX_FRAME_BYTES} '{value}': {e}"))
    })
}

/// Observable lifecycle state of a [`WorkerClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No worker started yet (or the last one was discarded for restart).
    Unstarted,
    Running,
    /// The worker's output ended; calls fail until restart.
    Crashed,
    Closed,
}

enum State {
    Unstarted,
    Running(Arc<Connection>),
    Closed,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Encoded frames waiting for the writer task.
const WRITE_QUEUE_CAPACITY: usize = 1024;

/// One live worker: its pipes, reader and writer tasks, and pending calls.
struct Connection {
    /// Whole frames for the writer task, which alone owns the worker's stdin.
    outbound: mpsc::Sender<Bytes>,
    writer: JoinHandle<()>,
    pending: Arc<PendingCalls>,
    reader: JoinHandle<()>,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
}

impl Connection {
    fn open<R>(
        reader: R,
        writer: BoxedWriter,
        child: Option<Child>,
        wire: WireFormat,
        max_frame_size: usize,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending = PendingCalls::new();
        let pid = child.as_ref().and_then(Child::id);
        let (outbound, frames) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let writer = spawn_writer(writer, frames, Arc::clone(&pending), max_frame_size);
        let reader = spawn_reader(reader, Arc::clone(&pending), wire, max_frame_size);
        Self {
            outbound,
            writer,
            pending,
            reader,
            child: Mutex::new(child),
            pid,
        }
    }

    fn spawn(command: &WorkerCommand, wire: WireFormat, max_frame_size: usize) -> Result<Self> {
        let process = command.spawn()?;
        Ok(Self::open(
            process.stdout,
            Box::new(process.stdin),
            Some(process.child),
            wire,
            max_frame_size,
        ))
    }

    fn is_dead(&self) -> bool {
        self.pending.is_closed()
    }

    /// Queue one frame. Once queued it is written whole, even if the
    /// caller's future is dropped; write failures reach the caller through
    /// its pending call.
    async fn send(&self, frame: Bytes, max_frame_size: usize) -> Result<()> {
        check_length(frame.len(), max_frame_size)?;
        self.outbound.send(frame).await.map_err(|_| {
            self.pending.closed_error().unwrap_or_else(|| {
                OffloadError::WorkerCrashed("worker input is closed".to_string())
            })
        })
    }

    /// Fail pending calls, stop the reader, close stdin and stop the process.
    async fn shutdown(&self, reason: CloseReason) {
        let failed = self.pending.close(reason);
        if failed > 0 {
            tracing::debug!(failed, "failed pending calls on shutdown");
        }
        self.reader.abort();
        // Dropping the writer task's pipe closes the worker's stdin.
        self.writer.abort();

        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = child {
            terminate(&mut child, DEFAULT_EXIT_GRACE).await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Write queued frames in order until the queue closes or a write fails.
fn spawn_writer(
    mut writer: BoxedWriter,
    mut frames: mpsc::Receiver<Bytes>,
    pending: Arc<PendingCalls>,
    max_frame_size: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame, max_frame_size).await {
                let reason = format!("failed to write request: {e}");
                let failed = pending.close(CloseReason::Crashed(reason.clone()));
                tracing::warn!(failed, "writer stopped: {}", reason);
                return;
            }
        }
    })
}

fn spawn_reader<R>(
    reader: R,
    pending: Arc<PendingCalls>,
    wire: WireFormat,
    max_frame_size: usize,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let reason = match read_loop(reader, &pending, wire, max_frame_size).await {
            Ok(()) => "worker closed its output stream".to_string(),
            Err(e) => format!("worker output failed: {e}"),
        };
        let failed = pending.close(CloseReason::Crashed(reason.clone()));
        tracing::debug!(failed, "reader stopped: {}", reason);
    })
}

/// Read frames until end-of-stream and route each response to its waiter.
async fn read_loop<R>(
    mut reader: R,
    pending: &PendingCalls,
    wire: WireFormat,
    max_frame_size: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_frame_size(max_frame_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            if frame_buffer.has_partial_frame() {
                return Err(OffloadError::EndOfStream);
            }
            return Ok(());
        }

        for frame in frame_buffer.push(&buf[..n])? {
            route_frame(&frame, pending, wire);
        }
    }
}

fn route_frame(frame: &[u8], pending: &PendingCalls, wire: WireFormat) {
    match decode_envelope::<ResponseEnvelope>(frame, wire) {
        Ok(response) => {
            let request_id = response.request_id;
            if !pending.fulfill(response) {
                tracing::debug!(request_id, "discarding response with no waiting call");
            }
        }
        Err(e) => match peek_request_id(frame) {
            Some((request_id, _)) => {
                tracing::warn!(request_id, "malformed response envelope: {}", e);
                pending.fail(
                    request_id,
                    OffloadError::Protocol(format!("malformed response envelope: {e}")),
                );
            }
            None => {
                tracing::warn!("undecodable response with no request id: {}", e);
            }
        },
    }
}

/// Wait for the delivery, polling the cancel check and honoring the timeout.
async fn wait_for_response(
    mut rx: oneshot::Receiver<Delivery>,
    options: &CallOptions,
) -> Result<ResponseEnvelope> {
    let deadline = options.get_timeout().map(|t| Instant::now() + t);
    let poll = options.has_cancel_check();

    loop {
        let next_poll = poll.then(|| Instant::now() + CANCEL_POLL_INTERVAL);
        let wake = match (deadline, next_poll) {
            (Some(d), Some(p)) => Some(d.min(p)),
            (d, p) => d.or(p),
        };

        let outcome = match wake {
            Some(at) => tokio::time::timeout_at(at, &mut rx).await.ok(),
            None => Some((&mut rx).await),
        };

        match outcome {
            Some(Ok(delivery)) => return delivery,
            Some(Err(_)) => {
                return Err(OffloadError::WorkerCrashed(
                    "response channel dropped".to_string(),
                ))
            }
            None => {
                if options.is_cancelled() {
                    return Err(OffloadError::Cancelled);
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(OffloadError::Timeout);
                }
            }
        }
    }
}

/// Client for one worker process.
///
/// Safe to share between tasks (`Arc<WorkerClient>`); calls proceed
/// concurrently and are correlated by request id.
pub struct WorkerClient {
    command: Option<WorkerCommand>,
    wire: WireFormat,
    max_frame_size: usize,
    restart_on_failure: bool,
    max_restarts: u32,
    next_id: AtomicU64,
    state: Mutex<State>,
}

impl WorkerClient {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        match &*self.lock_state() {
            State::Unstarted => ClientState::Unstarted,
            State::Running(conn) if conn.is_dead() => ClientState::Crashed,
            State::Running(_) => ClientState::Running,
            State::Closed => ClientState::Closed,
        }
    }

    /// Process id of the running worker, if any.
    pub fn pid(&self) -> Option<u32> {
        match &*self.lock_state() {
            State::Running(conn) => conn.pid,
            _ => None,
        }
    }

    /// Wire format used for envelopes.
    pub fn wire(&self) -> WireFormat {
        self.wire
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_calls(&self) -> usize {
        match &*self.lock_state() {
            State::Running(conn) => conn.pending.len(),
            _ => 0,
        }
    }

    /// Return the live connection, spawning the worker if needed.
    fn connection(&self) -> Result<Arc<Connection>> {
        let mut state = self.lock_state();
        match &*state {
            State::Running(conn) if conn.is_dead() => {
                return Err(OffloadError::WorkerCrashed(
                    "worker is no longer running".to_string(),
                ))
            }
            State::Running(conn) => return Ok(Arc::clone(conn)),
            State::Closed => return Err(OffloadError::ClientClosed),
            State::Unstarted => {}
        }

        let command = self.command.as_ref().ok_or_else(|| {
            OffloadError::WorkerUnavailable("no worker command configured".to_string())
        })?;
        let conn = Arc::new(Connection::spawn(command, self.wire, self.max_frame_size)?);
        *state = State::Running(Arc::clone(&conn));
        Ok(conn)
    }

    /// Tear down a dead worker so the next call spawns a fresh one.
    async fn discard_dead_worker(&self) {
        let dead = {
            let mut state = self.lock_state();
            if matches!(&*state, State::Running(conn) if conn.is_dead()) {
                match std::mem::replace(&mut *state, State::Unstarted) {
                    State::Running(conn) => Some(conn),
                    _ => None,
                }
            } else {
                None
            }
        };
        if let Some(conn) = dead {
            conn.shutdown(CloseReason::Crashed("worker restarted".to_string()))
                .await;
        }
    }

    /// Stop the current worker (if any); the next call spawns a new one.
    ///
    /// Calls pending on the old worker fail with `WorkerCrashed`.
    pub async fn restart(&self) -> Result<()> {
        let previous = {
            let mut state = self.lock_state();
            if matches!(*state, State::Closed) {
                return Err(OffloadError::ClientClosed);
            }
            if self.command.is_none() {
                return Err(OffloadError::WorkerUnavailable(
                    "client has no worker command to restart".to_string(),
                ));
            }
            std::mem::replace(&mut *state, State::Unstarted)
        };
        if let State::Running(conn) = previous {
            conn.shutdown(CloseReason::Crashed("worker restarted".to_string()))
                .await;
        }
        Ok(())
    }

    /// Close the client: fail pending calls with `ClientClosed`, stop the
    /// reader and terminate the worker. Idempotent.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), State::Closed);
        if let State::Running(conn) = previous {
            conn.shutdown(CloseReason::ClientClosed).await;
        }
    }

    /// Call `entry` with a structured payload and decode the result.
    ///
    /// The payload is encoded with `options.codec`; the result is decoded with
    /// the codec the worker reports.
    pub async fn call<T, R>(&self, entry: &str, payload: &T, options: &CallOptions) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = encode_payload(payload, options.get_codec())?;
        let response = self.call_bytes(entry, Bytes::from(payload), options).await?;
        response.decode()
    }

    /// Call `entry` with an already encoded payload and return the response
    /// undecoded.
    pub async fn call_bytes(
        &self,
        entry: &str,
        payload: Bytes,
        options: &CallOptions,
    ) -> Result<OffloadResponse> {
        options.get_codec().ensure_available()?;

        let mut restarts = 0;
        loop {
            match self.call_once(entry, payload.clone(), options).await {
                Err(e) if e.is_worker_failure() && self.may_retry(options, restarts) => {
                    restarts += 1;
                    tracing::warn!(entry, restarts, "worker failed ({}), restarting", e);
                    self.discard_dead_worker().await;
                }
                result => return result,
            }
        }
    }

    fn may_retry(&self, options: &CallOptions, restarts: u32) -> bool {
        self.restart_on_failure
            && self.command.is_some()
            && options.is_idempotent()
            && restarts < self.max_restarts
    }

    async fn call_once(
        &self,
        entry: &str,
        payload: Bytes,
        options: &CallOptions,
    ) -> Result<OffloadResponse> {
        let conn = self.connection()?;

        if options.is_cancelled() {
            return Err(OffloadError::Cancelled);
        }

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (_guard, rx) = conn.pending.register(request_id)?;

        let codec = options.get_codec();
        let request_meta = RequestMeta {
            request_id,
            entry,
            codec,
            timeout: options.get_timeout(),
            payload_bytes: payload.len(),
        };
        options.notify_before_send(&request_meta);

        let request = RequestEnvelope::new(request_id, entry, codec, payload);
        let frame = encode_envelope(&request, self.wire)?;

        let started = Instant::now();
        conn.send(Bytes::from(frame), self.max_frame_size).await?;
        let response = wait_for_response(rx, options).await?;

        let client_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut metrics = response.metrics.clone().unwrap_or_default();
        metrics.insert("client_ms".to_string(), client_ms);

        options.notify_received(&ResponseMeta {
            request: request_meta,
            status: &response.status,
            codec: &response.codec,
            client_ms,
            metrics: &metrics,
        });

        let error = response.error.unwrap_or_default();
        match response.status {
            ResponseStatus::Ok => Ok(OffloadResponse {
                codec: response.codec,
                payload: response.payload,
                metrics,
            }),
            ResponseStatus::InvalidInput => Err(OffloadError::InvalidInput(error)),
            ResponseStatus::InternalError => Err(OffloadError::InternalError(error)),
            ResponseStatus::Other(status) => Err(OffloadError::Protocol(format!(
                "unexpected response status '{status}': {error}"
            ))),
        }
    }

    /// Round-trip a `__ping__` and return the elapsed time.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration> {
        let options = CallOptions::new()
            .codec(PayloadCodec::Raw)
            .timeout(timeout);
        let started = Instant::now();
        self.call_bytes("__ping__", Bytes::new(), &options).await?;
        Ok(started.elapsed())
    }
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient")
            .field("command", &self.command)
            .field("wire", &self.wire)
            .field("state", &self.state())
            .finish()
    }
}
