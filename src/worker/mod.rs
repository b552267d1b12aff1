//! Worker side of the protocol.
//!
//! [`WorkerLoop::run`] reads request frames, detects each request's wire
//! format, dispatches through the closed [`Operation`] table and writes
//! exactly one response per request, in the order requests arrived. A bad
//! request never stops the loop; only a broken stream does.
//!
//! # Example
//!
//! ```no_run
//! use pipe_offload::worker::{WorkerConfig, WorkerLoop};
//!
//! #[tokio::main]
//! async fn main() -> pipe_offload::Result<()> {
//!     let worker = WorkerLoop::new(WorkerConfig::from_env()?);
//!     worker.run(tokio::io::stdin(), tokio::io::stdout()).await
//! }
//! ```

mod ops;

pub use ops::{
    execute, list_items, ExecError, ItemRow, ListItemsRequest, ListItemsResponse, OpContext,
    OpOutput, Operation, StatsResponse, StatusCounts, MAX_SLEEP,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::client::ENV_MAX_FRAME_BYTES;
use crate::codec::{detect_request, encode_envelope, peek_request_id, WireFormat};
use crate::error::{OffloadError, Result};
use crate::protocol::{
    try_read_frame, write_frame, Metrics, RequestEnvelope, ResponseEnvelope, ResponseStatus,
    DEFAULT_MAX_FRAME_SIZE,
};

/// Exit after this many milliseconds without a request.
pub const ENV_WORKER_IDLE_MS: &str = "PIPE_OFFLOAD_WORKER_IDLE_MS";

/// Worker loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub max_frame_size: usize,
    /// Exit cleanly if no request arrives within this long. None waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            idle_timeout: None,
        }
    }
}

impl WorkerConfig {
    /// Read `PIPE_OFFLOAD_MAX_FRAME_BYTES` and `PIPE_OFFLOAD_WORKER_IDLE_MS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_MAX_FRAME_BYTES) {
            config.max_frame_size = parse_number(ENV_MAX_FRAME_BYTES, &value)? as usize;
        }
        if let Some(value) = lookup(ENV_WORKER_IDLE_MS) {
            let ms = parse_number(ENV_WORKER_IDLE_MS, &value)?;
            config.idle_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        Ok(config)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| OffloadError::Config(format!("invalid {key} '{value}': {e}")))
}

/// Serves requests from one input stream.
#[derive(Debug)]
pub struct WorkerLoop {
    config: WorkerConfig,
    requests: AtomicU64,
}

impl WorkerLoop {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            requests: AtomicU64::new(0),
        }
    }

    /// Frames received so far.
    pub fn requests_received(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Serve until the input closes or the idle timeout passes.
    ///
    /// # Errors
    ///
    /// Stream failures (`Io`, a frame cut short, an oversize length prefix).
    /// Request-level failures are answered, not returned.
    pub async fn run<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let max = self.config.max_frame_size;
        loop {
            let frame = match try_read_frame(&mut reader, self.config.idle_timeout, max).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::debug!("input closed, worker exiting");
                    return Ok(());
                }
                Err(OffloadError::Timeout) => {
                    tracing::debug!("idle timeout reached, worker exiting");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let requests = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
            let (response, wire) = self.handle_frame(frame, requests).await;
            self.write_response(&mut writer, response, wire).await?;
        }
    }

    async fn write_response<W>(
        &self,
        writer: &mut W,
        response: ResponseEnvelope,
        wire: WireFormat,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let max = self.config.max_frame_size;
        let request_id = response.request_id;
        let bytes = encode_envelope(&response, wire)?;
        match write_frame(writer, &bytes, max).await {
            Err(OffloadError::FrameTooLarge { size, max }) => {
                tracing::warn!(request_id, size, max, "response exceeds max frame size");
                let fallback = ResponseEnvelope::error(
                    request_id,
                    ResponseStatus::InternalError,
                    format!("response of {size} bytes exceeds max frame size {max}"),
                );
                write_frame(writer, &encode_envelope(&fallback, wire)?, max).await
            }
            other => other,
        }
    }

    async fn handle_frame(&self, frame: Bytes, requests: u64) -> (ResponseEnvelope, WireFormat) {
        let started = Instant::now();
        let (request, wire) = match detect_request(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                let (request_id, wire) =
                    peek_request_id(&frame).unwrap_or((0, WireFormat::preferred()));
                tracing::warn!(request_id, "malformed request: {}", e);
                let response = ResponseEnvelope::error(
                    request_id,
                    ResponseStatus::InvalidInput,
                    format!("malformed request: {e}"),
                );
                return (response, wire);
            }
        };
        let decode_us = micros(started.elapsed());

        let Some(op) = Operation::parse(&request.entry) else {
            tracing::debug!(request_id = request.request_id, entry = %request.entry, "unknown entry");
            let response = ResponseEnvelope::error(
                request.request_id,
                ResponseStatus::InvalidInput,
                format!("Unknown entry '{}'", request.entry),
            );
            return (response, wire);
        };

        let request_id = request.request_id;
        let payload_bytes = request.payload.len();
        let ctx = OpContext {
            requests,
            pid: std::process::id(),
        };

        let exec_started = Instant::now();
        let result = run_blocking(move || execute(op, &ctx, &request)).await;
        let exec_us = micros(exec_started.elapsed());

        let response = match result {
            Ok(output) => ResponseEnvelope::ok(request_id, output.codec, output.payload),
            Err(err) => {
                tracing::debug!(request_id, op = %op, status = %err.status, "operation failed: {}", err.message);
                ResponseEnvelope::error(request_id, err.status, err.message)
            }
        };

        let mut metrics = Metrics::new();
        metrics.insert("decode_us".to_string(), decode_us);
        metrics.insert("exec_us".to_string(), exec_us);
        metrics.insert("payload_bytes".to_string(), payload_bytes as f64);
        (response.with_metrics(metrics), wire)
    }
}

/// Run a handler on the blocking pool; a panic becomes `InternalError`.
async fn run_blocking<F>(handler: F) -> std::result::Result<OpOutput, ExecError>
where
    F: FnOnce() -> std::result::Result<OpOutput, ExecError> + Send + 'static,
{
    match tokio::task::spawn_blocking(handler).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(ExecError::internal("operation panicked")),
        Err(e) => Err(ExecError::internal(format!("operation did not complete: {e}"))),
    }
}

fn micros(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1_000_000.0
}
