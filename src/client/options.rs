//! Per-call options, hook metadata, and undecoded responses.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::codec::{decode_payload_named, PayloadCodec};
use crate::error::Result;
use crate::protocol::{Metrics, ResponseStatus};

/// Default time a call waits for its response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(250);

/// How often `cancel_check` is polled while a call waits.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Hook invoked right before a request is written.
pub type BeforeSendHook = Arc<dyn Fn(&RequestMeta<'_>) + Send + Sync>;
/// Hook invoked for every delivered response.
pub type AfterRecvHook = Arc<dyn Fn(&ResponseMeta<'_>) + Send + Sync>;
/// Hook receiving worker metrics plus `client_ms`.
pub type MetricsHook = Arc<dyn Fn(&Metrics) + Send + Sync>;
/// Cooperative cancellation predicate.
pub type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Metadata passed to `before_send`.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    pub request_id: u64,
    pub entry: &'a str,
    pub codec: PayloadCodec,
    pub timeout: Option<Duration>,
    pub payload_bytes: usize,
}

/// Metadata passed to `after_recv`.
#[derive(Debug, Clone, Copy)]
pub struct ResponseMeta<'a> {
    pub request: RequestMeta<'a>,
    pub status: &'a ResponseStatus,
    /// Codec of the response payload as reported by the worker.
    pub codec: &'a str,
    /// Round trip measured by the client, in milliseconds.
    pub client_ms: f64,
    /// Worker metrics with `client_ms` added.
    pub metrics: &'a Metrics,
}

/// Options for a single call.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use pipe_offload::{CallOptions, PayloadCodec};
///
/// let options = CallOptions::new()
///     .codec(PayloadCodec::Json)
///     .timeout(Duration::from_secs(2))
///     .idempotent(true)
///     .metrics_hook(|metrics| {
///         let _ = metrics.get("client_ms");
///     });
/// assert_eq!(options.get_codec(), PayloadCodec::Json);
/// ```
#[derive(Clone)]
pub struct CallOptions {
    codec: PayloadCodec,
    timeout: Option<Duration>,
    idempotent: bool,
    before_send: Option<BeforeSendHook>,
    after_recv: Option<AfterRecvHook>,
    metrics_hook: Option<MetricsHook>,
    cancel_check: Option<CancelCheck>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self {
            codec: PayloadCodec::preferred(),
            timeout: Some(DEFAULT_CALL_TIMEOUT),
            idempotent: false,
            before_send: None,
            after_recv: None,
            metrics_hook: None,
            cancel_check: None,
        }
    }

    /// Payload codec for the request (and the default for the response).
    pub fn codec(mut self, codec: PayloadCodec) -> Self {
        self.codec = codec;
        self
    }

    /// How long to wait for the response.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wait for the response without a deadline.
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Mark the call safe to repeat on a fresh worker after a crash.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn before_send<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestMeta<'_>) + Send + Sync + 'static,
    {
        self.before_send = Some(Arc::new(hook));
        self
    }

    pub fn after_recv<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ResponseMeta<'_>) + Send + Sync + 'static,
    {
        self.after_recv = Some(Arc::new(hook));
        self
    }

    pub fn metrics_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Metrics) + Send + Sync + 'static,
    {
        self.metrics_hook = Some(Arc::new(hook));
        self
    }

    /// Predicate polled before sending and every [`CANCEL_POLL_INTERVAL`]
    /// while waiting. Returning true abandons the call with `Cancelled`.
    pub fn cancel_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.cancel_check = Some(Arc::new(check));
        self
    }

    pub fn get_codec(&self) -> PayloadCodec {
        self.codec
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel_check.as_ref().is_some_and(|check| check())
    }

    pub(crate) fn has_cancel_check(&self) -> bool {
        self.cancel_check.is_some()
    }

    pub(crate) fn notify_before_send(&self, meta: &RequestMeta<'_>) {
        if let Some(hook) = &self.before_send {
            hook(meta);
        }
    }

    pub(crate) fn notify_received(&self, meta: &ResponseMeta<'_>) {
        if let Some(hook) = &self.metrics_hook {
            hook(meta.metrics);
        }
        if let Some(hook) = &self.after_recv {
            hook(meta);
        }
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("codec", &self.codec)
            .field("timeout", &self.timeout)
            .field("idempotent", &self.idempotent)
            .field("before_send", &self.before_send.is_some())
            .field("after_recv", &self.after_recv.is_some())
            .field("metrics_hook", &self.metrics_hook.is_some())
            .field("cancel_check", &self.cancel_check.is_some())
            .finish()
    }
}

/// A successful response whose payload has not been decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct OffloadResponse {
    /// Codec name reported by the worker.
    pub codec: String,
    pub payload: Bytes,
    /// Worker metrics plus `client_ms`.
    pub metrics: Metrics,
}

impl OffloadResponse {
    /// Decode the payload with the codec the worker reported.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        decode_payload_named(&self.payload, &self.codec)
    }
}
