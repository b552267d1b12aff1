//! Host adapter: turn an application request into an offloaded call and the
//! outcome into an application response.
//!
//! An [`OffloadHandler`] builds a payload from the request, sends it to an
//! [`Offload`] target (a single [`WorkerClient`] or a [`ClientPool`]) and
//! hands the decoded result to a response factory with status 200. Failures
//! become `{"error": <kind>, "detail": <message>}` with the status from
//! [`status_for_error`], or run the local fallback when one is configured.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};

use crate::client::{CallOptions, OffloadResponse, WorkerClient, DEFAULT_CALL_TIMEOUT};
use crate::codec::{encode_payload, PayloadCodec};
use crate::error::{OffloadError, Result};
use crate::pool::ClientPool;

/// Anything that can carry an offloaded call.
pub trait Offload: Send + Sync {
    fn call_bytes(
        &self,
        entry: &str,
        payload: Bytes,
        options: &CallOptions,
    ) -> impl Future<Output = Result<OffloadResponse>> + Send;
}

impl Offload for WorkerClient {
    fn call_bytes(
        &self,
        entry: &str,
        payload: Bytes,
        options: &CallOptions,
    ) -> impl Future<Output = Result<OffloadResponse>> + Send {
        WorkerClient::call_bytes(self, entry, payload, options)
    }
}

impl Offload for ClientPool {
    fn call_bytes(
        &self,
        entry: &str,
        payload: Bytes,
        options: &CallOptions,
    ) -> impl Future<Output = Result<OffloadResponse>> + Send {
        ClientPool::call_bytes(self, entry, payload, options)
    }
}

/// HTTP-style status for a failed call.
pub fn status_for_error(error: &OffloadError) -> u16 {
    match error {
        OffloadError::InvalidInput(_) => 400,
        OffloadError::Timeout => 504,
        OffloadError::WorkerUnavailable(_) | OffloadError::WorkerCrashed(_) => 503,
        OffloadError::Cancelled => 499,
        _ => 500,
    }
}

/// Body sent back for a failed call.
pub fn error_body(error: &OffloadError) -> Value {
    json!({
        "error": error.kind(),
        "detail": error.to_string(),
    })
}

/// Default response type: a status and a JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct OffloadReply {
    pub status: u16,
    pub body: Value,
}

impl OffloadReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

type PayloadBuilder<Req> = Box<dyn Fn(&Req) -> Result<Value> + Send + Sync>;
type ResponseFactory<Resp> = Box<dyn Fn(Value, u16) -> Resp + Send + Sync>;
type Fallback<Req, Resp> = Box<dyn Fn(&Req) -> Resp + Send + Sync>;

/// Offloads one entry on behalf of an application handler.
pub struct OffloadHandler<Req, Resp = OffloadReply> {
    entry: String,
    codec: PayloadCodec,
    timeout: Duration,
    payload_builder: PayloadBuilder<Req>,
    response_factory: ResponseFactory<Resp>,
    fallback: Option<Fallback<Req, Resp>>,
}

impl<Req> OffloadHandler<Req, OffloadReply> {
    /// Handler for `entry` that replies with [`OffloadReply`].
    ///
    /// Defaults: preferred codec, 250 ms timeout, no fallback.
    pub fn new<F>(entry: impl Into<String>, payload_builder: F) -> Self
    where
        F: Fn(&Req) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            entry: entry.into(),
            codec: PayloadCodec::preferred(),
            timeout: DEFAULT_CALL_TIMEOUT,
            payload_builder: Box::new(payload_builder),
            response_factory: Box::new(|body, status| OffloadReply { status, body }),
            fallback: None,
        }
    }
}

impl<Req, Resp> OffloadHandler<Req, Resp> {
    /// Replace the response factory. Drops any fallback, whose type
    /// depended on the old response type.
    pub fn response_factory<R2, F>(self, factory: F) -> OffloadHandler<Req, R2>
    where
        F: Fn(Value, u16) -> R2 + Send + Sync + 'static,
    {
        OffloadHandler {
            entry: self.entry,
            codec: self.codec,
            timeout: self.timeout,
            payload_builder: self.payload_builder,
            response_factory: Box::new(factory),
            fallback: None,
        }
    }

    pub fn codec(mut self, codec: PayloadCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `fallback` locally instead of returning an error response.
    pub fn fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&Req) -> Resp + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(fallback));
        self
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn allows_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Offload `request` to `target` and build the response.
    pub async fn handle<T: Offload>(&self, target: &T, request: &Req) -> Resp {
        match self.offload(target, request).await {
            Ok(value) => (self.response_factory)(value, 200),
            Err(err) => {
                if let Some(fallback) = &self.fallback {
                    tracing::debug!(entry = %self.entry, "offload failed ({}), running fallback", err);
                    return fallback(request);
                }
                (self.response_factory)(error_body(&err), status_for_error(&err))
            }
        }
    }

    async fn offload<T: Offload>(&self, target: &T, request: &Req) -> Result<Value> {
        let payload = (self.payload_builder)(request)?;
        let bytes = encode_payload(&payload, self.codec)?;
        let options = CallOptions::new().codec(self.codec).timeout(self.timeout);
        let response = target
            .call_bytes(&self.entry, Bytes::from(bytes), &options)
            .await?;
        response.decode()
    }
}

impl<Req, Resp> std::fmt::Debug for OffloadHandler<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadHandler")
            .field("entry", &self.entry)
            .field("codec", &self.codec)
            .field("timeout", &self.timeout)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientBuilder;
    use crate::codec::WireFormat;
    use crate::worker::{WorkerConfig, WorkerLoop};
    use tokio::io::duplex;

    fn loopback_client() -> WorkerClient {
        let (client_io, worker_io) = duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_io);
        tokio::spawn(async move {
            let _ = WorkerLoop::new(WorkerConfig::default())
                .run(worker_read, worker_write)
                .await;
        });
        let (read, write) = tokio::io::split(client_io);
        ClientBuilder::new()
            .wire(WireFormat::Json)
            .connect(read, write)
            .unwrap()
    }

    fn echo_handler(entry: &str) -> OffloadHandler<Value> {
        OffloadHandler::new(entry, |req: &Value| Ok(req.clone())).codec(PayloadCodec::Json)
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for_error(&OffloadError::InvalidInput("x".into())), 400);
        assert_eq!(status_for_error(&OffloadError::Timeout), 504);
        assert_eq!(status_for_error(&OffloadError::WorkerUnavailable("x".into())), 503);
        assert_eq!(status_for_error(&OffloadError::WorkerCrashed("x".into())), 503);
        assert_eq!(status_for_error(&OffloadError::Cancelled), 499);
        assert_eq!(status_for_error(&OffloadError::InternalError("x".into())), 500);
        assert_eq!(status_for_error(&OffloadError::ClientClosed), 500);
    }

    #[test]
    fn test_error_body_shape() {
        let body = error_body(&OffloadError::InvalidInput("Unknown entry 'x'".into()));
        assert_eq!(
            body,
            json!({"error": "InvalidInput", "detail": "Invalid input: Unknown entry 'x'"})
        );
    }

    #[tokio::test]
    async fn test_success_is_200() {
        let client = loopback_client();
        let handler = echo_handler("echo");

        let reply = handler.handle(&client, &json!({"a": 1})).await;
        assert_eq!(reply, OffloadReply { status: 200, body: json!({"a": 1}) });
        assert!(reply.is_success());
    }

    #[tokio::test]
    async fn test_unknown_entry_is_400() {
        let client = loopback_client();
        let reply = echo_handler("nope").handle(&client, &json!({})).await;
        assert_eq!(reply.status, 400);
        assert_eq!(reply.body["error"], "InvalidInput");
    }

    #[tokio::test]
    async fn test_timeout_is_504() {
        let client = loopback_client();
        let handler = echo_handler("__sleep__").timeout(Duration::from_millis(20));
        let reply = handler.handle(&client, &json!({"ms": 300})).await;
        assert_eq!(reply.status, 504);
        assert_eq!(reply.body["error"], "Timeout");
    }

    #[tokio::test]
    async fn test_payload_builder_error_maps_to_status() {
        let client = loopback_client();
        let handler: OffloadHandler<Value> = OffloadHandler::new("echo", |_: &Value| {
            Err(OffloadError::InvalidInput("missing user_id".into()))
        });
        let reply = handler.handle(&client, &json!({})).await;
        assert_eq!(reply.status, 400);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_fallback_runs_on_failure() {
        let client = loopback_client();
        client.close().await;

        let handler = echo_handler("echo").fallback(|req: &Value| OffloadReply {
            status: 200,
            body: json!({"local": req.clone()}),
        });
        assert!(handler.allows_fallback());

        let reply = handler.handle(&client, &json!({"a": 1})).await;
        assert_eq!(reply.body, json!({"local": {"a": 1}}));
    }

    #[tokio::test]
    async fn test_custom_response_factory_and_pool_target() {
        let pool = ClientPool::from_clients(vec![loopback_client(), loopback_client()]).unwrap();
        let handler = echo_handler("echo")
            .response_factory(|body: Value, status: u16| format!("{status} {body}"));

        let first = handler.handle(&pool, &json!({"n": 1})).await;
        let second = handler.handle(&pool, &json!({"n": 2})).await;
        assert_eq!(first, r#"200 {"n":1}"#);
        assert_eq!(second, r#"200 {"n":2}"#);
    }
}
