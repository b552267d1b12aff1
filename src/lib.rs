//! # pipe-offload
//!
//! Offload CPU-bound work from an async host to sidecar worker processes.
//!
//! The host talks to each worker over its stdin/stdout using
//! length-prefixed frames. Every frame carries one request or response
//! envelope, correlated by a request id, so many calls can be in flight on
//! one worker at a time.
//!
//! ## Architecture
//!
//! - **Frames** ([`protocol`]): `u32` little-endian length followed by the
//!   envelope bytes, with a size cap checked on both sides.
//! - **Envelopes** ([`codec`]): JSON (base64 payload) or MessagePack (binary
//!   payload), with an inner payload codec per call.
//! - **Client** ([`client`]): spawns a worker, routes responses to waiting
//!   callers, enforces timeouts and cancellation.
//! - **Pool** ([`pool`]): round robin across several clients.
//! - **Worker** ([`worker`]): the dispatch loop run by the
//!   `pipe-offload-worker` binary.
//! - **Adapter** ([`adapter`]): maps call outcomes to application responses.
//!
//! ## Example
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

pub mod adapter;
pub mod client;
pub mod codec;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use adapter::{Offload, OffloadHandler, OffloadReply};
pub use client::{
    CallOptions, ClientBuilder, ClientState, OffloadResponse, RequestMeta, ResponseMeta,
    WorkerClient,
};
pub use codec::{PayloadCodec, WireFormat};
pub use error::{OffloadError, Result};
pub use pool::ClientPool;
pub use transport::WorkerCommand;
