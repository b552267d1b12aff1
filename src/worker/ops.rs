//! The worker's operation table.
//!
//! Entries are a closed set: [`Operation::parse`] maps a wire entry name to
//! an operation or returns `None`, which the loop answers with
//! `InvalidInput`.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{decode_payload, encode_payload, PayloadCodec};
use crate::protocol::{RequestEnvelope, ResponseStatus};

/// Upper bound for `__sleep__`.
pub const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Default and maximum page size for `list_items`.
const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;

/// Operations the worker can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `__ping__`: empty raw reply.
    Ping,
    /// `echo`: payload returned unchanged in the same codec.
    Echo,
    /// `list_items`: deterministic page of items for a user.
    ListItems,
    /// `__error__`: always fails with `InternalError("boom")`.
    Error,
    /// `__stats__`: request count and process id.
    Stats,
    /// `__sleep__`: sleeps for `{ms}` then echoes the payload.
    Sleep,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Ping,
        Operation::Echo,
        Operation::ListItems,
        Operation::Error,
        Operation::Stats,
        Operation::Sleep,
    ];

    /// Look up an entry name.
    pub fn parse(entry: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == entry)
    }

    /// Entry name on the wire.
    pub const fn name(self) -> &'static str {
        match self {
            Operation::Ping => "__ping__",
            Operation::Echo => "echo",
            Operation::ListItems => "list_items",
            Operation::Error => "__error__",
            Operation::Stats => "__stats__",
            Operation::Sleep => "__sleep__",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed operation, reported to the client as a non-Ok status.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecError {
    pub status: ResponseStatus,
    pub message: String,
}

impl ExecError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::InvalidInput,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::InternalError,
            message: message.into(),
        }
    }
}

/// Successful operation result.
#[derive(Debug, Clone, PartialEq)]
pub struct OpOutput {
    pub codec: PayloadCodec,
    pub payload: Bytes,
}

/// Worker facts visible to operations.
#[derive(Debug, Clone, Copy)]
pub struct OpContext {
    /// Frames received so far, including the current one.
    pub requests: u64,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItemsRequest {
    pub user_id: i64,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRow {
    pub id: i64,
    pub created_at: String,
    pub status: String,
    pub title: String,
    pub score: f64,
    pub unread: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub open: u32,
    pub closed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItemsResponse {
    pub items: Vec<ItemRow>,
    pub next_cursor: Option<String>,
    pub counts: StatusCounts,
    /// The decoded request, echoed back.
    pub request: ListItemsRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub requests: u64,
    pub pid: u32,
}

#[derive(Debug, Deserialize)]
struct SleepRequest {
    ms: u64,
}

/// Execute an operation. Blocking; run it off the async reactor.
pub fn execute(
    op: Operation,
    ctx: &OpContext,
    request: &RequestEnvelope,
) -> Result<OpOutput, ExecError> {
    match op {
        Operation::Ping => Ok(OpOutput {
            codec: PayloadCodec::Raw,
            payload: Bytes::new(),
        }),
        Operation::Echo => Ok(echo(request)),
        Operation::ListItems => {
            let args: ListItemsRequest = decode_args(op, request)?;
            let response = list_items(args);
            encode_reply(&response, structured_codec(request.codec))
        }
        Operation::Error => Err(ExecError::internal("boom")),
        Operation::Stats => encode_reply(
            &StatsResponse {
                requests: ctx.requests,
                pid: ctx.pid,
            },
            structured_codec(request.codec),
        ),
        Operation::Sleep => {
            let args: SleepRequest = decode_args(op, request)?;
            std::thread::sleep(Duration::from_millis(args.ms).min(MAX_SLEEP));
            Ok(echo(request))
        }
    }
}

fn echo(request: &RequestEnvelope) -> OpOutput {
    OpOutput {
        codec: request.codec,
        payload: request.payload.clone(),
    }
}

/// Codec for structured replies: the request's codec unless it only
/// carries opaque bytes.
fn structured_codec(codec: PayloadCodec) -> PayloadCodec {
    if codec.is_binary_passthrough() {
        PayloadCodec::Json
    } else {
        codec
    }
}

fn decode_args<T: serde::de::DeserializeOwned>(
    op: Operation,
    request: &RequestEnvelope,
) -> Result<T, ExecError> {
    decode_payload(&request.payload, request.codec)
        .map_err(|e| ExecError::invalid_input(format!("invalid {op} payload: {e}")))
}

fn encode_reply<T: Serialize>(value: &T, codec: PayloadCodec) -> Result<OpOutput, ExecError> {
    let payload = encode_payload(value, codec).map_err(|e| ExecError::internal(e.to_string()))?;
    Ok(OpOutput {
        codec,
        payload: Bytes::from(payload),
    })
}

/// Build a deterministic page of items from the request fields.
pub fn list_items(request: ListItemsRequest) -> ListItemsResponse {
    let limit = request.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT) as usize;
    let text_len = |s: &Option<String>| s.as_ref().map_or(0, |s| s.len()) as i64;
    let base = request.user_id.saturating_abs().saturating_mul(1000)
        + text_len(&request.q)
        + text_len(&request.status)
        + text_len(&request.cursor);

    let mut counts = StatusCounts { open: 0, closed: 0 };
    let items: Vec<ItemRow> = (0..limit)
        .map(|idx| {
            let id = base.saturating_add(idx as i64);
            let is_open = idx % 2 == 0;
            if is_open {
                counts.open += 1;
            } else {
                counts.closed += 1;
            }
            ItemRow {
                id,
                created_at: format!("2026-01-{:02}T00:00:{:02}Z", (idx % 28) + 1, idx % 60),
                status: if is_open { "open" } else { "closed" }.to_string(),
                title: format!("Item {id}"),
                score: (idx % 100) as f64 / 100.0,
                unread: idx % 3 == 0,
            }
        })
        .collect();

    let next_cursor = (limit > 0 && items.len() == limit)
        .then(|| format!("{}:{}", request.user_id, limit));

    ListItemsResponse {
        items,
        next_cursor,
        counts,
        request,
    }
}
