//! Integration tests for pipe-offload.
//!
//! These tests run real `pipe-offload-worker` processes and drive them
//! through the public client, pool and adapter APIs.

use std::sync::Arc;
use std::time::Duration;

use pipe_offload::worker::{ListItemsResponse, StatsResponse};
use pipe_offload::{
    CallOptions, ClientBuilder, ClientPool, ClientState, OffloadError, OffloadHandler,
    PayloadCodec, WireFormat, WorkerClient, WorkerCommand,
};
use serde_json::{json, Value};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

fn worker_command() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_pipe-offload-worker"))
}

fn builder(wire: WireFormat) -> ClientBuilder {
    ClientBuilder::new().command(worker_command()).wire(wire)
}

fn client(wire: WireFormat) -> WorkerClient {
    builder(wire).build().unwrap()
}

fn options(codec: PayloadCodec) -> CallOptions {
    CallOptions::new().codec(codec).timeout(CALL_TIMEOUT)
}

fn sample_payloads() -> Vec<Value> {
    vec![
        json!({}),
        json!({"a": 1}),
        json!({"nested": {"b": [1, 2, 3]}}),
    ]
}

/// Test echo over every compiled wire format and structured codec.
#[tokio::test]
async fn test_echo_all_wires_and_codecs() {
    for wire in WireFormat::available() {
        let client = client(wire);
        for codec in [PayloadCodec::Json, PayloadCodec::preferred()] {
            for payload in sample_payloads() {
                let reply: Value = client.call("echo", &payload, &options(codec)).await.unwrap();
                assert_eq!(reply, payload, "wire {wire}, codec {codec}");
            }
        }
        assert!(client.pid().is_some());
        client.close().await;
    }
}

/// Test raw bytes pass through the worker untouched.
#[tokio::test]
async fn test_echo_raw_bytes() {
    let client = client(WireFormat::Json);
    let payload = bytes::Bytes::from_static(&[0x00, 0xFF, 0x10]);
    let response = client
        .call_bytes("echo", payload.clone(), &options(PayloadCodec::Raw))
        .await
        .unwrap();
    assert_eq!(response.codec, "raw");
    assert_eq!(response.payload, payload);
    assert!(response.metrics.contains_key("client_ms"));
    assert!(response.metrics.contains_key("exec_us"));
    client.close().await;
}

/// Test structured entry with a typed response.
#[tokio::test]
async fn test_list_items() {
    let client = client(WireFormat::preferred());
    let page: ListItemsResponse = client
        .call(
            "list_items",
            &json!({"user_id": 3, "limit": 4, "q": "abc"}),
            &options(PayloadCodec::preferred()),
        )
        .await
        .unwrap();
    assert_eq!(page.items.len(), 4);
    assert_eq!(page.items[0].id, 3003);
    assert_eq!(page.next_cursor.as_deref(), Some("3:4"));
    client.close().await;
}

/// Test unknown entries are rejected without killing the worker.
#[tokio::test]
async fn test_unknown_entry() {
    let client = client(WireFormat::Json);
    let err = client
        .call::<_, Value>("does_not_exist", &json!({}), &options(PayloadCodec::Json))
        .await
        .unwrap_err();
    match err {
        OffloadError::InvalidInput(msg) => assert!(msg.contains("does_not_exist")),
        other => panic!("expected InvalidInput, got {other:?}"),
    }

    let err = client
        .call::<_, Value>("__error__", &json!({}), &options(PayloadCodec::Json))
        .await
        .unwrap_err();
    assert!(matches!(err, OffloadError::InternalError(_)));

    client.ping(CALL_TIMEOUT).await.unwrap();
    client.close().await;
}

/// Test a call cancelled before sending never reaches the worker.
#[tokio::test]
async fn test_cancel_before_send() {
    let client = client(WireFormat::Json);
    let cancelled = options(PayloadCodec::Json).cancel_check(|| true);
    let err = client
        .call::<_, Value>("echo", &json!({"a": 1}), &cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, OffloadError::Cancelled));

    let stats: StatsResponse = client
        .call("__stats__", &(), &options(PayloadCodec::Json))
        .await
        .unwrap();
    assert_eq!(stats.requests, 1);
    assert_eq!(Some(stats.pid), client.pid());
    client.close().await;
}

/// Test concurrent callers on one client get their own responses.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_one_client() {
    let client = Arc::new(client(WireFormat::preferred()));

    let mut handles = Vec::new();
    for task in 0..8 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            let mut replies = Vec::new();
            for n in 0..10 {
                let payload = json!({"task": task, "n": n});
                let reply: Value = client
                    .call("echo", &payload, &options(PayloadCodec::preferred()))
                    .await
                    .unwrap();
                assert_eq!(reply, payload);
                replies.push(reply);
            }
            replies.len()
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), 10);
    }
    assert_eq!(client.pending_calls(), 0);
    client.close().await;
}

/// Test the pool alternates between distinct worker processes.
#[tokio::test]
async fn test_pool_round_robin() {
    let pool = ClientPool::new(2, builder(WireFormat::Json)).unwrap();

    let mut pids = Vec::new();
    for _ in 0..4 {
        let stats: StatsResponse = pool
            .call("__stats__", &(), &options(PayloadCodec::Json))
            .await
            .unwrap();
        pids.push(stats.pid);
    }
    assert_ne!(pids[0], pids[1]);
    assert_eq!(pids[0], pids[2]);
    assert_eq!(pids[1], pids[3]);
    pool.close().await;
}

/// Test a timed out call does not disturb the next one.
#[tokio::test]
async fn test_timeout_isolation() {
    let client = client(WireFormat::Json);
    let short = CallOptions::new()
        .codec(PayloadCodec::Json)
        .timeout(Duration::from_millis(50));
    let err = client
        .call::<_, Value>("__sleep__", &json!({"ms": 300}), &short)
        .await
        .unwrap_err();
    assert!(matches!(err, OffloadError::Timeout));
    assert_eq!(client.pending_calls(), 0);

    // The late sleep response arrives first and is dropped.
    let reply: Value = client
        .call("echo", &json!({"after": true}), &options(PayloadCodec::Json))
        .await
        .unwrap();
    assert_eq!(reply, json!({"after": true}));
    assert_eq!(client.state(), ClientState::Running);
    client.close().await;
}

#[cfg(unix)]
async fn kill_worker(client: &WorkerClient) {
    let pid = client.pid().unwrap();
    let status = tokio::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .await
        .unwrap();
    assert!(status.success());

    let deadline = tokio::time::Instant::now() + CALL_TIMEOUT;
    while client.state() != ClientState::Crashed {
        assert!(tokio::time::Instant::now() < deadline, "crash not detected");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Test a killed worker fails non-idempotent calls.
#[cfg(unix)]
#[tokio::test]
async fn test_crash_without_retry() {
    let client = client(WireFormat::Json);
    client.ping(CALL_TIMEOUT).await.unwrap();
    kill_worker(&client).await;

    let err = client
        .call::<_, Value>("echo", &json!({}), &options(PayloadCodec::Json))
        .await
        .unwrap_err();
    assert!(matches!(err, OffloadError::WorkerCrashed(_)));

    client.restart().await.unwrap();
    client.ping(CALL_TIMEOUT).await.unwrap();
    assert_eq!(client.state(), ClientState::Running);
    client.close().await;
}

/// Test idempotent calls transparently restart a killed worker.
#[cfg(unix)]
#[tokio::test]
async fn test_crash_with_idempotent_retry() {
    let client = client(WireFormat::Json);
    client.ping(CALL_TIMEOUT).await.unwrap();
    let first_pid = client.pid().unwrap();
    kill_worker(&client).await;

    let reply: Value = client
        .call(
            "echo",
            &json!({"again": 1}),
            &options(PayloadCodec::Json).idempotent(true),
        )
        .await
        .unwrap();
    assert_eq!(reply, json!({"again": 1}));
    assert_ne!(client.pid(), Some(first_pid));
    client.close().await;
}

/// Test close fails further calls and is idempotent.
#[tokio::test]
async fn test_close() {
    let client = client(WireFormat::Json);
    client.ping(CALL_TIMEOUT).await.unwrap();
    client.close().await;
    client.close().await;

    assert_eq!(client.state(), ClientState::Closed);
    assert_eq!(client.pid(), None);
    let err = client.ping(CALL_TIMEOUT).await.unwrap_err();
    assert!(matches!(err, OffloadError::ClientClosed));
}

/// Test a missing worker binary surfaces as unavailable.
#[tokio::test]
async fn test_missing_worker_binary() {
    let client = ClientBuilder::new()
        .command(WorkerCommand::new("/nonexistent/pipe-offload-worker"))
        .build()
        .unwrap();
    let err = client.ping(CALL_TIMEOUT).await.unwrap_err();
    assert!(matches!(err, OffloadError::WorkerUnavailable(_)));

    let handler: OffloadHandler<Value> = OffloadHandler::new("echo", |req: &Value| Ok(req.clone()));
    let reply = handler.handle(&client, &json!({})).await;
    assert_eq!(reply.status, 503);
    assert_eq!(reply.body["error"], "WorkerUnavailable");
}

/// Test the adapter against a pool of real workers.
#[tokio::test]
async fn test_adapter_with_pool() {
    let pool = ClientPool::new(2, builder(WireFormat::preferred())).unwrap();
    let handler: OffloadHandler<i64> =
        OffloadHandler::new("list_items", |user_id: &i64| Ok(json!({"user_id": user_id, "limit": 2})))
            .timeout(CALL_TIMEOUT);

    let reply = handler.handle(&pool, &5).await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body["items"].as_array().unwrap().len(), 2);
    assert_eq!(reply.body["request"]["user_id"], 5);

    let failing: OffloadHandler<i64> =
        OffloadHandler::new("__error__", |_: &i64| Ok(json!({}))).timeout(CALL_TIMEOUT);
    let reply = failing.handle(&pool, &5).await;
    assert_eq!(reply.status, 500);
    assert_eq!(reply.body["error"], "InternalError");
    pool.close().await;
}
