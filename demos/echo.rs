//! Echo demo - offload a few calls to a worker process.
//!
//! This demo shows:
//! - Building a client from `PIPE_OFFLOAD_*` environment variables
//! - Structured calls with a chosen payload codec
//! - Concurrent calls on one client and a small pool
//!
//! # Running
//!
//! ```text
//! cargo build --bin pipe-offload-worker
//! PIPE_OFFLOAD_WORKER_CMD=target/debug/pipe-offload-worker cargo run --example echo
//! ```

use pipe_offload::worker::{ListItemsResponse, StatsResponse};
use pipe_offload::{CallOptions, ClientBuilder, ClientPool, PayloadCodec};
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let builder = ClientBuilder::from_env()?;
    let client = builder.clone().build()?;

    let rtt = client.ping(std::time::Duration::from_secs(2)).await?;
    println!("ping: {:?} (pid {:?})", rtt, client.pid());

    let options = CallOptions::new().codec(PayloadCodec::preferred());
    let reply: Value = client
        .call("echo", &json!({"nested": {"b": [1, 2, 3]}}), &options)
        .await?;
    println!("echo: {reply}");

    let page: ListItemsResponse = client
        .call("list_items", &json!({"user_id": 7, "limit": 5}), &options)
        .await?;
    println!(
        "list_items: {} items, next cursor {:?}",
        page.items.len(),
        page.next_cursor
    );

    let inputs = [json!({"n": 1}), json!({"n": 2}), json!({"n": 3})];
    let (a, b, c) = tokio::join!(
        client.call::<_, Value>("echo", &inputs[0], &options),
        client.call::<_, Value>("echo", &inputs[1], &options),
        client.call::<_, Value>("echo", &inputs[2], &options),
    );
    println!("concurrent: {} {} {}", a?, b?, c?);
    client.close().await;

    let pool = ClientPool::new(2, builder)?;
    for _ in 0..4 {
        let stats: StatsResponse = pool.call("__stats__", &(), &options).await?;
        println!("pool: worker {} has seen {} requests", stats.pid, stats.requests);
    }
    pool.close().await;

    Ok(())
}
