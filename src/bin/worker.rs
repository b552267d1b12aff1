//! Worker process: serve offload requests on stdin/stdout until the parent
//! closes the pipe.
//!
//! Stdout carries frames only; diagnostics go to stderr. Log filtering is
//! read from `PIPE_OFFLOAD_LOG`, then `RUST_LOG`, defaulting to `warn`.

use std::process::ExitCode;

use pipe_offload::worker::{WorkerConfig, WorkerLoop};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const ENV_LOG: &str = "PIPE_OFFLOAD_LOG";

fn init_logging() {
    let filter = EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid worker configuration: {}", e);
            return ExitCode::from(2);
        }
    };

    tracing::debug!(pid = std::process::id(), ?config, "worker starting");
    let worker = WorkerLoop::new(config);
    match worker.run(tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(()) => {
            tracing::debug!(requests = worker.requests_received(), "worker exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("worker loop failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
