//! Demo worker for hotswap
//!
//! A minimal service to run under the process backend: listens on `$PORT` and
//! answers every request with `<reply> <path>`. Exits cleanly on SIGTERM.
//!
//! `hotswap-demo-worker --reply v2 --latency-ms 200`

use axum::{Router, extract::State, http::Uri};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "hotswap-demo-worker")]
#[command(about = "Demo worker for the hotswap process backend")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "6060")]
    port: u16,

    /// Text every response starts with
    #[arg(short, long, default_value = "hello")]
    reply: String,

    /// Artificial latency for responses (ms)
    #[arg(long, default_value = "0")]
    latency_ms: u64,

    /// Artificial startup delay (ms)
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,
}

#[derive(Debug)]
struct DemoState {
    reply: String,
    latency: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("hotswap_demo_worker=debug,info")
        .init();

    let args = Args::parse();

    if args.startup_delay_ms > 0 {
        info!(delay_ms = args.startup_delay_ms, "Simulating startup delay");
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    let state = Arc::new(DemoState {
        reply: args.reply,
        latency: Duration::from_millis(args.latency_ms),
    });
    let app = Router::new().fallback(respond).with_state(state);

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    info!(port = args.port, "Demo worker listening");

    let mut terminate = signal(SignalKind::terminate())?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            terminate.recv().await;
            info!("Received SIGTERM");
        })
        .await?;
    Ok(())
}

async fn respond(State(state): State<Arc<DemoState>>, uri: Uri) -> String {
    if !state.latency.is_zero() {
        tokio::time::sleep(state.latency).await;
    }
    format!("{} {}\n", state.reply, uri.path())
}
