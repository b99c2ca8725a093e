//! Dialing side of the echo demo.
//!
//! Connects to the demo server with automatic reconnection, serves its
//! own `echo` so the server can call back, and issues an `echo` call
//! every couple of seconds. Kill and restart the server while this runs
//! to watch the client recover.

use std::time::Duration;

use crosscall::{Client, CrosscallError, Value};
use tracing::{info, warn};

const ADDR: &str = "127.0.0.1:11000";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let client = Client::builder(ADDR)
        .handle_call("echo", |params: &[Value]| {
            Ok(params.first().cloned().unwrap_or(Value::Nil))
        })
        .post_connect(|ep| async move {
            // Simple handshake: prove the wire works before going ready.
            ep.call("echo", vec![Value::from("hello")]).await.is_ok()
        })
        .start()
        .await;

    let mut n = 0u32;
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        n += 1;
        match client.call("echo", vec![Value::from(format!("client ping {}", n))]).await {
            Ok(reply) => info!(%reply, "server echoed"),
            Err(CrosscallError::NotConnected(addr)) => {
                info!(
                    addr = %addr,
                    failures = client.consecutive_connect_failures(),
                    "not connected yet"
                );
            }
            Err(e) => warn!(error = %e, "call failed"),
        }
    }
}
