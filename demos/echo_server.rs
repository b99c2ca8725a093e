//! Listening side of the echo demo.
//!
//! Accepts connections on 127.0.0.1:11000, serves `echo` and `sum`, and
//! every few seconds calls `echo` back into each connected peer to show
//! that calls flow both ways. Run `echo_client` against it.
//!
//! ```sh
//! cargo run --example echo_server
//! cargo run --example echo_client
//! ```

use std::sync::Arc;
use std::time::Duration;

use crosscall::{Endpoint, EndpointConfig, Mode, ServiceRegistry, Value};
use tokio::net::TcpListener;
use tracing::{info, warn};

const ADDR: &str = "127.0.0.1:11000";

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut registry = ServiceRegistry::new();
    registry.register_call("echo", |params: &[Value]| {
        Ok(params.first().cloned().unwrap_or(Value::Nil))
    });
    registry.register_call("sum", |params: &[Value]| {
        let mut total = 0i64;
        for p in params {
            total += p.as_i64().ok_or_else(|| format!("sum: not an integer: {}", p))?;
        }
        Ok(Value::from(total))
    });
    registry.register_notify("log", |params: &[Value]| {
        info!(?params, "peer says");
    });
    let registry = Arc::new(registry);

    let listener = TcpListener::bind(ADDR).await?;
    info!(addr = ADDR, "listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "accepted");

        let config = EndpointConfig {
            mode: Mode::BOTH,
            peer: peer.to_string(),
            ..EndpointConfig::default()
        };
        let (reader, writer) = stream.into_split();
        let ep = Arc::new(Endpoint::new(reader, writer, registry.clone(), config));

        // Read loop for this connection.
        let serve_ep = ep.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_ep.serve().await {
                warn!(%peer, error = %e, "connection failed");
            }
        });

        // Periodically call back into the peer while it is connected.
        tokio::spawn(async move {
            let mut n = 0u32;
            while ep.is_running() {
                tokio::time::sleep(Duration::from_secs(3)).await;
                n += 1;
                match ep.call("echo", vec![Value::from(format!("server ping {}", n))]).await {
                    Ok(reply) => info!(%peer, %reply, "peer echoed"),
                    Err(e) => warn!(%peer, error = %e, "call into peer failed"),
                }
            }
            info!(%peer, "connection ended");
        });
    }
}
