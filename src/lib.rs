//! Bidirectional MessagePack-RPC over a byte stream.
//!
//! Either side of a connection can issue calls, send notifications, and
//! serve handlers; "client" and "server" only describe who dialed.
//! Messages are MessagePack arrays with no length prefix, so the stream
//! framing comes entirely from the encoding itself.
//!
//! The crate is layered bottom-up:
//!
//! - [`message`]: the three wire message shapes and their encoding;
//! - [`codec`]: a streaming decoder that turns partial reads into
//!   complete messages;
//! - [`registry`]: named call and notification handlers;
//! - [`endpoint`]: one connection's read loop, dispatch, and concurrent
//!   call correlation with per-call timeouts;
//! - [`client`]: a reconnecting supervisor that keeps one endpoint
//!   attached to a remote address.
//!
//! # Quick start
//!
//! Serving side, one endpoint per accepted connection:
//!
//! ```ignore
//! use std::sync::Arc;
//! use crosscall::{Endpoint, EndpointConfig, ServiceRegistry, Value};
//!
//! let mut registry = ServiceRegistry::new();
//! registry.register_call("echo", |params: &[Value]| Ok(params[0].clone()));
//! let registry = Arc::new(registry);
//!
//! let (stream, peer) = listener.accept().await?;
//! let (reader, writer) = stream.into_split();
//! let config = EndpointConfig {
//!     peer: peer.to_string(),
//!     ..EndpointConfig::default()
//! };
//! let ep = Arc::new(Endpoint::new(reader, writer, registry.clone(), config));
//! tokio::spawn({
//!     let ep = ep.clone();
//!     async move {
//!         let _ = ep.serve().await;
//!     }
//! });
//! ```
//!
//! Dialing side, with automatic reconnection:
//!
//! ```ignore
//! use crosscall::{Client, Value};
//!
//! let client = Client::builder("127.0.0.1:11000")
//!     .handle_call("echo", |params: &[Value]| Ok(params[0].clone()))
//!     .start()
//!     .await;
//! let reply = client.call("echo", vec![Value::from("hi")]).await?;
//! ```

pub mod client;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod registry;

pub use client::{Client, ClientBuilder};
pub use codec::MessageDecoder;
pub use endpoint::{Endpoint, EndpointConfig, Mode, TcpEndpoint};
pub use error::{CrosscallError, Result};
pub use message::Message;
pub use registry::{CallHandler, NotifyHandler, ServiceRegistry};

/// Dynamic MessagePack value, re-exported so handler code does not need
/// its own `rmpv` dependency.
pub use rmpv::Value;
