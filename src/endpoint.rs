//! RPC endpoint: one live connection's read loop and call surface.
//!
//! An [`Endpoint`] owns both halves of a connection. [`Endpoint::serve`]
//! runs the read loop: pull a chunk, feed the decoder, dispatch each
//! decoded message in stream order. Application tasks issue
//! [`Endpoint::call`] and [`Endpoint::notify`] concurrently; responses are
//! matched to waiting callers through the correlation table, not arrival
//! order, so a peer may answer out of order.
//!
//! Shared state rules: the correlation table lives behind a `std` mutex
//! held only for map operations, never across an await; the write half
//! lives behind a tokio mutex so each encoded message is one atomic write
//! and concurrent senders cannot interleave frames.
//!
//! A terminal read-loop error leaves in-flight calls to resolve via their
//! own timeout rather than failing them eagerly; their table entries are
//! removed by the timing-out callers. Known limitation: the error reaches
//! those callers only as a timeout, not as the underlying cause.

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::codec::MessageDecoder;
use crate::error::{CrosscallError, Result};
use crate::message::Message;
use crate::registry::ServiceRegistry;

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read chunk size (32 KiB).
pub const DEFAULT_READ_CHUNK_SIZE: usize = 32 * 1024;

/// Default bound on a single blocking read, so the read loop observes
/// `close()` promptly.
pub const DEFAULT_READ_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Capability flags selecting which message kinds an endpoint dispatches.
///
/// CLIENT endpoints accept responses, SERVER endpoints accept requests and
/// notifications, `CLIENT | SERVER` accepts all three on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode(u8);

impl Mode {
    /// Issues calls; dispatches incoming responses.
    pub const CLIENT: Mode = Mode(0b01);
    /// Serves calls; dispatches incoming requests and notifications.
    pub const SERVER: Mode = Mode(0b10);
    /// Both capabilities on the same connection.
    pub const BOTH: Mode = Mode(0b11);

    pub fn is_client(self) -> bool {
        self.0 & Mode::CLIENT.0 != 0
    }

    pub fn is_server(self) -> bool {
        self.0 & Mode::SERVER.0 != 0
    }
}

impl BitOr for Mode {
    type Output = Mode;

    fn bitor(self, rhs: Mode) -> Mode {
        Mode(self.0 | rhs.0)
    }
}

impl fmt::Display for Mode {
    /// Capability names, for log and error text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_client(), self.is_server()) {
            (true, true) => f.write_str("client|server"),
            (true, false) => f.write_str("client"),
            (false, true) => f.write_str("server"),
            (false, false) => f.write_str("none"),
        }
    }
}

/// Configuration accepted by an endpoint at construction.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Which message kinds this endpoint dispatches.
    pub mode: Mode,
    /// How long a `call` waits for its response.
    pub call_timeout: Duration,
    /// Size of the read loop's receive buffer.
    pub read_chunk_size: usize,
    /// Bound on a single read; a timeout is a retry, not an error.
    pub read_poll_timeout: Duration,
    /// Peer label used in log lines, typically the remote address.
    pub peer: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            mode: Mode::BOTH,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            read_poll_timeout: DEFAULT_READ_POLL_TIMEOUT,
            peer: "unknown".to_string(),
        }
    }
}

/// The waiter side of one in-flight call. Fired exactly once by the read
/// loop when the matching response arrives.
type PendingCall = oneshot::Sender<(Option<String>, Value)>;

/// An endpoint over a TCP connection's split halves.
pub type TcpEndpoint = Endpoint<OwnedReadHalf, OwnedWriteHalf>;

/// One live connection: read loop, correlation table, and the
/// `call`/`notify`/`close` surface.
pub struct Endpoint<R, W> {
    config: EndpointConfig,
    registry: Arc<ServiceRegistry>,
    running: AtomicBool,
    /// Monotonically increasing, starts at 1. Wrap-around is out of scope
    /// at expected call volumes.
    next_msgid: AtomicU32,
    /// Correlation table: msgid of each in-flight call to its waiter.
    pending: Mutex<HashMap<u32, PendingCall>>,
    /// Read half, taken by `serve()` for its whole run.
    reader: tokio::sync::Mutex<Option<R>>,
    /// Write half; the lock serializes whole-message writes.
    writer: tokio::sync::Mutex<W>,
    last_error: Mutex<Option<String>>,
}

impl<R, W> Endpoint<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Create an endpoint over an already-established connection.
    pub fn new(reader: R, writer: W, registry: Arc<ServiceRegistry>, config: EndpointConfig) -> Self {
        Self {
            config,
            registry,
            running: AtomicBool::new(true),
            next_msgid: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(writer),
            last_error: Mutex::new(None),
        }
    }

    /// Run the read loop until `close()` or a terminal condition.
    ///
    /// Returns `Ok(())` on a clean peer close or after `close()`; returns
    /// the terminal error on a read failure, framing violation, or reply
    /// send failure. May be called once per endpoint.
    pub async fn serve(&self) -> Result<()> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or_else(|| CrosscallError::Protocol("serve may only run once per endpoint".into()))?;

        let mut decoder = MessageDecoder::new();
        let mut buf = vec![0u8; self.config.read_chunk_size];

        while self.running.load(Ordering::Acquire) {
            let n = match timeout(self.config.read_poll_timeout, reader.read(&mut buf)).await {
                // No data within the poll bound; go around and observe
                // a close() if one happened.
                Err(_) => continue,
                Ok(Ok(0)) => {
                    info!(peer = %self.config.peer, "peer closed the connection");
                    self.running.store(false, Ordering::Release);
                    return Ok(());
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!(peer = %self.config.peer, error = %e, "connection read failed");
                    return Err(self.fail(CrosscallError::Io(e)));
                }
            };

            let messages = match decoder.feed(&buf[..n]) {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(peer = %self.config.peer, error = %e, "broken stream");
                    return Err(self.fail(e));
                }
            };
            for message in messages {
                if !self.running.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = self.dispatch(message).await {
                    return Err(self.fail(e));
                }
            }
        }
        Ok(())
    }

    /// Issue a call and block the current task until the response
    /// arrives or the call timeout elapses.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let id = self.next_msgid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let request = Message::Request {
            id,
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.send(&request).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match timeout(self.config.call_timeout, rx).await {
            Ok(Ok((None, result))) => Ok(result),
            Ok(Ok((Some(error), _))) => Err(CrosscallError::Remote(error)),
            // The sender only disappears when the endpoint itself is torn
            // down mid-call.
            Ok(Err(_)) => Err(CrosscallError::ConnectionClosed),
            Err(_) => {
                // Our entry, our cleanup. A response arriving after this
                // point is ignored as an unknown msgid.
                self.pending.lock().unwrap().remove(&id);
                Err(CrosscallError::Timeout(self.config.call_timeout))
            }
        }
    }

    /// Send a one-way notification. No reply, no correlation entry.
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        let notification = Message::Notification {
            method: method.to_string(),
            params,
        };
        self.send(&notification).await
    }

    /// Stop the read loop. Does not close the underlying connection; its
    /// lifetime belongs to whichever component opened it.
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The terminal error recorded by the read or send path, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Record a terminal error and stop the endpoint.
    fn fail(&self, err: CrosscallError) -> CrosscallError {
        *self.last_error.lock().unwrap() = Some(err.to_string());
        self.running.store(false, Ordering::Release);
        err
    }

    /// Encode and write one message as a single atomic write.
    ///
    /// A write failure is terminal for the endpoint, whatever the message.
    async fn send(&self, message: &Message) -> Result<()> {
        let bytes = message.to_bytes()?;
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(peer = %self.config.peer, error = %e, "sending failed");
            return Err(self.fail(CrosscallError::Io(e)));
        }
        Ok(())
    }

    /// The protocol state machine's transition function: route one decoded
    /// message according to its kind and this endpoint's mode.
    async fn dispatch(&self, message: Message) -> Result<()> {
        match message {
            Message::Response { id, error, result } if self.config.mode.is_client() => {
                let waiter = self.pending.lock().unwrap().remove(&id);
                match waiter {
                    // The caller may have timed out between our removal
                    // and this send; a dropped receiver is benign.
                    Some(tx) => {
                        let _ = tx.send((error, result));
                    }
                    None => {
                        warn!(peer = %self.config.peer, msgid = id, "response for unknown msgid, ignoring");
                    }
                }
                Ok(())
            }
            Message::Request { id, method, params } if self.config.mode.is_server() => {
                let reply = self.invoke_call(id, &method, &params);
                self.send(&reply).await
            }
            Message::Notification { method, params } if self.config.mode.is_server() => {
                self.invoke_notify(&method, &params);
                Ok(())
            }
            other => Err(CrosscallError::Protocol(format!(
                "{} not accepted by endpoint mode {}",
                other.kind(),
                self.config.mode
            ))),
        }
    }

    /// Resolve and run a call handler, producing the reply to send back.
    /// Never fails: every outcome maps to a response.
    fn invoke_call(&self, id: u32, method: &str, params: &[Value]) -> Message {
        let handler = match self.registry.get_call(method) {
            Some(h) => h,
            None => {
                warn!(peer = %self.config.peer, method, "call for unregistered method");
                return Message::Response {
                    id,
                    error: Some(format!("method not found: {}", method)),
                    result: Value::Nil,
                };
            }
        };
        match catch_unwind(AssertUnwindSafe(|| handler.call(params))) {
            Ok(Ok(result)) => Message::Response {
                id,
                error: None,
                result,
            },
            Ok(Err(domain)) => Message::Response {
                id,
                error: Some(domain),
                result: Value::Nil,
            },
            // The panic detail stays on this side of the wire.
            Err(_) => {
                error!(peer = %self.config.peer, method, "call handler panicked");
                Message::Response {
                    id,
                    error: Some("internal error".to_string()),
                    result: Value::Nil,
                }
            }
        }
    }

    /// Resolve and run a notification handler. Failures are logged and
    /// swallowed; notifications never produce a reply and never stop the
    /// endpoint.
    fn invoke_notify(&self, method: &str, params: &[Value]) {
        let handler = match self.registry.get_notify(method) {
            Some(h) => h,
            None => {
                warn!(peer = %self.config.peer, method, "notification for unregistered method");
                return;
            }
        };
        if catch_unwind(AssertUnwindSafe(|| handler.notify(params))).is_err() {
            error!(peer = %self.config.peer, method, "notification handler panicked");
        }
    }
}
