//! Reconnecting client: supervision of one outbound endpoint.
//!
//! A [`Client`] keeps at most one live [`TcpEndpoint`] attached to the
//! configured remote address. Two cooperating tasks own the lifecycle:
//!
//! - the **watcher** dials whenever nothing is attached, runs the
//!   connect-time hooks, and backs off on failure;
//! - the **serve** task runs the attached endpoint's read loop to
//!   completion and tears the endpoint down when it ends, for the watcher
//!   to replace.
//!
//! Connecting and serving recover differently, which is why they are two
//! tasks: the watcher can retry dials on its own cycle while the serve
//! task is parked inside a healthy `serve()`, and a mid-serve failure is
//! detected without the watcher polling the socket.
//!
//! `call`/`notify` with nothing attached fail immediately with
//! [`CrosscallError::NotConnected`]; nothing is ever queued.
//!
//! # Example
//!
//! ```ignore
//! let client = Client::builder("127.0.0.1:11000")
//!     .handle_call("echo", |params: &[Value]| Ok(params[0].clone()))
//!     .post_connect(|ep| async move {
//!         ep.call("hello", vec![]).await.is_ok()
//!     })
//!     .start()
//!     .await;
//!
//! let reply = client.call("echo", vec![Value::from("hi")]).await?;
//! client.close().await;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rmpv::Value;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::endpoint::{Endpoint, EndpointConfig, Mode, TcpEndpoint};
use crate::error::{CrosscallError, Result};
use crate::registry::{CallHandler, NotifyHandler, ServiceRegistry};

/// Default bound on one connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default watcher idle/backoff interval. The serve task idles at half
/// of it while waiting for an endpoint to be attached.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Boxed future returned by connect-time hooks.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Decides whether the watcher should dial at all this round.
pub type PreConnectHook = Arc<dyn Fn() -> bool + Send + Sync>;

/// Runs against the freshly attached endpoint (handshakes live here);
/// returning `false` tears the connection down again.
pub type PostConnectHook = Arc<dyn Fn(Arc<TcpEndpoint>) -> BoxFuture<bool> + Send + Sync>;

/// Builder for configuring and starting a reconnecting client.
pub struct ClientBuilder {
    addr: String,
    mode: Mode,
    call_timeout: Duration,
    connect_timeout: Duration,
    retry_interval: Duration,
    read_chunk_size: usize,
    read_poll_timeout: Duration,
    registry: ServiceRegistry,
    pre_connect: Option<PreConnectHook>,
    post_connect: Option<PostConnectHook>,
}

impl ClientBuilder {
    /// Create a builder for the given remote address.
    pub fn new(addr: impl Into<String>) -> Self {
        let defaults = EndpointConfig::default();
        Self {
            addr: addr.into(),
            mode: defaults.mode,
            call_timeout: defaults.call_timeout,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            read_chunk_size: defaults.read_chunk_size,
            read_poll_timeout: defaults.read_poll_timeout,
            registry: ServiceRegistry::new(),
            pre_connect: None,
            post_connect: None,
        }
    }

    /// Which capabilities the endpoint runs with. Default: both.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Per-call response timeout. Default: 5s.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Bound on one connect attempt. Default: 5s.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Watcher idle/backoff interval. Default: 1s.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Read buffer size for the endpoint. Default: 32 KiB.
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    /// Bound on one blocking read in the read loop. Default: 1s.
    pub fn read_poll_timeout(mut self, timeout: Duration) -> Self {
        self.read_poll_timeout = timeout;
        self
    }

    /// Register a call handler served to the remote peer.
    pub fn handle_call(mut self, name: &str, handler: impl CallHandler + 'static) -> Self {
        self.registry.register_call(name, handler);
        self
    }

    /// Register a notification handler served to the remote peer.
    pub fn handle_notify(mut self, name: &str, handler: impl NotifyHandler + 'static) -> Self {
        self.registry.register_notify(name, handler);
        self
    }

    /// Replace the whole registry, when handlers are assembled elsewhere.
    pub fn registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Hook run before each dial; returning `false` skips this round.
    pub fn pre_connect(mut self, hook: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.pre_connect = Some(Arc::new(hook));
        self
    }

    /// Hook run against each freshly connected endpoint, e.g. an
    /// authentication handshake. Returning `false` drops the connection.
    pub fn post_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<TcpEndpoint>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.post_connect = Some(Arc::new(move |ep| Box::pin(hook(ep)) as BoxFuture<bool>));
        self
    }

    /// Start the client: spawn the watcher and serve tasks and return.
    /// The first connection is established in the background; poll
    /// [`Client::is_ready`] or use a post-connect hook to learn when.
    pub async fn start(self) -> Client {
        let shared = Arc::new(Shared {
            addr: self.addr,
            mode: self.mode,
            call_timeout: self.call_timeout,
            connect_timeout: self.connect_timeout,
            retry_interval: self.retry_interval,
            read_chunk_size: self.read_chunk_size,
            read_poll_timeout: self.read_poll_timeout,
            registry: Arc::new(self.registry),
            pre_connect: self.pre_connect,
            post_connect: self.post_connect,
            running: AtomicBool::new(true),
            endpoint: Mutex::new(None),
            connect_failures: AtomicU32::new(0),
            last_error: Mutex::new(None),
        });

        let watcher = tokio::spawn(watcher_loop(shared.clone()));
        let server = tokio::spawn(serve_loop(shared.clone()));

        Client {
            shared,
            watcher: Mutex::new(Some(watcher)),
            server: Mutex::new(Some(server)),
        }
    }
}

/// State shared between the client surface and its two tasks.
struct Shared {
    addr: String,
    mode: Mode,
    call_timeout: Duration,
    connect_timeout: Duration,
    retry_interval: Duration,
    read_chunk_size: usize,
    read_poll_timeout: Duration,
    registry: Arc<ServiceRegistry>,
    pre_connect: Option<PreConnectHook>,
    post_connect: Option<PostConnectHook>,
    running: AtomicBool,
    /// At most one live endpoint; `None` while reconnecting.
    endpoint: Mutex<Option<Arc<TcpEndpoint>>>,
    connect_failures: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn attached(&self) -> Option<Arc<TcpEndpoint>> {
        self.endpoint.lock().unwrap().clone()
    }

    /// Detach and stop the live endpoint, if any. The socket closes when
    /// the last Arc (usually the serve task's) goes away.
    fn reset(&self) {
        if let Some(ep) = self.endpoint.lock().unwrap().take() {
            ep.close();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Dial whenever nothing is attached; back off on any failure.
async fn watcher_loop(shared: Arc<Shared>) {
    while shared.is_running() {
        if shared.attached().is_some() {
            sleep(shared.retry_interval).await;
            continue;
        }

        if let Some(pre) = &shared.pre_connect {
            if !pre() {
                sleep(shared.retry_interval).await;
                continue;
            }
        }
        // The hook may have taken a while; re-check before dialing.
        if !shared.is_running() {
            continue;
        }

        let stream = match timeout(shared.connect_timeout, TcpStream::connect(&shared.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                info!(addr = %shared.addr, error = %e, "connect failed");
                shared.connect_failures.fetch_add(1, Ordering::AcqRel);
                sleep(shared.retry_interval).await;
                continue;
            }
            Err(_) => {
                info!(addr = %shared.addr, "connect timed out");
                shared.connect_failures.fetch_add(1, Ordering::AcqRel);
                sleep(shared.retry_interval).await;
                continue;
            }
        };
        shared.connect_failures.store(0, Ordering::Release);

        let (reader, writer) = stream.into_split();
        let config = EndpointConfig {
            mode: shared.mode,
            call_timeout: shared.call_timeout,
            read_chunk_size: shared.read_chunk_size,
            read_poll_timeout: shared.read_poll_timeout,
            peer: shared.addr.clone(),
        };
        let ep = Arc::new(Endpoint::new(reader, writer, shared.registry.clone(), config));

        // Attach before the handshake hook runs: the serve task starts
        // pumping the connection, which the hook's own calls depend on.
        *shared.endpoint.lock().unwrap() = Some(ep.clone());
        info!(addr = %shared.addr, "connected");

        if let Some(post) = &shared.post_connect {
            if !post(ep).await {
                warn!(addr = %shared.addr, "post-connect hook declined, dropping connection");
                shared.reset();
                sleep(shared.retry_interval).await;
            }
        }
    }
}

/// Run whatever endpoint is attached to completion; idle while none is.
async fn serve_loop(shared: Arc<Shared>) {
    while shared.is_running() {
        let ep = match shared.attached() {
            Some(ep) => ep,
            None => {
                sleep(shared.retry_interval / 2).await;
                continue;
            }
        };

        let outcome = ep.serve().await;
        match &outcome {
            Ok(()) => info!(addr = %shared.addr, "connection ended"),
            Err(e) => info!(addr = %shared.addr, error = %e, "connection ended"),
        }
        *shared.last_error.lock().unwrap() = outcome.err().map(|e| e.to_string());
        shared.reset();
    }
}

/// A running reconnecting client.
pub struct Client {
    shared: Arc<Shared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Create a builder for the given remote address.
    pub fn builder(addr: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(addr)
    }

    /// Issue a call on the attached endpoint.
    ///
    /// Fails immediately with [`CrosscallError::NotConnected`] while
    /// reconnecting; never queues.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let ep = self
            .shared
            .attached()
            .ok_or_else(|| CrosscallError::NotConnected(self.shared.addr.clone()))?;
        ep.call(method, params).await
    }

    /// Send a notification on the attached endpoint.
    ///
    /// Fails immediately with [`CrosscallError::NotConnected`] while
    /// reconnecting. A send failure on a live endpoint is logged and
    /// swallowed; there is no recovery action at this layer, the serve
    /// task already tears the broken connection down.
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        let ep = self
            .shared
            .attached()
            .ok_or_else(|| CrosscallError::NotConnected(self.shared.addr.clone()))?;
        if let Err(e) = ep.notify(method, params).await {
            warn!(addr = %self.shared.addr, error = %e, "notify send failed");
        }
        Ok(())
    }

    /// Whether an endpoint is currently attached.
    pub fn is_ready(&self) -> bool {
        self.shared.attached().is_some()
    }

    /// Whether the supervision tasks are still running.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Connect attempts failed in a row since the last success.
    pub fn consecutive_connect_failures(&self) -> u32 {
        self.shared.connect_failures.load(Ordering::Acquire)
    }

    /// The error the last connection ended with, if it ended with one.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().unwrap().clone()
    }

    /// The configured remote address.
    pub fn remote_addr(&self) -> &str {
        &self.shared.addr
    }

    /// Stop both tasks, tear down any live connection, and wait for the
    /// tasks to finish. Idempotent.
    pub async fn close(&self) {
        info!(addr = %self.shared.addr, "client closed");
        self.shared.running.store(false, Ordering::Release);
        self.shared.reset();

        let watcher = self.watcher.lock().unwrap().take();
        if let Some(handle) = watcher {
            let _ = handle.await;
        }
        let server = self.server.lock().unwrap().take();
        if let Some(handle) = server {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let builder = Client::builder("127.0.0.1:9000");
        assert_eq!(builder.addr, "127.0.0.1:9000");
        assert_eq!(builder.mode, Mode::BOTH);
        assert_eq!(builder.call_timeout, Duration::from_secs(5));
        assert_eq!(builder.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(builder.retry_interval, DEFAULT_RETRY_INTERVAL);
        assert!(builder.pre_connect.is_none());
        assert!(builder.post_connect.is_none());
    }

    #[test]
    fn builder_chaining() {
        let builder = Client::builder("127.0.0.1:9000")
            .mode(Mode::CLIENT)
            .call_timeout(Duration::from_millis(100))
            .connect_timeout(Duration::from_millis(200))
            .retry_interval(Duration::from_millis(50))
            .read_chunk_size(4096)
            .handle_call("echo", |params: &[Value]| Ok(params[0].clone()))
            .handle_notify("tick", |_: &[Value]| {})
            .pre_connect(|| true)
            .post_connect(|_ep| async { true });

        assert_eq!(builder.mode, Mode::CLIENT);
        assert_eq!(builder.call_timeout, Duration::from_millis(100));
        assert_eq!(builder.read_chunk_size, 4096);
        assert!(builder.registry.get_call("echo").is_some());
        assert!(builder.registry.get_notify("tick").is_some());
        assert!(builder.pre_connect.is_some());
        assert!(builder.post_connect.is_some());
    }

    #[tokio::test]
    async fn call_and_notify_fail_fast_when_not_connected() {
        // A port nothing listens on; the watcher keeps failing in the
        // background while the surface must answer immediately.
        let client = Client::builder("127.0.0.1:1")
            .retry_interval(Duration::from_millis(50))
            .connect_timeout(Duration::from_millis(100))
            .start()
            .await;

        assert!(!client.is_ready());

        let started = std::time::Instant::now();
        let err = client.call("anything", vec![]).await.unwrap_err();
        assert!(matches!(err, CrosscallError::NotConnected(_)));
        let err = client.notify("anything", vec![]).await.unwrap_err();
        assert!(matches!(err, CrosscallError::NotConnected(_)));
        // Far below the 5s call timeout: the failure is immediate.
        assert!(started.elapsed() < Duration::from_millis(500));

        client.close().await;
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let client = Client::builder("127.0.0.1:1")
            .retry_interval(Duration::from_millis(20))
            .connect_timeout(Duration::from_millis(50))
            .start()
            .await;

        client.close().await;
        client.close().await;
        assert!(!client.is_running());
        assert!(!client.is_ready());
    }
}
