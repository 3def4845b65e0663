//! Connection acceptance, admission control, and lifecycle.
//!
//! A pre-spawned, zero-allocation worker pool would keep the hot path
//! allocation-free, but this crate's HTTP/2 driver already allocates per
//! stream (`HashMap<u32, Stream>`, HPACK dynamic tables), so that invariant
//! doesn't hold here. Instead each accepted connection gets its own
//! `tokio::spawn`ed task. See `DESIGN.md` for the full rationale.

use crate::http::response::make_generic_body;
use crate::http::types::{StatusCode, Version};
use crate::http1::driver::Http1Driver;
use crate::http2::driver::Http2Driver;
use crate::http2::frame::CONNECTION_PREFACE;
use crate::options::Options;
use crate::server::client::{Client, ClientIdentity, ConnectionFilter};
use crate::server::vhost::VhostContainer;
use crate::ticker::Ticker;
use crate::websocket::{Registry, WebSocketHandler};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{info, warn};

/// Server lifecycle: `Stopped -> Starting -> Started -> Stopping
/// -> Stopped`. Only `Started` accepts new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Stopped,
            1 => ServerState::Starting,
            2 => ServerState::Started,
            _ => ServerState::Stopping,
        }
    }
}

struct WebSocketEndpoint {
    handler: Arc<dyn WebSocketHandler>,
    registry: Registry,
    supported_protocols: Vec<String>,
}

/// Accepts connections, demultiplexes HTTP/1 vs HTTP/2 by preface sniffing,
/// and enforces admission limits
/// `connectionsPerIP`).
pub struct Server {
    listener: TcpListener,
    options: Arc<Options>,
    ticker: Ticker,
    router: Arc<VhostContainer>,
    filter: Arc<dyn ConnectionFilter>,
    websocket: Option<WebSocketEndpoint>,
    state: AtomicU8,
    open_connections: AtomicUsize,
    per_ip: Mutex<HashMap<IpAddr, usize>>,
    connections: Mutex<HashMap<u64, AbortHandle>>,
    next_client_id: AtomicU64,
    inflight: AtomicUsize,
    shutdown_notify: Notify,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Acquire)
    }

    /// Signals the accept loop to stop taking new connections and begin
    /// draining. Returns immediately; await the task driving `launch` to
    /// observe full shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown_notify.notify_one();
    }

    /// Runs the accept loop until `request_shutdown` is called, then drains
    /// in-flight connections for up to `options.shutdown_timeout` before
    /// force-closing stragglers.
    pub async fn launch(self: Arc<Self>) {
        self.state.store(ServerState::Starting as u8, Ordering::Release);
        info!("server starting");
        self.state.store(ServerState::Started as u8, Ordering::Release);
        info!(addr = ?self.listener.local_addr().ok(), "server started");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => self.clone().accept_connection(stream, peer_addr),
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
                _ = self.shutdown_notify.notified() => break,
            }
        }

        self.state.store(ServerState::Stopping as u8, Ordering::Release);
        info!(inflight = self.inflight.load(Ordering::Acquire), "server stopping");
        self.drain().await;
        self.state.store(ServerState::Stopped as u8, Ordering::Release);
        info!("server stopped");
    }

    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + self.options.shutdown_timeout;
        loop {
            if self.inflight.load(Ordering::Acquire) == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let stragglers: Vec<AbortHandle> = self.connections.lock().values().cloned().collect();
        warn!(count = stragglers.len(), "shutdown timeout elapsed, force-closing remaining connections");
        for handle in stragglers {
            handle.abort();
        }
    }

    fn accept_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        if self.state() != ServerState::Started {
            return;
        }
        let Ok(local_addr) = stream.local_addr() else {
            return;
        };
        let ip = peer_addr.ip();

        if self.open_connections.load(Ordering::Acquire) >= self.options.max_connections {
            tokio::spawn(reject_connection(stream));
            return;
        }
        {
            let mut per_ip = self.per_ip.lock();
            let count = per_ip.entry(ip).or_insert(0);
            if *count >= self.options.connections_per_ip {
                drop(per_ip);
                tokio::spawn(reject_connection(stream));
                return;
            }
            *count += 1;
        }

        self.open_connections.fetch_add(1, Ordering::AcqRel);
        self.inflight.fetch_add(1, Ordering::AcqRel);
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);

        let server = self.clone();
        let abort_handle = tokio::spawn(async move {
            if let Err(status) = server.filter.filter(peer_addr, local_addr).await {
                let mut stream = stream;
                let body = make_generic_body(status, Version::Http11, false);
                let _ = stream.write_all(&body).await;
            } else {
                server.drive_connection(stream, peer_addr, local_addr, client_id).await;
            }
            server.connection_finished(client_id, ip);
        })
        .abort_handle();
        self.connections.lock().insert(client_id, abort_handle);
    }

    fn connection_finished(&self, client_id: u64, ip: IpAddr) {
        self.connections.lock().remove(&client_id);
        self.open_connections.fetch_sub(1, Ordering::AcqRel);
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        let mut per_ip = self.per_ip.lock();
        if let Some(count) = per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_ip.remove(&ip);
            }
        }
    }

    /// Chooses HTTP/1 vs HTTP/2 by sniffing the connection preface:
    /// TLS/ALPN negotiation happens above this crate and is out of scope
    /// here, so a plain `TcpListener` accept always falls to sniffing.
    async fn drive_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        client_id: u64,
    ) {
        let mut preface_buf = [0u8; 24];
        let peeked = stream.peek(&mut preface_buf).await.unwrap_or(0);
        let is_http2 = peeked >= CONNECTION_PREFACE.len() && &preface_buf[..CONNECTION_PREFACE.len()] == CONNECTION_PREFACE;

        let client = Arc::new(Mutex::new(Client::new(
            client_id,
            ClientIdentity {
                client_addr: peer_addr,
                server_addr: local_addr,
                is_encrypted: false,
                crypto_info: None,
            },
        )));

        let result = if is_http2 {
            let authority = self.options.default_host.clone().unwrap_or_else(|| local_addr.to_string());
            let mut driver = Http2Driver::new(stream, self.options.clone(), self.ticker.clone(), authority, client);
            driver.run(self.router.clone()).await
        } else {
            let mut driver = Http1Driver::new(stream, self.options.clone(), self.ticker.clone(), client_id, client);
            if let Some(ws) = &self.websocket {
                driver = driver.with_websocket(ws.handler.clone(), ws.registry.clone(), ws.supported_protocols.clone());
            }
            driver.run(&self.router).await
        };

        if let Err(err) = result {
            warn!(client_id, peer = %peer_addr, error = ?err, "connection ended with error");
        }
    }
}

async fn reject_connection(mut stream: TcpStream) {
    let body = make_generic_body(StatusCode::ServiceUnavailable, Version::Http11, false);
    let _ = stream.write_all(&body).await;
}

/// Fluent configuration surface for constructing a `Server`.
pub struct ServerBuilder {
    listener: Option<TcpListener>,
    options: Options,
    router: Option<VhostContainer>,
    filter: Arc<dyn ConnectionFilter>,
    websocket: Option<WebSocketEndpoint>,
}

impl ServerBuilder {
    fn new() -> Self {
        Self {
            listener: None,
            options: Options::default(),
            router: None,
            filter: Arc::new(()),
            websocket: None,
        }
    }

    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Binds a listening socket honoring `options.socket_backlog_size`,
    /// rather than the fixed backlog `TcpListener::bind` picks. Use this
    /// instead of `.listener(...)` when no externally-configured listener
    /// (e.g. one already wrapped for TLS termination) is being supplied.
    pub fn bind(self, addr: SocketAddr) -> std::io::Result<Self> {
        let backlog = self.options.socket_backlog_size;
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog as i32)?;
        let listener = TcpListener::from_std(socket.into())?;
        Ok(self.listener(listener))
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn router(mut self, router: VhostContainer) -> Self {
        self.router = Some(router);
        self
    }

    pub fn connection_filter(mut self, filter: impl ConnectionFilter) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    pub fn websocket(mut self, handler: Arc<dyn WebSocketHandler>, supported_protocols: Vec<String>) -> Self {
        self.websocket = Some(WebSocketEndpoint {
            handler,
            registry: Registry::new(),
            supported_protocols,
        });
        self
    }

    /// # Panics
    /// Panics if `listener` or `router` were never set — both are mandatory
    /// to serve a single request.
    pub fn build(self) -> Server {
        let listener = self.listener.expect("ServerBuilder::listener must be set");
        let router = self.router.expect("ServerBuilder::router must be set");
        Server {
            listener,
            options: Arc::new(self.options),
            ticker: Ticker::start(),
            router: Arc::new(router),
            filter: self.filter,
            websocket: self.websocket,
            state: AtomicU8::new(ServerState::Stopped as u8),
            open_connections: AtomicUsize::new(0),
            per_ip: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            inflight: AtomicUsize::new(0),
            shutdown_notify: Notify::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::InternalRequest;
    use crate::http::response::Response;
    use crate::pipeline::{RequestPipeline, Responder};
    use async_trait::async_trait;

    struct EmptyResponder;
    #[async_trait]
    impl Responder for EmptyResponder {
        async fn respond(&self, _request: &mut InternalRequest) -> Response {
            let mut response = Response::new();
            response.status(StatusCode::Ok);
            response
        }
    }

    async fn bound_listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn starts_stopped_and_transitions_through_launch() {
        let listener = bound_listener().await;
        let router = VhostContainer::new(Arc::new(RequestPipeline::new(Vec::new(), Arc::new(EmptyResponder))));
        let server = Arc::new(Server::builder().listener(listener).router(router).build());
        assert_eq!(server.state(), ServerState::Stopped);

        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.launch().await });
        // give the loop a moment to flip to Started before requesting shutdown
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.state(), ServerState::Started);

        server.request_shutdown();
        handle.await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn admission_rejects_past_max_connections() {
        let listener = bound_listener().await;
        let addr = listener.local_addr().unwrap();
        let mut options = Options::default();
        options.max_connections = 0;
        let router = VhostContainer::new(Arc::new(RequestPipeline::new(Vec::new(), Arc::new(EmptyResponder))));
        let server = Arc::new(Server::builder().listener(listener).router(router).options(options).build());

        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.launch().await });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt;
        let _ = client.read_to_end(&mut buf).await;
        assert!(!buf.is_empty());
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("HTTP/1.1 503"));

        server.request_shutdown();
        handle.await.unwrap();
    }
}
