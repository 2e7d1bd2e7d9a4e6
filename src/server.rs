use crate::config::Config;
use crate::directory::Directory;
use crate::interceptor::{InterceptorChain, LoggingInterceptor, StaticEntryInterceptor};
use crate::ldap_protocol::{
    encode_error_response, encode_ldap_message, encode_notice_of_disconnection, frame_length,
    parse_ldap_message, parse_ldap_message_header, response_tag_for_request, ExtendedResponse, Framing,
    LdapMessage, LdapResult, ProtocolOp, ResultCode, LDAP_TAG_EXTENDED_RESPONSE, START_TLS_OID,
};
use crate::metrics::Metrics;
use crate::session::{Session, SessionOptions};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use bytes::BytesMut;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Client stream: either plain TCP or TLS-wrapped. Covers ldap://, ldaps:// and the StartTLS upgrade.
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ClientStream {
    pub fn is_secure(&self) -> bool {
        matches!(self, ClientStream::Tls(_))
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Parsed `ldap://` / `ldaps://` listen URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress {
    pub addr: SocketAddr,
    /// `ldaps://`: TLS from the first byte.
    pub secure: bool,
}

pub fn parse_listen_url(url: &str) -> Result<ListenAddress> {
    let (rest, secure) = if let Some(rest) = url.strip_prefix("ldaps://") {
        (rest, true)
    } else if let Some(rest) = url.strip_prefix("ldap://") {
        (rest, false)
    } else {
        anyhow::bail!("Invalid URL scheme, expected ldap:// or ldaps://");
    };

    let rest = rest.trim_start_matches('/').trim_end_matches('/');

    let addr = if let Some(port) = rest.strip_prefix(':') {
        // Just port specified, bind to all interfaces
        let port: u16 = port.parse().context("Invalid port number")?;
        SocketAddr::from(([0, 0, 0, 0], port))
    } else if let Some(port) = rest.strip_prefix("localhost:") {
        let port: u16 = port.parse().context("Invalid port number")?;
        SocketAddr::from(([127, 0, 0, 1], port))
    } else {
        rest.parse()
            .with_context(|| format!("Failed to parse address: {}", rest))?
    };
    Ok(ListenAddress { addr, secure })
}

/// Upper bound for a TLS handshake (LDAPS accept or StartTLS upgrade).
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_url: String,
    pub max_message_size: usize,
    pub allow_anonymous: bool,
    /// How long shutdown waits for connections to close before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_url: "ldap://127.0.0.1:1389".to_string(),
            max_message_size: crate::config::DEFAULT_MAX_MESSAGE_SIZE,
            allow_anonymous: true,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// State shared by every connection task.
struct Shared {
    directory: Arc<Directory>,
    interceptors: Arc<InterceptorChain>,
    metrics: Arc<Metrics>,
    /// When Some, TLS is enabled; use .load() to get the current TlsAcceptor (supports hot reload).
    tls_acceptor: Option<Arc<ArcSwap<TlsAcceptor>>>,
    max_message_size: usize,
    allow_anonymous: bool,
    shutdown_grace: Duration,
    ldaps: bool,
}

pub struct LdapServer {
    options: ServerOptions,
    directory: Arc<Directory>,
    interceptors: Arc<InterceptorChain>,
    metrics: Arc<Metrics>,
    tls_acceptor: Option<Arc<ArcSwap<TlsAcceptor>>>,
}

impl LdapServer {
    pub fn new(
        options: ServerOptions,
        directory: Arc<Directory>,
        interceptors: Arc<InterceptorChain>,
        metrics: Arc<Metrics>,
        tls_acceptor: Option<Arc<ArcSwap<TlsAcceptor>>>,
    ) -> Self {
        Self {
            options,
            directory,
            interceptors,
            metrics,
            tls_acceptor,
        }
    }

    /// Build the directory, interceptor chain and TLS acceptor described by `config`.
    pub fn from_config(config: &Config, metrics: Arc<Metrics>) -> Result<Self> {
        let directory = Directory::new(config.directory_config()).context("Configure directory")?;
        let loaded = directory
            .load_fixtures(config.fixture_entries()?)
            .context("Load fixture entries")?;
        info!("Directory loaded with {} entries", loaded);

        let mut interceptors = InterceptorChain::new();
        if config.interceptors.log_operations {
            interceptors.push(Arc::new(LoggingInterceptor));
        }
        let static_entries = config.static_entries()?;
        if !static_entries.is_empty() {
            interceptors.push(Arc::new(StaticEntryInterceptor::new(static_entries)));
        }

        let tls_acceptor = match config.tls_files()? {
            Some(files) => {
                let acceptor = files.build_acceptor()?;
                info!("TLS enabled for listener (LDAPS or StartTLS)");
                Some(Arc::new(ArcSwap::from_pointee(acceptor)))
            }
            None => None,
        };

        Ok(Self::new(
            ServerOptions {
                listen_url: config.listen.url.clone(),
                max_message_size: config.max_message_size(),
                allow_anonymous: config.allow_anonymous(),
                ..ServerOptions::default()
            },
            Arc::new(directory),
            Arc::new(interceptors),
            metrics,
            tls_acceptor,
        ))
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn tls_acceptor(&self) -> Option<&Arc<ArcSwap<TlsAcceptor>>> {
        self.tls_acceptor.as_ref()
    }

    pub async fn bind(self) -> Result<BoundLdapServer> {
        let listen = parse_listen_url(&self.options.listen_url)?;
        if listen.secure && self.tls_acceptor.is_none() {
            anyhow::bail!("LDAPS (ldaps://) requires tls.cert_file and tls.key_file");
        }

        let listener = TcpListener::bind(&listen.addr)
            .await
            .with_context(|| format!("Failed to bind to {}", listen.addr))?;
        let local_addr = listener.local_addr().context("Read listener address")?;

        info!(
            "LDAP server listening on {}://{}",
            if listen.secure { "ldaps" } else { "ldap" },
            local_addr
        );
        info!("Naming contexts: {:?}", self.directory.base_dns().iter().map(|d| d.to_string()).collect::<Vec<_>>());
        if !self.interceptors.is_empty() {
            info!("Interceptors: {:?}", self.interceptors.names());
        }

        Ok(BoundLdapServer {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                directory: self.directory,
                interceptors: self.interceptors,
                metrics: self.metrics,
                tls_acceptor: self.tls_acceptor,
                max_message_size: self.options.max_message_size,
                allow_anonymous: self.options.allow_anonymous,
                shutdown_grace: self.options.shutdown_grace,
                ldaps: listen.secure,
            }),
        })
    }
}

pub struct BoundLdapServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl BoundLdapServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL clients can connect to (wildcard addresses are reported as loopback).
    pub fn url(&self) -> String {
        let scheme = if self.shared.ldaps { "ldaps" } else { "ldap" };
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip([127, 0, 0, 1].into());
        }
        format!("{}://{}", scheme, addr)
    }

    /// Accept connections until `shutdown` completes, then disconnect every client.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let BoundLdapServer {
            listener,
            shared,
            local_addr,
        } = self;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        let mut next_id: u64 = 0;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        next_id += 1;
                        debug!(conn = next_id, "New connection from {}", peer_addr);
                        let shared = Arc::clone(&shared);
                        let shutdown_rx = shutdown_rx.clone();
                        connections.spawn(run_connection(next_id, stream, peer_addr, shared, shutdown_rx));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!("LDAP server on {} shutting down ({} open connections)", local_addr, connections.len());
        drop(listener);
        let _ = shutdown_tx.send(true);
        let drained = tokio::time::timeout(shared.shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections still open after {:?}; aborting them",
                connections.len(),
                shared.shutdown_grace
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }
        info!("LDAP server stopped");
        Ok(())
    }

    /// Run in a background task; the handle stops it.
    pub fn spawn(self) -> ServerHandle {
        let local_addr = self.local_addr;
        let url = self.url();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.serve(async move {
            let _ = rx.await;
        }));
        ServerHandle {
            local_addr,
            url,
            shutdown: Some(tx),
            task,
        }
    }
}

/// Handle to a server started with `BoundLdapServer::spawn`.
pub struct ServerHandle {
    local_addr: SocketAddr,
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stop accepting, send Notice of Disconnection to connected clients and wait for them to close.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        (&mut self.task).await.context("LDAP server task panicked")?
    }
}

/// Counts a connection as active until dropped, including when its task is aborted.
struct ConnectionGuard(Arc<Metrics>);

impl ConnectionGuard {
    fn open(metrics: Arc<Metrics>) -> Self {
        metrics.connection_opened();
        Self(metrics)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

async fn run_connection(
    id: u64,
    stream: TcpStream,
    peer_addr: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let _guard = ConnectionGuard::open(Arc::clone(&shared.metrics));
    let client_stream = match (&shared.tls_acceptor, shared.ldaps) {
        (Some(swap), true) => {
            let acceptor = swap.load_full();
            tokio::select! {
                accepted = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)) => match accepted {
                    Ok(Ok(tls_stream)) => Some(ClientStream::Tls(Box::new(tls_stream))),
                    Ok(Err(e)) => {
                        error!("TLS handshake failed for {}: {}", peer_addr, e);
                        None
                    }
                    Err(_) => {
                        warn!("TLS handshake with {} timed out", peer_addr);
                        None
                    }
                },
                _ = shutdown_rx.changed() => {
                    debug!(conn = id, "Shutdown during TLS handshake with {}", peer_addr);
                    None
                }
            }
        }
        _ => Some(ClientStream::Tcp(stream)),
    };
    if let Some(client_stream) = client_stream {
        if let Err(e) = handle_client(id, client_stream, peer_addr, &shared, shutdown_rx).await {
            error!("Error handling client {}: {:#}", peer_addr, e);
        }
    }
    debug!(conn = id, "Connection from {} closed", peer_addr);
}

async fn send(stream: &mut ClientStream, data: &[u8]) -> Result<()> {
    stream.write_all(data).await.context("Write to client")?;
    stream.flush().await.context("Flush to client")?;
    Ok(())
}

/// Best effort: the connection is closed right after.
async fn disconnect(stream: &mut ClientStream, code: ResultCode, message: &str) {
    let notice = encode_notice_of_disconnection(code, message);
    let _ = send(stream, &notice).await;
    let _ = stream.shutdown().await;
}

async fn handle_client(
    id: u64,
    mut stream: ClientStream,
    peer_addr: SocketAddr,
    shared: &Shared,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let start_tls_available = shared.tls_acceptor.is_some() && !shared.ldaps;
    let mut session = Session::new(
        id,
        Arc::clone(&shared.directory),
        Arc::clone(&shared.interceptors),
        SessionOptions {
            allow_anonymous: shared.allow_anonymous,
            start_tls_available,
        },
    )
    .with_peer(peer_addr)
    .with_metrics(Arc::clone(&shared.metrics));
    session.set_secure(stream.is_secure());

    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        // Drain every complete message already buffered.
        loop {
            let frame_len = match frame_length(&buffer, shared.max_message_size) {
                Framing::Incomplete => break,
                Framing::Complete(n) => n,
                Framing::Invalid(reason) => {
                    shared.metrics.inc_parse_error();
                    warn!("Invalid LDAP stream from {}: {}; disconnecting", peer_addr, reason);
                    disconnect(&mut stream, ResultCode::ProtocolError, &reason).await;
                    return Ok(());
                }
            };
            let frame = buffer.split_to(frame_len);

            let message = match parse_ldap_message(&frame) {
                Ok(message) => message,
                Err(e) => {
                    shared.metrics.inc_parse_error();
                    match parse_ldap_message_header(&frame) {
                        Ok((message_id, request_tag)) => {
                            debug!(
                                "Parse error from {} (msgid {}, tag 0x{:02X}): {}",
                                peer_addr, message_id, request_tag, e
                            );
                            if let Some(response_tag) = response_tag_for_request(request_tag) {
                                let result = LdapResult::new(
                                    ResultCode::ProtocolError,
                                    format!("Failed to parse LDAP message: {}", e),
                                );
                                send(&mut stream, &encode_error_response(message_id, response_tag, &result)).await?;
                            }
                            continue;
                        }
                        Err(_) => {
                            warn!("Undecodable LDAP message from {}: {}; disconnecting", peer_addr, e);
                            disconnect(&mut stream, ResultCode::ProtocolError, "malformed LDAP message").await;
                            return Ok(());
                        }
                    }
                }
            };
            debug!(conn = id, "Parsed LDAP message with ID: {}", message.message_id);

            if let ProtocolOp::ExtendedRequest(ext) = &message.protocol_op {
                if ext.request_name == START_TLS_OID {
                    let pipelined = !buffer.is_empty();
                    match start_tls(stream, message.message_id, pipelined, shared, peer_addr, &mut shutdown_rx).await? {
                        Some(upgraded) => stream = upgraded,
                        None => return Ok(()),
                    }
                    session.set_secure(stream.is_secure());
                    continue;
                }
            }

            for response in session.handle(message) {
                let data = encode_ldap_message(&response)?;
                stream.write_all(&data).await.context("Write to client")?;
            }
            stream.flush().await.context("Flush to client")?;

            if session.is_closed() {
                debug!(conn = id, "Client {} unbound", peer_addr);
                let _ = stream.shutdown().await;
                return Ok(());
            }
        }

        if *shutdown_rx.borrow() {
            disconnect(&mut stream, ResultCode::Unavailable, "server is shutting down").await;
            return Ok(());
        }

        tokio::select! {
            read = stream.read_buf(&mut buffer) => {
                if read.context("Read from client")? == 0 {
                    debug!(conn = id, "Client {} disconnected", peer_addr);
                    return Ok(());
                }
            }
            _ = shutdown_rx.changed() => {
                disconnect(&mut stream, ResultCode::Unavailable, "server is shutting down").await;
                return Ok(());
            }
        }
    }
}

/// StartTLS (RFC 4511 section 4.14): answer on the plain stream, then upgrade it in place.
/// Returns None when the server shuts down mid-handshake.
async fn start_tls(
    mut stream: ClientStream,
    message_id: i32,
    pipelined: bool,
    shared: &Shared,
    peer_addr: SocketAddr,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<Option<ClientStream>> {
    let started = Instant::now();
    let metrics = &shared.metrics;
    let refusal = if stream.is_secure() {
        Some(LdapResult::new(
            ResultCode::ProtocolError,
            "StartTLS not permitted on secure connection",
        ))
    } else if shared.tls_acceptor.is_none() {
        Some(LdapResult::new(ResultCode::UnwillingToPerform, "StartTLS not configured"))
    } else if pipelined {
        Some(LdapResult::new(
            ResultCode::OperationsError,
            "StartTLS requested with other operations outstanding",
        ))
    } else {
        None
    };

    metrics.inc_request("extended");
    if let Some(result) = refusal {
        debug!("StartTLS refused for {}: {}", peer_addr, result.diagnostic_message);
        metrics.inc_error("extended");
        metrics.inc_result("extended", result.result_code);
        send(&mut stream, &encode_error_response(message_id, LDAP_TAG_EXTENDED_RESPONSE, &result)).await?;
        return Ok(Some(stream));
    }

    let acceptor = match &shared.tls_acceptor {
        Some(swap) => swap.load_full(),
        None => return Ok(Some(stream)),
    };
    let response = LdapMessage::new(
        message_id,
        ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: LdapResult::success(),
            response_name: Some(START_TLS_OID.to_string()),
            response_value: None,
        }),
    );
    send(&mut stream, &encode_ldap_message(&response)?).await?;

    let tcp_stream = match stream {
        ClientStream::Tcp(tcp_stream) => tcp_stream,
        tls @ ClientStream::Tls(_) => return Ok(Some(tls)),
    };
    let tls_stream = tokio::select! {
        accepted = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp_stream)) => accepted
            .with_context(|| format!("StartTLS handshake with {} timed out", peer_addr))?
            .with_context(|| format!("StartTLS handshake failed for {}", peer_addr))?,
        _ = shutdown_rx.changed() => {
            debug!("Shutdown during StartTLS handshake with {}", peer_addr);
            return Ok(None);
        }
    };
    metrics.inc_result("extended", ResultCode::Success);
    metrics.inc_start_tls();
    metrics.observe_duration("extended", started.elapsed());
    debug!("StartTLS upgrade completed for {}", peer_addr);
    Ok(Some(ClientStream::Tls(Box::new(tls_stream))))
}
