//! The accepting side of the proxy.
//!
//! Binds the listener, enforces the connection cap, and runs one task per
//! accepted connection: parse the CONNECT request line, resolve the
//! target through the DNS agent, dial it, and hand both sockets to the
//! handler chain driven by [`serve_connection`].

use crate::connect::ConnectMethodHandler;
use crate::context::{ConnectionConfig, ConnectionId, HandlerContext, RelayStats};
use crate::dns::{DnsHandle, ResolveOutcome, ResolveRequest};
use crate::dns_cache::IpVersion;
use crate::handler::serve_connection;
use crate::limiter::{RateLimits, TokenBucketLimiter, TrafficLimiter};
use crate::{ProxyError, RequestInfo, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Pre-formatted wire responses for the negotiation path.
pub(crate) mod responses {
    /// Positive CONNECT response; the tunnel is open after these bytes.
    pub const CONNECT_OK: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
    pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
    pub const METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";
    pub const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
    pub const GATEWAY_TIMEOUT: &[u8] = b"HTTP/1.1 504 Gateway Timeout\r\n\r\n";
}

/// Upper bound on the request head; anything longer is rejected.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Configuration for the accepting server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the proxy to.
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Per-connection snapshot handed to every handler.
    pub connection: ConnectionConfig,

    /// Per-connection traffic shaping rates.
    pub rate_limits: RateLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3128".parse().expect("hardcoded loopback address"),
            max_connections: 1000,
            connection: ConnectionConfig::default(),
            rate_limits: RateLimits::default(),
        }
    }
}

/// The accepting proxy server.
#[derive(Clone)]
pub struct ProxyServer {
    config: ServerConfig,
    connection_config: Arc<ConnectionConfig>,
    dns: DnsHandle,
    stats: Arc<RelayStats>,
    connection_count: Arc<AtomicUsize>,
    next_connection_id: Arc<AtomicU64>,
    next_resolve_id: Arc<AtomicU64>,
}

impl ProxyServer {
    /// Create a server from its config and a handle to the DNS agent.
    ///
    /// # Errors
    /// Returns `ProxyError::InvalidConfig` when the connection snapshot
    /// is out of range (zero chunk size or timeout).
    pub fn new(config: ServerConfig, dns: DnsHandle) -> Result<Self> {
        config.connection.validate()?;
        let connection_config = Arc::new(config.connection.clone());
        Ok(Self {
            config,
            connection_config,
            dns,
            stats: Arc::new(RelayStats::default()),
            connection_count: Arc::new(AtomicUsize::new(0)),
            next_connection_id: Arc::new(AtomicU64::new(0)),
            next_resolve_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Current number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Relay byte counters aggregated over all connections.
    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Bind the configured address and serve until shut down.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - If binding to `config.bind_addr` fails.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: self.config.bind_addr,
                source: e,
            })?;
        self.run_on(listener).await
    }

    /// Serve on a pre-bound listener.
    ///
    /// Used by [`ProxyServer::start`], which pre-binds to learn the
    /// OS-assigned port before spawning the server task.
    pub async fn run_on(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (client, client_addr) = match listener.accept().await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "TCP accept error");
                    continue;
                }
            };

            let current = self.connection_count.load(Ordering::Relaxed);
            if current >= self.config.max_connections {
                warn!(client = %client_addr, "connection limit reached, rejecting");
                drop(client);
                continue;
            }
            self.connection_count.fetch_add(1, Ordering::Relaxed);

            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let server = self.clone();
            tokio::spawn(async move {
                debug!(connection = id, client = %client_addr, "connection accepted");
                if let Err(e) = server.handle_connection(client, id).await {
                    debug!(connection = id, error = %e, "connection error");
                }
                server.connection_count.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Bind, then serve on a background task; returns a handle exposing
    /// the bound address and a graceful shutdown switch.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: self.config.bind_addr,
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        let stats = Arc::clone(&self.stats);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(async move {
            tokio::select! {
                result = self.run_on(listener) => result,
                _ = shutdown_rx => Ok(()),
            }
        });

        Ok(ProxyHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
            local_addr,
            stats,
        })
    }

    /// Negotiate and serve one accepted connection.
    async fn handle_connection(&self, mut client: TcpStream, id: ConnectionId) -> Result<()> {
        let (head, leftover) = read_request_head(&mut client).await?;

        let request = match parse_connect_request(&head) {
            Ok(request) => request,
            Err(e) => {
                let response = match &e {
                    ProxyError::UnsupportedMethod(_) => responses::METHOD_NOT_ALLOWED,
                    _ => responses::BAD_REQUEST,
                };
                // Best-effort: if we can't notify the client it just sees the drop.
                let _ = client.write_all(response).await;
                return Err(e);
            }
        };

        let address = match self.resolve_target(&request, id).await {
            Ok(address) => address,
            Err(e) => {
                let _ = client.write_all(responses::BAD_GATEWAY).await;
                return Err(e);
            }
        };

        let mut target = match self.dial(address, &request).await {
            Ok(target) => target,
            Err(e) => {
                let response = match &e {
                    ProxyError::Dial { source, .. }
                        if source.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        responses::GATEWAY_TIMEOUT
                    }
                    _ => responses::BAD_GATEWAY,
                };
                let _ = client.write_all(response).await;
                return Err(e);
            }
        };

        // Bytes the client sent ahead of the tunnel confirmation belong
        // to the tunnel and must reach the target first.
        if !leftover.is_empty() {
            target.write_all(&leftover).await?;
        }

        let limiter: Arc<dyn TrafficLimiter> =
            Arc::new(TokenBucketLimiter::new(self.config.rate_limits));
        let ctx = HandlerContext::new(
            id,
            Arc::clone(&self.connection_config),
            self.dns.clone(),
            Arc::clone(&self.stats),
        );
        let handler =
            ConnectMethodHandler::new(client, target, &request, limiter, responses::CONNECT_OK);
        serve_connection(&ctx, Box::new(handler)).await;
        Ok(())
    }

    /// Resolve the target host, going through the DNS agent unless the
    /// host is an IP literal.
    async fn resolve_target(&self, request: &RequestInfo, id: ConnectionId) -> Result<IpAddr> {
        if let Ok(address) = request.target_host.parse::<IpAddr>() {
            return Ok(address);
        }

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        self.dns.resolve(ResolveRequest {
            req_id: self.next_resolve_id.fetch_add(1, Ordering::Relaxed),
            name: request.target_host.clone(),
            // Tunnels are dialed over IPv4; v4-mapped results cover
            // most dual-stack targets.
            ip_version: IpVersion::V4,
            reply_to: reply_tx,
            completion_token: id,
        });

        let reply = tokio::time::timeout(
            self.config.connection.connect_timeout,
            reply_rx.recv(),
        )
        .await
        .map_err(|_| ProxyError::DnsResolution {
            name: request.target_host.clone(),
            message: "resolution timed out".to_string(),
        })?
        .ok_or_else(|| ProxyError::DnsResolution {
            name: request.target_host.clone(),
            message: "resolver unavailable".to_string(),
        })?;

        match reply.outcome {
            ResolveOutcome::Resolved(address) => Ok(address),
            ResolveOutcome::Failed(message) => Err(ProxyError::DnsResolution {
                name: request.target_host.clone(),
                message,
            }),
        }
    }

    /// Dial the resolved target with the configured timeout.
    async fn dial(&self, address: IpAddr, request: &RequestInfo) -> Result<TcpStream> {
        let target_addr = SocketAddr::new(address, request.target_port);
        let connect = TcpStream::connect(target_addr);
        match tokio::time::timeout(self.config.connection.connect_timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::Dial {
                target: request.to_string(),
                source: e,
            }),
            Err(_) => Err(ProxyError::Dial {
                target: request.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connection timed out",
                ),
            }),
        }
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<tokio::task::JoinHandle<Result<()>>>,
    local_addr: SocketAddr,
    stats: Arc<RelayStats>,
}

impl ProxyHandle {
    /// Address the server actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Relay byte counters aggregated over all connections.
    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Check if the server is still running.
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Shut the server down gracefully.
    ///
    /// Sends the shutdown signal and waits briefly for the server task.
    /// If the signal cannot be delivered the task is aborted instead.
    pub async fn shutdown(mut self) {
        let signal_sent = self
            .shutdown_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false);

        if let Some(handle) = self.join_handle.take() {
            if signal_sent {
                let _ =
                    tokio::time::timeout(std::time::Duration::from_secs(2), handle).await;
            } else {
                handle.abort();
            }
        }
    }
}

/// Read the request head up to and including the blank line.
///
/// Returns the head and any bytes that arrived beyond it.
async fn read_request_head(client: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let leftover = buf.split_off(pos + 4);
            return Ok((buf, leftover));
        }
        if buf.len() >= MAX_REQUEST_HEAD {
            return Err(ProxyError::MalformedRequest(
                "request head too large".to_string(),
            ));
        }
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::MalformedRequest(
                "connection closed before end of request head".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Parse `CONNECT host:port HTTP/1.x` out of a request head.
fn parse_connect_request(head: &[u8]) -> Result<RequestInfo> {
    let head = std::str::from_utf8(head)
        .map_err(|_| ProxyError::MalformedRequest("request head is not valid UTF-8".to_string()))?;
    let request_line = head.lines().next().unwrap_or("");
    let mut parts = request_line.split_whitespace();

    let method = parts
        .next()
        .ok_or_else(|| ProxyError::MalformedRequest("empty request line".to_string()))?;
    if method != "CONNECT" {
        return Err(ProxyError::UnsupportedMethod(method.to_string()));
    }

    let authority = parts
        .next()
        .ok_or_else(|| ProxyError::MalformedRequest("missing authority".to_string()))?;
    let version = parts
        .next()
        .ok_or_else(|| ProxyError::MalformedRequest("missing HTTP version".to_string()))?;
    if !version.starts_with("HTTP/1.") {
        return Err(ProxyError::MalformedRequest(format!(
            "unsupported version: {version}"
        )));
    }
    if parts.next().is_some() {
        return Err(ProxyError::MalformedRequest(
            "trailing tokens in request line".to_string(),
        ));
    }

    parse_authority(authority)
}

/// Split `host:port`, accepting bracketed IPv6 literals.
fn parse_authority(authority: &str) -> Result<RequestInfo> {
    let (host, port) = authority.rsplit_once(':').ok_or_else(|| {
        ProxyError::MalformedRequest(format!("missing port in: {authority}"))
    })?;
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::MalformedRequest(format!("invalid port in: {authority}")))?;
    if port == 0 {
        return Err(ProxyError::MalformedRequest(format!(
            "invalid port in: {authority}"
        )));
    }

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(ProxyError::MalformedRequest(format!(
            "empty host in: {authority}"
        )));
    }

    Ok(RequestInfo {
        target_host: host.to_string(),
        target_port: port,
    })
}
