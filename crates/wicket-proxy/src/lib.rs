//! Connection-serving core of the wicket HTTP CONNECT forward proxy.
//!
//! `wicket-proxy` accepts client connections, negotiates the CONNECT
//! method, and relays bytes between client and target under per-direction
//! traffic shaping. Name resolution goes through a message-driven DNS
//! agent with a TTL-bounded cache.
//!
//! # Connection Flow
//!
//! ```text
//! Client connects to proxy
//!         |
//!         v
//! Parse CONNECT request line
//!         |
//!         v
//! DnsHandle.resolve(host)?  -->  dial target
//!         |
//!         v
//! ConnectMethodHandler: write "200 Connection established"
//!         |
//!         v  (handler replaces itself)
//! DataTransferHandler: relay user <-> target until EOF,
//! error, or idle timeout
//! ```
//!
//! # Components
//!
//! - [`ProxyServer`]: acceptor; installs one handler chain per connection
//! - [`ConnectMethodHandler`] / [`DataTransferHandler`]: the per-connection
//!   state machine, driven by [`serve_connection`]
//! - [`TrafficLimiter`]: per-direction read-rate shaping
//! - [`DnsResolver`]: coalescing resolver agent with a 30 s cache
//!

mod connect;
mod context;
mod dns;
mod dns_cache;
mod handler;
mod limiter;
mod server;
mod transfer;

pub use connect::ConnectMethodHandler;
pub use context::{ConnectionConfig, ConnectionId, HandlerContext, RelayStats};
pub use dns::{
    DnsHandle, DnsResolver, DnsStats, NameResolver, ResolveOutcome, ResolveReply,
    ResolveReqId, ResolveRequest, SystemResolver, RESOLVE_INFO_TTL,
};
pub use dns_cache::{IpVersion, LocalCache, ResolveInfo};
pub use handler::{serve_connection, Completion, ConnectionHandler, RemoveReason};
pub use limiter::{
    Direction, RateLimits, Reservation, TokenBucketLimiter, TrafficLimiter,
};
pub use server::{ProxyHandle, ProxyServer, ServerConfig};
pub use transfer::DataTransferHandler;

use std::net::SocketAddr;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur in proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind to address.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A configuration value is out of its accepted range.
    #[error("Invalid config value: {0}")]
    InvalidConfig(String),

    /// The request head could not be parsed.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// The request method is not CONNECT.
    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    /// DNS resolution failed.
    #[error("DNS resolution failed for {name}: {message}")]
    DnsResolution { name: String, message: String },

    /// Dialing the target failed.
    #[error("Connection to {target} failed: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Destination extracted from a CONNECT request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// Target hostname or IP literal, without brackets.
    pub target_host: String,

    /// Target port.
    pub target_port: u16,
}

impl std::fmt::Display for RequestInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.target_host, self.target_port)
    }
}
