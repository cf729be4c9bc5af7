//! Per-connection context shared by every handler of a connection.

use crate::dns::DnsHandle;
use crate::limiter::Direction;
use crate::{ProxyError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Opaque connection identifier, unique within a process lifetime.
pub type ConnectionId = u64;

/// Immutable configuration snapshot handed to every handler.
///
/// One snapshot is shared by all handlers attached to a connection over
/// its lifetime; reconfiguration only affects connections accepted later.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Size of the per-direction relay buffer in bytes.
    pub io_chunk_size: usize,

    /// Connections with no data read for this long are dropped.
    pub idle_connection_timeout: Duration,

    /// Timeout for dialing the target host.
    pub connect_timeout: Duration,

    /// Eviction cadence of the DNS cache.
    pub cache_cleanup_period: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            io_chunk_size: 32 * 1024,
            idle_connection_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            cache_cleanup_period: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    /// Check value ranges that the type system cannot express.
    ///
    /// # Errors
    /// Returns `ProxyError::InvalidConfig` when `io_chunk_size` is zero or a
    /// timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.io_chunk_size == 0 {
            return Err(ProxyError::InvalidConfig(
                "io_chunk_size must be positive".to_string(),
            ));
        }
        if self.idle_connection_timeout.is_zero() {
            return Err(ProxyError::InvalidConfig(
                "idle_connection_timeout must be positive".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ProxyError::InvalidConfig(
                "connect_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Cadence of handler timer ticks (idle checks, shaping retries).
    ///
    /// A quarter of the idle timeout, clamped to [10 ms, 1 s], so the idle
    /// bound is checked several times within one timeout window.
    pub(crate) fn tick_period(&self) -> Duration {
        (self.idle_connection_timeout / 4)
            .clamp(Duration::from_millis(10), Duration::from_secs(1))
    }
}

/// Relay byte counters, one per direction, updated as reads complete.
#[derive(Debug, Default)]
pub struct RelayStats {
    bytes_from_user: AtomicU64,
    bytes_from_target: AtomicU64,
}

impl RelayStats {
    /// Bytes read so far on the given direction. Monotonic.
    pub fn bytes(&self, direction: Direction) -> u64 {
        match direction {
            Direction::FromUser => self.bytes_from_user.load(Ordering::Relaxed),
            Direction::FromTarget => self.bytes_from_target.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::FromUser => {
                self.bytes_from_user.fetch_add(bytes, Ordering::Relaxed);
            }
            Direction::FromTarget => {
                self.bytes_from_target.fetch_add(bytes, Ordering::Relaxed);
            }
        }
    }
}

/// Shared read-only configuration plus ambient services for one connection.
///
/// Cheap to clone; all handlers installed for the connection observe the
/// same context.
#[derive(Clone)]
pub struct HandlerContext {
    /// Identifier of the connection this context belongs to.
    pub id: ConnectionId,

    /// Configuration snapshot.
    pub config: Arc<ConnectionConfig>,

    /// Handle to the DNS resolver agent.
    pub dns: DnsHandle,

    /// Relay traffic counters.
    pub stats: Arc<RelayStats>,
}

impl HandlerContext {
    /// Build a context for connection `id` with the given snapshot.
    pub fn new(
        id: ConnectionId,
        config: Arc<ConnectionConfig>,
        dns: DnsHandle,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            id,
            config,
            dns,
            stats,
        }
    }
}
