//! Bidirectional relay between the client and the target.
//!
//! Each direction owns exactly one buffer of `io_chunk_size` bytes and
//! cycles strictly: reserve read capacity from the limiter, read into
//! the buffer, write the read bytes to the opposite socket, repeat.
//! No second read starts on a direction while its write is in flight,
//! so per-connection memory is capped at two chunks, delivery order per
//! direction follows read order, and a slow sink stalls its source.
//!
//! The two direction loops and an idle watchdog race inside `serve`;
//! whichever finishes first decides the removal reason for the whole
//! connection. A closed source direction leaves nothing to feed the
//! opposite sink, so one dead direction ends the relay.

use crate::context::HandlerContext;
use crate::handler::{remove_reason_for_io_error, Completion, ConnectionHandler, RemoveReason};
use crate::limiter::{Direction, Reservation, TrafficLimiter};
use crate::{ConnectionConfig, ProxyError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, trace, warn};

/// Relays data between an established client/target socket pair.
pub struct DataTransferHandler {
    user_end: TcpStream,
    target_end: TcpStream,
    limiter: Arc<dyn TrafficLimiter>,
    io_chunk_size: usize,
}

impl DataTransferHandler {
    /// # Errors
    /// Returns `ProxyError::InvalidConfig` when `io_chunk_size` is zero.
    pub fn new(
        user_end: TcpStream,
        target_end: TcpStream,
        limiter: Arc<dyn TrafficLimiter>,
        config: &ConnectionConfig,
    ) -> crate::Result<Self> {
        if config.io_chunk_size == 0 {
            return Err(ProxyError::InvalidConfig(
                "io_chunk_size must be positive".to_string(),
            ));
        }
        Ok(Self {
            user_end,
            target_end,
            limiter,
            io_chunk_size: config.io_chunk_size,
        })
    }
}

/// Buffer and bookkeeping for one relay direction. The reading side's
/// label names the direction in logs.
struct DirectionState {
    label: &'static str,
    direction: Direction,
    buf: Box<[u8]>,
    /// Valid prefix of `buf`: bytes read but not yet fully written.
    data_size: usize,
    /// Set while the limiter grants nothing for this direction.
    limit_exceeded: bool,
}

impl DirectionState {
    fn new(label: &'static str, direction: Direction, io_chunk_size: usize) -> Self {
        Self {
            label,
            direction,
            buf: vec![0u8; io_chunk_size].into_boxed_slice(),
            data_size: 0,
            limit_exceeded: false,
        }
    }
}

/// State both direction loops and the watchdog observe.
struct SharedRelayState {
    started_at: Instant,
    /// Milliseconds since `started_at` of the last successful read.
    last_read_millis: AtomicU64,
    user_end_alive: AtomicBool,
    target_end_alive: AtomicBool,
}

impl SharedRelayState {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_read_millis: AtomicU64::new(0),
            user_end_alive: AtomicBool::new(true),
            target_end_alive: AtomicBool::new(true),
        }
    }

    fn note_read(&self) {
        let elapsed = self.started_at.elapsed().as_millis();
        let elapsed = u64::try_from(elapsed).unwrap_or(u64::MAX);
        self.last_read_millis.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_read_millis.load(Ordering::Relaxed));
        self.started_at.elapsed().saturating_sub(last)
    }

    fn mark_dead(&self, direction: Direction) {
        match direction {
            Direction::FromUser => self.user_end_alive.store(false, Ordering::Relaxed),
            Direction::FromTarget => self.target_end_alive.store(false, Ordering::Relaxed),
        }
    }

    fn both_dead(&self) -> bool {
        !self.user_end_alive.load(Ordering::Relaxed)
            && !self.target_end_alive.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ConnectionHandler for DataTransferHandler {
    fn name(&self) -> &'static str {
        "data-transfer-handler"
    }

    async fn serve(self: Box<Self>, ctx: &HandlerContext) -> crate::Result<Completion> {
        let Self {
            user_end,
            target_end,
            limiter,
            io_chunk_size,
        } = *self;

        let (mut user_rd, mut user_wr) = user_end.into_split();
        let (mut target_rd, mut target_wr) = target_end.into_split();

        let mut from_user = DirectionState::new("user-end", Direction::FromUser, io_chunk_size);
        let mut from_target =
            DirectionState::new("target-end", Direction::FromTarget, io_chunk_size);

        let shared = SharedRelayState::new();
        let tick_period = ctx.config.tick_period();

        let reason = {
            let user_to_target = relay_direction(
                ctx,
                &mut from_user,
                &mut user_rd,
                &mut target_wr,
                "target-end",
                &limiter,
                &shared,
                tick_period,
            );
            let target_to_user = relay_direction(
                ctx,
                &mut from_target,
                &mut target_rd,
                &mut user_wr,
                "user-end",
                &limiter,
                &shared,
                tick_period,
            );
            let watchdog = idle_watchdog(ctx, &shared, tick_period);
            tokio::pin!(user_to_target, target_to_user, watchdog);

            // First terminal event wins; the other loops are dropped
            // mid-await, which releases any reservation they hold.
            tokio::select! {
                reason = &mut user_to_target => reason,
                reason = &mut target_to_user => reason,
                reason = &mut watchdog => reason,
            }
        };

        // Shut both channels down, swallowing errors; the sockets close
        // when the halves drop.
        let _ = target_wr.shutdown().await;
        let _ = user_wr.shutdown().await;

        Ok(Completion::Remove(reason))
    }
}

/// One direction's half-duplex cycle, run to its terminal event.
#[allow(clippy::too_many_arguments)]
async fn relay_direction(
    ctx: &HandlerContext,
    dir: &mut DirectionState,
    src: &mut OwnedReadHalf,
    sink: &mut OwnedWriteHalf,
    sink_label: &'static str,
    limiter: &Arc<dyn TrafficLimiter>,
    shared: &SharedRelayState,
    tick_period: Duration,
) -> RemoveReason {
    loop {
        let reservation = Reservation::reserve(limiter, dir.direction, dir.buf.len());
        let capacity = reservation.capacity();
        if capacity == 0 {
            if !dir.limit_exceeded {
                dir.limit_exceeded = true;
                trace!(
                    connection = ctx.id,
                    from = dir.label,
                    "traffic limit exceeded, waiting for next tick"
                );
            }
            // Re-check the limiter on the next tick; the flag either
            // clears there or stays.
            sleep(tick_period).await;
            continue;
        }
        dir.limit_exceeded = false;

        match src.read(&mut dir.buf[..capacity]).await {
            Ok(0) => {
                reservation.complete(0);
                shared.mark_dead(dir.direction);
                return RemoveReason::NormalCompletion;
            }
            Ok(n) => {
                reservation.complete(n);
                dir.data_size = n;
                shared.note_read();
                ctx.stats.add(dir.direction, n as u64);

                match sink.write_all(&dir.buf[..dir.data_size]).await {
                    Ok(()) => {
                        dir.data_size = 0;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WriteZero => {
                        // The write made no progress on an open socket,
                        // breaking the all-or-error promise relied on here.
                        shared.mark_dead(dir.direction);
                        error!(
                            connection = ctx.id,
                            to = sink_label,
                            data_size = dir.data_size,
                            "unexpected write result: short write"
                        );
                        return RemoveReason::IoError;
                    }
                    Err(e) => {
                        shared.mark_dead(dir.direction);
                        debug!(
                            connection = ctx.id,
                            to = sink_label,
                            error = %e,
                            "error writing data"
                        );
                        return remove_reason_for_io_error(&e);
                    }
                }
            }
            Err(e) => {
                reservation.complete(0);
                shared.mark_dead(dir.direction);
                // All previously read bytes were already written to the
                // sink, so a dead source leaves nothing to deliver.
                return match e.kind() {
                    std::io::ErrorKind::ConnectionAborted => {
                        RemoveReason::CurrentOperationCanceled
                    }
                    _ => {
                        debug!(
                            connection = ctx.id,
                            from = dir.label,
                            error = %e,
                            "error reading data"
                        );
                        RemoveReason::IoError
                    }
                };
            }
        }
    }
}

/// Periodic idle check for the whole relay.
async fn idle_watchdog(
    ctx: &HandlerContext,
    shared: &SharedRelayState,
    tick_period: Duration,
) -> RemoveReason {
    loop {
        sleep(tick_period).await;

        // Should not happen: a dead direction ends the relay before the
        // other can die. Checked anyway so the state cannot linger.
        if shared.both_dead() {
            warn!(connection = ctx.id, "both connections are closed");
            return RemoveReason::UnexpectedAndUnsupportedCase;
        }

        if shared.idle_for() >= ctx.config.idle_connection_timeout {
            warn!(connection = ctx.id, "no data read for long time");
            return RemoveReason::NoActivityForTooLong;
        }
    }
}
