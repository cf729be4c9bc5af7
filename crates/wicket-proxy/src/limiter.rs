//! Per-connection traffic shaping.
//!
//! Each connection owns one limiter with an independent token bucket per
//! relay direction. The relay asks for a read grant before every read;
//! a zero grant means the direction is rate-capped until the next timer
//! tick. Grants are returned through an RAII [`Reservation`] so unused
//! capacity flows back to the bucket on every path, including when the
//! read future is dropped mid-flight.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

/// One half of the bidirectional relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Data read from the client, flowing to the target.
    FromUser,
    /// Data read from the target, flowing to the client.
    FromTarget,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::FromUser => f.write_str("from-user"),
            Direction::FromTarget => f.write_str("from-target"),
        }
    }
}

/// Read-rate policy consulted before every relay read.
///
/// Implementations must be callable from both direction loops of one
/// connection, so the methods take `&self`.
pub trait TrafficLimiter: Send + Sync {
    /// Grant up to `desired` bytes for a read on `direction`.
    ///
    /// Returns the granted capacity; 0 means the direction is rate-capped
    /// right now and the caller must wait for the next tick.
    fn reserve_read_portion(&self, direction: Direction, desired: usize) -> usize;

    /// Return a grant. `used` is the number of bytes actually read;
    /// `granted - used` flows back into the budget.
    fn release(&self, direction: Direction, granted: usize, used: usize);
}

/// RAII wrapper around a read grant.
///
/// Call [`Reservation::complete`] with the byte count once the read
/// finishes (0 on a failed read). If the reservation is dropped without
/// completing — the read future was cancelled — the full grant is
/// returned, so release happens exactly once on every path.
pub struct Reservation {
    limiter: Arc<dyn TrafficLimiter>,
    direction: Direction,
    capacity: usize,
    armed: bool,
}

impl Reservation {
    /// Reserve up to `desired` bytes for a read on `direction`.
    pub fn reserve(
        limiter: &Arc<dyn TrafficLimiter>,
        direction: Direction,
        desired: usize,
    ) -> Self {
        let capacity = limiter.reserve_read_portion(direction, desired);
        Self {
            limiter: Arc::clone(limiter),
            direction,
            capacity,
            armed: capacity > 0,
        }
    }

    /// Granted capacity; 0 means the direction is rate-capped.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Report the read outcome and return unused capacity.
    pub fn complete(mut self, used: usize) {
        if self.armed {
            self.limiter.release(self.direction, self.capacity, used);
            self.armed = false;
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            // Cancelled before the read completed: nothing was consumed.
            self.limiter.release(self.direction, self.capacity, 0);
        }
    }
}

/// Per-direction read rates in bytes per second. 0 disables shaping.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimits {
    pub from_user_bytes_per_sec: u64,
    pub from_target_bytes_per_sec: u64,
}

impl RateLimits {
    fn rate(&self, direction: Direction) -> u64 {
        match direction {
            Direction::FromUser => self.from_user_bytes_per_sec,
            Direction::FromTarget => self.from_target_bytes_per_sec,
        }
    }
}

/// Token-bucket [`TrafficLimiter`]: each direction refills at its
/// configured rate and holds at most one second's worth of budget.
pub struct TokenBucketLimiter {
    from_user: Option<Mutex<Bucket>>,
    from_target: Option<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    /// Refill rate, bytes per second.
    rate: u64,
    /// Currently spendable bytes, capped at `rate`.
    available: u64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate: u64) -> Self {
        Self {
            rate,
            // Start full so a fresh connection is not stalled.
            available: rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        let add = (u128::from(self.rate) * elapsed.as_millis()) / 1000;
        if add > 0 {
            let add = u64::try_from(add).unwrap_or(u64::MAX);
            self.available = self.available.saturating_add(add).min(self.rate);
            self.last_refill = now;
        }
    }

    fn take(&mut self, desired: u64) -> u64 {
        self.refill(Instant::now());
        let granted = desired.min(self.available);
        self.available -= granted;
        granted
    }

    fn put_back(&mut self, unused: u64) {
        self.available = self.available.saturating_add(unused).min(self.rate);
    }
}

impl TokenBucketLimiter {
    /// Build a limiter for one connection. A rate of 0 leaves that
    /// direction unshaped.
    pub fn new(limits: RateLimits) -> Self {
        let bucket = |direction| {
            let rate = limits.rate(direction);
            (rate > 0).then(|| Mutex::new(Bucket::new(rate)))
        };
        Self {
            from_user: bucket(Direction::FromUser),
            from_target: bucket(Direction::FromTarget),
        }
    }

    fn bucket(&self, direction: Direction) -> Option<&Mutex<Bucket>> {
        match direction {
            Direction::FromUser => self.from_user.as_ref(),
            Direction::FromTarget => self.from_target.as_ref(),
        }
    }
}

impl TrafficLimiter for TokenBucketLimiter {
    fn reserve_read_portion(&self, direction: Direction, desired: usize) -> usize {
        match self.bucket(direction) {
            None => desired,
            Some(bucket) => {
                let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
                let granted = bucket.take(desired as u64);
                usize::try_from(granted).unwrap_or(desired)
            }
        }
    }

    fn release(&self, direction: Direction, granted: usize, used: usize) {
        if let Some(bucket) = self.bucket(direction) {
            let unused = granted.saturating_sub(used) as u64;
            if unused > 0 {
                let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
                bucket.put_back(unused);
            }
        }
    }
}
