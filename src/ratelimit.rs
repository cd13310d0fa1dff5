//! Bandwidth limiting for rebuild traffic.
//!
//! Rebuild copies are paced by a token bucket denominated in bytes. The
//! bucket holds one second of burst at the configured rate and refills
//! continuously. Time is read from `tokio::time::Instant`, so a paused test
//! runtime drives the limiter deterministically.
//!
//! # Example
//!
//! ```rust
//! use flexblock::ratelimit::RebuildThrottle;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let throttle = RebuildThrottle::new(100);
//! let segment = throttle.segment_size();
//! assert!(throttle.try_acquire(segment));
//! # }
//! ```

use crate::types::{PoolId, MIB};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// Largest unit of data moved per rebuild copy step.
pub const MAX_SEGMENT: u64 = MIB;

/// Token bucket over bytes.
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum tokens (capacity).
    capacity: AtomicU64,
    /// Current available tokens.
    tokens: AtomicU64,
    /// Tokens added per second.
    refill_rate: AtomicU64,
    /// Last refill time.
    last_refill: Mutex<Instant>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u64, refill_rate: u64) -> Self {
        Self {
            capacity: AtomicU64::new(capacity),
            tokens: AtomicU64::new(capacity),
            refill_rate: AtomicU64::new(refill_rate),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    /// Try to acquire `n` tokens. All or nothing.
    pub fn try_acquire_n(&self, n: u64) -> bool {
        self.refill();

        loop {
            let current = self.tokens.load(Ordering::Relaxed);
            if current < n {
                return false;
            }
            if self
                .tokens
                .compare_exchange_weak(current, current - n, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Current available tokens.
    pub fn available(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Change rate and capacity. Tokens above the new capacity are dropped.
    pub fn reconfigure(&self, capacity: u64, refill_rate: u64) {
        self.refill();
        self.capacity.store(capacity, Ordering::Relaxed);
        self.refill_rate.store(refill_rate, Ordering::Relaxed);
        let current = self.tokens.load(Ordering::Relaxed);
        self.tokens.store(current.min(capacity), Ordering::Relaxed);
    }

    fn refill(&self) {
        let mut last_refill = self.last_refill.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(*last_refill);

        if elapsed.as_millis() > 0 {
            let rate = self.refill_rate.load(Ordering::Relaxed);
            let new_tokens = (elapsed.as_secs_f64() * rate as f64) as u64;
            if new_tokens > 0 {
                let capacity = self.capacity.load(Ordering::Relaxed);
                let current = self.tokens.load(Ordering::Relaxed);
                let new_value = current.saturating_add(new_tokens).min(capacity);
                self.tokens.store(new_value, Ordering::Relaxed);
                *last_refill = now;
            }
        }
    }
}

/// Per-pool rebuild bandwidth limiter.
#[derive(Debug)]
pub struct RebuildThrottle {
    bucket: TokenBucket,
    rate_mbps: AtomicU64,
}

impl RebuildThrottle {
    /// Create a throttle allowing `rate_mbps` MiB per second.
    pub fn new(rate_mbps: u64) -> Self {
        let rate = Self::bytes_per_sec(rate_mbps);
        Self {
            bucket: TokenBucket::new(rate, rate),
            rate_mbps: AtomicU64::new(rate_mbps),
        }
    }

    fn bytes_per_sec(rate_mbps: u64) -> u64 {
        rate_mbps.max(1).saturating_mul(MIB)
    }

    /// Configured rate in MiB/s.
    pub fn rate_mbps(&self) -> u64 {
        self.rate_mbps.load(Ordering::Relaxed)
    }

    /// Configured rate in bytes per second.
    pub fn rate_bytes_per_sec(&self) -> u64 {
        Self::bytes_per_sec(self.rate_mbps())
    }

    /// Change the rate; takes effect on the next acquisition.
    pub fn set_rate(&self, rate_mbps: u64) {
        let rate = Self::bytes_per_sec(rate_mbps);
        self.rate_mbps.store(rate_mbps, Ordering::Relaxed);
        self.bucket.reconfigure(rate, rate);
    }

    /// Bytes to move per copy step.
    pub fn segment_size(&self) -> u64 {
        MAX_SEGMENT.min(self.bucket.capacity())
    }

    /// Take budget for `bytes`, or nothing.
    pub fn try_acquire(&self, bytes: u64) -> bool {
        self.bucket.try_acquire_n(bytes)
    }

    /// Budget currently available.
    pub fn available(&self) -> u64 {
        self.bucket.available()
    }
}

/// Throttles keyed by pool.
#[derive(Debug, Default)]
pub struct ThrottleRegistry {
    throttles: RwLock<HashMap<PoolId, Arc<RebuildThrottle>>>,
}

impl ThrottleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Throttle for `pool_id`, created at `rate_mbps` on first use.
    pub fn get_or_create(&self, pool_id: PoolId, rate_mbps: u64) -> Arc<RebuildThrottle> {
        if let Some(throttle) = self.throttles.read().get(&pool_id) {
            return Arc::clone(throttle);
        }
        let mut throttles = self.throttles.write();
        Arc::clone(
            throttles
                .entry(pool_id)
                .or_insert_with(|| Arc::new(RebuildThrottle::new(rate_mbps))),
        )
    }

    /// Update a pool's rate if it has a throttle.
    pub fn set_rate(&self, pool_id: PoolId, rate_mbps: u64) {
        if let Some(throttle) = self.throttles.read().get(&pool_id) {
            throttle.set_rate(rate_mbps);
        }
    }

    pub fn remove(&self, pool_id: PoolId) {
        self.throttles.write().remove(&pool_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_basic() {
        let bucket = TokenBucket::new(10, 10);

        for _ in 0..10 {
            assert!(bucket.try_acquire_n(1));
        }
        assert!(!bucket.try_acquire_n(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_refill() {
        let bucket = TokenBucket::new(100, 1000);
        assert!(bucket.try_acquire_n(100));
        assert!(!bucket.try_acquire_n(1));

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(bucket.try_acquire_n(50));
        assert!(!bucket.try_acquire_n(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let bucket = TokenBucket::new(100, 1000);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!bucket.try_acquire_n(101));
        assert!(bucket.try_acquire_n(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuild_throttle_rate() {
        let throttle = RebuildThrottle::new(10);
        assert_eq!(throttle.rate_bytes_per_sec(), 10 * MIB);
        assert_eq!(throttle.segment_size(), MIB);

        let mut moved = 0;
        while throttle.try_acquire(MIB) {
            moved += MIB;
        }
        assert_eq!(moved, 10 * MIB);

        tokio::time::advance(Duration::from_millis(500)).await;
        let mut refilled = 0;
        while throttle.try_acquire(MIB) {
            refilled += MIB;
        }
        assert_eq!(refilled, 5 * MIB);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_shares_per_pool() {
        let registry = ThrottleRegistry::new();
        let a = registry.get_or_create(1, 10);
        let b = registry.get_or_create(1, 500);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.rate_mbps(), 10);

        registry.set_rate(1, 20);
        assert_eq!(a.rate_mbps(), 20);

        let other = registry.get_or_create(2, 5);
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rate_shrinks_budget() {
        let throttle = RebuildThrottle::new(100);
        throttle.set_rate(2);
        assert_eq!(throttle.rate_mbps(), 2);
        assert!(throttle.available() <= 2 * MIB);
        assert!(throttle.try_acquire(2 * MIB));
        assert!(!throttle.try_acquire(MIB));
    }
}
