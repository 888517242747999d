//! Rate limiting for task execution.
//!
//! Workers call [`RateLimiter::acquire`] before every transfer so a burst of
//! queued tasks cannot hammer a destination site.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use catalog_replication::resilience::{RateLimiter, RateLimitConfig};
//!
//! // 50 transfers/sec with a burst of 10
//! let limiter = RateLimiter::new(RateLimitConfig { burst_size: 10, refill_rate: 50 });
//! limiter.acquire().await; // Blocks if over limit
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;

/// Token bucket settings: tokens refill at `refill_rate` per second, up to
/// `burst_size` tokens. Each transfer consumes one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_size: 10,
            refill_rate: 50,
        }
    }
}

/// Token bucket rate limiter shared by all workers of a pool.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        // Zero is clamped to one token rather than rejected.
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait for a permit. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
