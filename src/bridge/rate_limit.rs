//! Pacing of outbound sends.
//!
//! A [`SendPacer`] wraps a `governor` GCRA limiter built from the session's
//! [`RateLimit`]: `capacity` sends may go out back to back, then one per
//! `1 / refill_per_sec` seconds.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::gateway::RateLimit;

const MIN_REFILL_PER_SEC: f64 = 0.001;

/// Clock that follows tokio time, so a paused runtime also pauses pacing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now().into_std()
    }
}

pub struct SendPacer<C: Clock = TokioClock> {
    limit: RateLimit,
    clock: C,
    limiter: RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<C::Instant>>,
}

impl SendPacer {
    pub fn new(limit: RateLimit) -> Self {
        Self::with_clock(limit, TokioClock)
    }
}

impl<C: Clock> SendPacer<C> {
    /// A pacer that starts with a full burst.
    pub fn with_clock(limit: RateLimit, clock: C) -> Self {
        let limit = sanitize(limit);
        let limiter = RateLimiter::direct_with_clock(quota(limit), &clock);
        Self { limit, clock, limiter }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Switch to a new limit. The limiter is rebuilt, so the new limit
    /// starts with a full burst.
    pub fn reconfigure(&mut self, limit: RateLimit) {
        let limit = sanitize(limit);
        if limit != self.limit {
            *self = Self::with_clock(limit, self.clock.clone());
        }
    }

    /// Take a send slot, or report how long until one is free.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.limiter.check().map_err(|not_until| {
            not_until
                .wait_time_from(self.clock.now())
                .max(Duration::from_millis(1))
        })
    }
}

fn quota(limit: RateLimit) -> Quota {
    let burst = NonZeroU32::new(limit.capacity).unwrap_or(NonZeroU32::MIN);
    Quota::with_period(Duration::from_secs_f64(1.0 / limit.refill_per_sec))
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
        .allow_burst(burst)
}

fn sanitize(limit: RateLimit) -> RateLimit {
    let refill_per_sec = if limit.refill_per_sec.is_finite() {
        limit.refill_per_sec.max(MIN_REFILL_PER_SEC)
    } else {
        MIN_REFILL_PER_SEC
    };
    RateLimit {
        capacity: limit.capacity.max(1),
        refill_per_sec,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use governor::clock::FakeRelativeClock;
    use tokio::time::{sleep, Instant};

    fn limit(capacity: u32, refill_per_sec: f64) -> RateLimit {
        RateLimit {
            capacity,
            refill_per_sec,
        }
    }

    #[test]
    fn test_burst_then_wait() {
        let clock = FakeRelativeClock::default();
        let pacer = SendPacer::with_clock(limit(3, 2.0), clock.clone());
        for _ in 0..3 {
            assert!(pacer.try_acquire().is_ok());
        }

        let wait = pacer.try_acquire().unwrap_err();
        assert!(wait > Duration::from_millis(400) && wait <= Duration::from_millis(500));

        clock.advance(wait);
        assert!(pacer.try_acquire().is_ok());
        assert!(pacer.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_bound_holds() {
        let cap = 4;
        let rate = 2.0;
        let pacer = SendPacer::new(limit(cap, rate));
        let mut sent = Vec::new();
        let start = Instant::now();
        while Instant::now() - start < Duration::from_secs(10) {
            match pacer.try_acquire() {
                Ok(()) => sent.push(Instant::now()),
                Err(wait) => sleep(wait).await,
            }
        }

        for (i, first) in sent.iter().enumerate() {
            for (j, last) in sent.iter().enumerate().skip(i) {
                let window = (*last - *first).as_secs_f64();
                let count = (j - i + 1) as f64;
                assert!(
                    count <= f64::from(cap) + window * rate + 1e-6,
                    "{} sends in {:.3}s",
                    count,
                    window
                );
            }
        }
        assert!(sent.len() >= 20);
    }

    #[test]
    fn test_reconfigure_rebuilds_limiter() {
        let clock = FakeRelativeClock::default();
        let mut pacer = SendPacer::with_clock(limit(10, 1.0), clock);
        pacer.reconfigure(limit(2, 1.0));
        assert_eq!(pacer.limit().capacity, 2);
        assert!(pacer.try_acquire().is_ok());
        assert!(pacer.try_acquire().is_ok());
        assert!(pacer.try_acquire().is_err());
    }

    #[test]
    fn test_same_limit_keeps_state() {
        let clock = FakeRelativeClock::default();
        let mut pacer = SendPacer::with_clock(limit(1, 1.0), clock);
        assert!(pacer.try_acquire().is_ok());
        pacer.reconfigure(limit(1, 1.0));
        assert!(pacer.try_acquire().is_err());
    }

    #[test]
    fn test_degenerate_limits() {
        let pacer = SendPacer::with_clock(limit(0, 0.0), FakeRelativeClock::default());
        assert_eq!(pacer.limit().capacity, 1);
        assert!(pacer.limit().refill_per_sec > 0.0);
        assert!(pacer.try_acquire().is_ok());
        assert!(pacer.try_acquire().is_err());
    }
}
