use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};

/// Global request-start gate: no two acquisitions happen closer together
/// than `60/rpm` seconds, no matter how many workers are waiting. The slot
/// marker is advanced from whichever is later, the marker or the current
/// time, so idle periods never accumulate a burst budget and cancelled
/// waits never push reservations ahead of the clock.
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(rpm: u32) -> Self {
        let interval = if rpm == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(60.0 / rpm as f64)
        };
        Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Suspends the caller until its slot arrives. Holding the lock across
    /// the wait serializes racing callers, which is what keeps the marker
    /// arithmetic consistent; grant order among waiters is unspecified.
    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let mut slot = self.next_slot.lock().await;
        let now = Instant::now();
        if *slot > now {
            sleep_until(*slot).await;
        }
        *slot = (*slot).max(now) + self.interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn consecutive_acquisitions_are_spaced_by_the_interval() {
        let limiter = RateLimiter::new(60);
        limiter.acquire().await;
        let first = Instant::now();
        limiter.acquire().await;
        let second = Instant::now();
        limiter.acquire().await;
        let third = Instant::now();

        assert!(second - first >= Duration::from_secs(1));
        assert!(third - second >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_does_not_accumulate_burst_budget() {
        let limiter = RateLimiter::new(60);
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        limiter.acquire().await;
        let after_idle = Instant::now();
        limiter.acquire().await;
        let next = Instant::now();

        // The long idle period buys exactly one immediate slot; the one
        // after it still waits the full interval.
        assert!(next - after_idle >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_share_a_slot() {
        let limiter = Arc::new(RateLimiter::new(60));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }
        let mut grants = Vec::new();
        for handle in handles {
            grants.push(handle.await.unwrap());
        }
        grants.sort();
        for pair in grants.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rpm_disables_the_gate() {
        let limiter = RateLimiter::new(0);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert_eq!(Instant::now(), start);
    }
}
