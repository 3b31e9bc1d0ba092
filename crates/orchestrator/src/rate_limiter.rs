use std::time::Duration;
use tracing::trace;

/// Burst pacing: after every `burst` hosts, pause for `delay`.
///
/// A limiter built without a burst size never pauses.
pub struct BurstLimiter {
    burst: Option<usize>,
    delay: Duration,
    in_burst: usize,
    pauses: u64,
}

impl BurstLimiter {
    pub fn new(burst: Option<usize>, delay: Duration) -> Self {
        Self {
            burst: burst.filter(|b| *b > 0),
            delay,
            in_burst: 0,
            pauses: 0,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, Duration::ZERO)
    }

    /// Account for one host about to be probed, pausing first if the current
    /// burst is full.
    pub async fn acquire(&mut self) {
        let Some(burst) = self.burst else {
            return;
        };
        if self.in_burst >= burst {
            trace!(burst, delay_ms = self.delay.as_millis() as u64, "burst complete, pausing");
            tokio::time::sleep(self.delay).await;
            self.pauses += 1;
            self.in_burst = 0;
        }
        self.in_burst += 1;
    }

    pub fn is_limited(&self) -> bool {
        self.burst.is_some()
    }

    /// Number of pauses taken so far.
    pub fn pauses(&self) -> u64 {
        self.pauses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pauses_after_each_full_burst() {
        let mut limiter = BurstLimiter::new(Some(3), Duration::from_millis(100));
        let start = tokio::time::Instant::now();
        for _ in 0..7 {
            limiter.acquire().await;
        }
        // 7 hosts in bursts of 3 -> pauses before host 4 and host 7
        assert_eq!(limiter.pauses(), 2);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_limiter_never_waits() {
        let mut limiter = BurstLimiter::new(None, Duration::from_secs(10));
        let start = tokio::time::Instant::now();
        for _ in 0..1000 {
            limiter.acquire().await;
        }
        assert!(!limiter.is_limited());
        assert_eq!(limiter.pauses(), 0);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn zero_burst_means_unlimited() {
        assert!(!BurstLimiter::new(Some(0), Duration::from_millis(1)).is_limited());
    }
}
