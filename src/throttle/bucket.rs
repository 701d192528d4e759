use tokio::time::{Duration, Instant};

/// Token bucket measured in bytes. Capacity equals one second of traffic.
///
/// Reservations may drive the balance negative; the caller waits out the debt,
/// so bodies larger than the capacity are still paced correctly.
#[derive(Debug)]
pub struct TokenBucket {
    rate: u64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_second: u64) -> Self {
        let capacity = bytes_per_second as f64;
        Self {
            rate: bytes_per_second,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.capacity);
        self.last_refill = now;
    }

    /// Takes `bytes` from the bucket and returns how long the caller must wait
    /// before the bytes count as delivered.
    pub fn reserve(&mut self, bytes: u64) -> Duration {
        if self.rate == 0 || bytes == 0 {
            return Duration::ZERO;
        }
        self.refill();
        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_capacity_is_free() {
        let mut bucket = TokenBucket::new(1000);
        assert_eq!(bucket.reserve(600), Duration::ZERO);
        assert_eq!(bucket.reserve(400), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debt_is_paid_at_configured_rate() {
        let mut bucket = TokenBucket::new(1000);
        bucket.reserve(1000);

        let wait = bucket.reserve(500);
        assert_eq!(wait, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_time_passes() {
        let mut bucket = TokenBucket::new(1000);
        bucket.reserve(1000);

        tokio::time::advance(Duration::from_secs(1)).await;

        assert_eq!(bucket.reserve(1000), Duration::ZERO);
    }
}
