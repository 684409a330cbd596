use std::time::Instant;

/// Token bucket rate limiter, one instance per connection: capacity sets
/// the burst size, refill_rate the steady-state envelopes/sec.
#[derive(Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume a token, returns true if successful.
    pub fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let new_tokens = elapsed * self.refill_rate;
        self.tokens = (self.tokens + new_tokens).min(self.capacity as f64);
        self.last_refill = now;
    }

    /// Milliseconds until a token is available, for the `retry_after_ms`
    /// field on a `RateLimited` error envelope.
    pub fn retry_after_ms(&self) -> u64 {
        if self.tokens >= 1.0 {
            0
        } else {
            let needed = 1.0 - self.tokens;
            ((needed / self.refill_rate) * 1000.0).ceil() as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn consumes_up_to_capacity_then_rejects() {
        let mut bucket = TokenBucket::new(2, 1.0);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[test]
    fn refills_over_time() {
        let mut bucket = TokenBucket::new(1, 10.0);
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
        sleep(Duration::from_millis(150));
        assert!(bucket.try_consume());
    }

    #[test]
    fn retry_after_is_zero_when_tokens_available() {
        let bucket = TokenBucket::new(5, 1.0);
        assert_eq!(bucket.retry_after_ms(), 0);
    }
}
