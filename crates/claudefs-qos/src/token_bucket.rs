//! Lazily refilled token bucket.
//!
//! Tokens accrue at `rate` per second up to `burst` and are computed from the
//! time elapsed since the last refill on every query; there is no background
//! timer. Fractional tokens are kept between calls so that very low rates still
//! make progress.
//!
//! A bucket is plain data: callers serialize access (the dispatchers keep all
//! buckets behind their scheduling lock).

const NS_PER_SEC: f64 = 1_000_000_000.0;

/// Token bucket used for assured, ceiling and shared-pool rates.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Refill rate in tokens per second.
    rate: f64,
    /// Maximum number of accumulated tokens.
    burst: f64,
    /// Current number of tokens, always within `0..=burst`.
    tokens: f64,
    /// Timestamp of the last refill in nanoseconds.
    last_refill_ns: u64,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(rate: f64, burst: f64, now_ns: u64) -> Self {
        let burst = burst.max(0.0);
        Self::with_tokens(rate, burst, burst, now_ns)
    }

    /// Creates a bucket holding `tokens` (clamped to the burst cap).
    pub fn with_tokens(rate: f64, burst: f64, tokens: f64, now_ns: u64) -> Self {
        let burst = burst.max(0.0);
        Self {
            rate: rate.max(0.0),
            burst,
            tokens: tokens.clamp(0.0, burst),
            last_refill_ns: now_ns,
        }
    }

    /// Returns the refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Returns the burst cap.
    pub fn burst(&self) -> f64 {
        self.burst
    }

    /// Returns the tokens held as of the last refill.
    pub fn available(&self) -> f64 {
        self.tokens
    }

    fn accrued(&self, now_ns: u64) -> f64 {
        let elapsed_ns = now_ns.saturating_sub(self.last_refill_ns);
        elapsed_ns as f64 / NS_PER_SEC * self.rate
    }

    /// Refills the bucket based on elapsed time.
    ///
    /// Returns the tokens that accrued beyond the burst cap. Those tokens have
    /// expired; callers that pool unused capacity can redistribute them.
    pub fn refill(&mut self, now_ns: u64) -> f64 {
        if now_ns <= self.last_refill_ns {
            return 0.0;
        }

        let total = self.tokens + self.accrued(now_ns);
        self.last_refill_ns = now_ns;
        if total > self.burst {
            self.tokens = self.burst;
            total - self.burst
        } else {
            self.tokens = total;
            0.0
        }
    }

    /// Refills, then consumes `n` tokens if that many are available.
    ///
    /// Leaves the token count untouched and returns false otherwise.
    pub fn try_consume(&mut self, n: f64, now_ns: u64) -> bool {
        self.refill(now_ns);

        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Returns true if `n` tokens would be available at `now_ns`, without mutating.
    pub fn has_tokens(&self, n: f64, now_ns: u64) -> bool {
        self.projected(now_ns) >= n
    }

    fn projected(&self, now_ns: u64) -> f64 {
        (self.tokens + self.accrued(now_ns)).min(self.burst)
    }

    /// Changes the refill rate.
    ///
    /// Tokens accrued under the old rate are credited first so the switch does
    /// not lose them.
    pub fn modify_rate(&mut self, new_rate: f64, now_ns: u64) {
        self.refill(now_ns);
        self.rate = new_rate.max(0.0);
    }

    /// Changes the burst cap, discarding tokens above the new cap.
    pub fn set_burst(&mut self, burst: f64) {
        self.burst = burst.max(0.0);
        self.tokens = self.tokens.min(self.burst);
    }

    /// Adds tokens from outside the refill schedule, up to the burst cap.
    ///
    /// Returns the number of tokens actually accepted.
    pub fn deposit(&mut self, tokens: f64) -> f64 {
        if tokens <= 0.0 {
            return 0.0;
        }
        let accepted = tokens.min(self.burst - self.tokens).max(0.0);
        self.tokens += accepted;
        accepted
    }

    /// Nanoseconds until `n` tokens are available, or `None` if they never will be
    /// (zero rate, or `n` above the burst cap).
    pub fn time_until(&self, n: f64, now_ns: u64) -> Option<u64> {
        if n > self.burst {
            return None;
        }
        let have = self.projected(now_ns);
        if have >= n {
            return Some(0);
        }
        if self.rate <= 0.0 {
            return None;
        }
        let wait_ns = ((n - have) / self.rate * NS_PER_SEC).ceil();
        Some(wait_ns as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: u64 = 1_000_000_000;

    #[test]
    fn test_new_bucket_is_full() {
        let bucket = TokenBucket::new(10.0, 100.0, 0);
        assert_eq!(bucket.available(), 100.0);
        assert_eq!(bucket.rate(), 10.0);
        assert_eq!(bucket.burst(), 100.0);
    }

    #[test]
    fn test_try_consume() {
        let mut bucket = TokenBucket::new(10.0, 100.0, 0);
        assert!(bucket.try_consume(30.0, 0));
        assert_eq!(bucket.available(), 70.0);
    }

    #[test]
    fn test_try_consume_insufficient_leaves_state() {
        let mut bucket = TokenBucket::with_tokens(10.0, 10.0, 2.0, 0);
        assert!(!bucket.try_consume(5.0, 0));
        assert_eq!(bucket.available(), 2.0);
    }

    #[test]
    fn test_refill_adds_tokens() {
        let mut bucket = TokenBucket::with_tokens(10.0, 100.0, 0.0, 0);
        bucket.refill(NS);
        assert!((bucket.available() - 10.0).abs() < 1e-9);
        bucket.refill(6 * NS);
        assert!((bucket.available() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_refill_returns_overflow() {
        let mut bucket = TokenBucket::with_tokens(10.0, 5.0, 4.0, 0);
        let expired = bucket.refill(NS);
        assert_eq!(bucket.available(), 5.0);
        assert!((expired - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_fractional_tokens_retained() {
        let mut bucket = TokenBucket::with_tokens(1.0, 10.0, 0.0, 0);
        for step in 1..=4 {
            assert!(!bucket.try_consume(1.0, step * NS / 4 - 1));
        }
        assert!(bucket.try_consume(1.0, NS + 1_000));
    }

    #[test]
    fn test_has_tokens_does_not_mutate() {
        let bucket = TokenBucket::with_tokens(10.0, 100.0, 0.0, 0);
        assert!(bucket.has_tokens(5.0, NS));
        assert!(!bucket.has_tokens(11.0, NS));
        assert_eq!(bucket.available(), 0.0);
    }

    #[test]
    fn test_modify_rate_keeps_accrued_tokens() {
        let mut bucket = TokenBucket::with_tokens(10.0, 100.0, 0.0, 0);
        bucket.modify_rate(1000.0, NS);
        assert!((bucket.available() - 10.0).abs() < 1e-9);
        assert_eq!(bucket.rate(), 1000.0);
    }

    #[test]
    fn test_set_burst_clamps_tokens() {
        let mut bucket = TokenBucket::new(10.0, 100.0, 0);
        bucket.set_burst(20.0);
        assert_eq!(bucket.available(), 20.0);
    }

    #[test]
    fn test_deposit_capped() {
        let mut bucket = TokenBucket::with_tokens(1.0, 10.0, 8.0, 0);
        assert_eq!(bucket.deposit(5.0), 2.0);
        assert_eq!(bucket.available(), 10.0);
        assert_eq!(bucket.deposit(-1.0), 0.0);
    }

    #[test]
    fn test_time_until() {
        let bucket = TokenBucket::with_tokens(10.0, 100.0, 0.0, 0);
        assert_eq!(bucket.time_until(5.0, 0), Some(NS / 2));
        assert_eq!(bucket.time_until(5.0, NS), Some(0));
        assert_eq!(bucket.time_until(200.0, 0), None);
    }

    #[test]
    fn test_time_until_zero_rate() {
        let bucket = TokenBucket::with_tokens(0.0, 10.0, 0.0, 0);
        assert_eq!(bucket.time_until(1.0, 0), None);
    }

    #[test]
    fn test_time_going_backwards() {
        let mut bucket = TokenBucket::with_tokens(10.0, 100.0, 50.0, NS);
        assert_eq!(bucket.refill(NS / 2), 0.0);
        assert_eq!(bucket.available(), 50.0);
    }

    #[test]
    fn test_large_time_jump_caps_at_burst() {
        let mut bucket = TokenBucket::with_tokens(1000.0, 100.0, 0.0, 0);
        bucket.refill(3600 * NS);
        assert_eq!(bucket.available(), 100.0);
    }
}
