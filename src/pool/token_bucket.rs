use dashmap::DashMap;
use std::collections::VecDeque;

use crate::models::TokenBucketConfig;

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill_ms: i64,
    consumptions: VecDeque<(i64, u32)>,
}

/// Per (account-index, quota-key) leaky bucket with a short refund window
/// for requests that never reached the upstream.
pub struct TokenBucketTracker {
    buckets: DashMap<(usize, String), Bucket>,
    config: TokenBucketConfig,
}

impl TokenBucketTracker {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn fresh(&self, now_ms: i64) -> Bucket {
        Bucket {
            tokens: self.config.max_tokens,
            last_refill_ms: now_ms,
            consumptions: VecDeque::new(),
        }
    }

    fn refill(&self, bucket: &mut Bucket, now_ms: i64) {
        let elapsed_ms = (now_ms - bucket.last_refill_ms).max(0);
        let refill = self.config.tokens_per_minute * elapsed_ms as f64 / 60_000.0;
        bucket.tokens = (bucket.tokens + refill).min(self.config.max_tokens);
        bucket.last_refill_ms = now_ms;
        // Consumptions past the refund window can never be refunded; drop
        // them so the deque stays bounded.
        let horizon = now_ms - self.config.refund_window_ms;
        while bucket.consumptions.front().is_some_and(|(at, _)| *at < horizon) {
            bucket.consumptions.pop_front();
        }
    }

    pub fn get_tokens(&self, index: usize, key: &str) -> u32 {
        self.get_tokens_at(index, key, Self::now_ms())
    }

    pub fn get_tokens_at(&self, index: usize, key: &str, now_ms: i64) -> u32 {
        let mut bucket = self
            .buckets
            .entry((index, key.to_string()))
            .or_insert_with(|| self.fresh(now_ms));
        self.refill(&mut bucket, now_ms);
        bucket.tokens.floor() as u32
    }

    /// Read-only token count for pure selection paths.
    pub fn peek_tokens_at(&self, index: usize, key: &str, now_ms: i64) -> u32 {
        match self.buckets.get(&(index, key.to_string())) {
            Some(bucket) => {
                let elapsed_ms = (now_ms - bucket.last_refill_ms).max(0);
                let refill = self.config.tokens_per_minute * elapsed_ms as f64 / 60_000.0;
                (bucket.tokens + refill).min(self.config.max_tokens).floor() as u32
            }
            None => self.config.max_tokens.floor() as u32,
        }
    }

    pub fn try_consume(&self, index: usize, key: &str) -> bool {
        self.try_consume_at(index, key, Self::now_ms())
    }

    pub fn try_consume_at(&self, index: usize, key: &str, now_ms: i64) -> bool {
        let mut bucket = self
            .buckets
            .entry((index, key.to_string()))
            .or_insert_with(|| self.fresh(now_ms));
        self.refill(&mut bucket, now_ms);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.consumptions.push_back((now_ms, 1));
            true
        } else {
            false
        }
    }

    /// Refund at most one token consumed within the refund window. The most
    /// recent consumption is returned first.
    pub fn refund_token(&self, index: usize, key: &str) -> bool {
        self.refund_token_at(index, key, Self::now_ms())
    }

    pub fn refund_token_at(&self, index: usize, key: &str, now_ms: i64) -> bool {
        let Some(mut bucket) = self.buckets.get_mut(&(index, key.to_string())) else {
            return false;
        };
        let refundable = bucket
            .consumptions
            .back()
            .is_some_and(|(at, _)| now_ms - at <= self.config.refund_window_ms);
        if !refundable {
            return false;
        }
        bucket.consumptions.pop_back();
        bucket.tokens = (bucket.tokens + 1.0).min(self.config.max_tokens);
        true
    }

    /// Subtract `n` tokens, clamping at zero. Starts from a full bucket when
    /// no record exists yet.
    pub fn drain(&self, index: usize, key: &str, n: u32) {
        self.drain_at(index, key, n, Self::now_ms());
    }

    pub fn drain_at(&self, index: usize, key: &str, n: u32, now_ms: i64) {
        let mut bucket = self
            .buckets
            .entry((index, key.to_string()))
            .or_insert_with(|| self.fresh(now_ms));
        self.refill(&mut bucket, now_ms);
        bucket.tokens = (bucket.tokens - n as f64).max(0.0);
    }

    pub fn reset(&self, index: usize, key: &str) {
        self.buckets.remove(&(index, key.to_string()));
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl Default for TokenBucketTracker {
    fn default() -> Self {
        Self::new(TokenBucketConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> TokenBucketTracker {
        TokenBucketTracker::default()
    }

    #[test]
    fn fresh_bucket_is_full() {
        let t = tracker();
        assert_eq!(t.get_tokens_at(0, "codex", 0), 20);
        assert_eq!(t.peek_tokens_at(1, "codex", 0), 20);
    }

    #[test]
    fn consume_decrements_and_never_goes_negative() {
        let t = tracker();
        for _ in 0..20 {
            assert!(t.try_consume_at(0, "codex", 0));
        }
        assert!(!t.try_consume_at(0, "codex", 0));
        assert_eq!(t.get_tokens_at(0, "codex", 0), 0);
    }

    #[test]
    fn refill_rate_is_tokens_per_minute() {
        let t = tracker();
        t.drain_at(0, "codex", 20, 0);
        assert_eq!(t.get_tokens_at(0, "codex", 0), 0);
        // 10 tokens/minute: 30s later there are 5, and a committed read
        // restarts the refill clock.
        assert_eq!(t.get_tokens_at(0, "codex", 30_000), 5);
        assert_eq!(t.get_tokens_at(0, "codex", 90_000), 15);
        // Refill clamps at capacity.
        assert_eq!(t.get_tokens_at(0, "codex", 3_600_000), 20);
    }

    #[test]
    fn refund_within_window_restores_a_token() {
        let t = tracker();
        assert!(t.try_consume_at(0, "codex", 0));
        assert_eq!(t.peek_tokens_at(0, "codex", 0), 19);
        assert!(t.refund_token_at(0, "codex", 10_000));
        assert_eq!(t.peek_tokens_at(0, "codex", 10_000), 20);
        // Nothing left to refund.
        assert!(!t.refund_token_at(0, "codex", 10_000));
    }

    #[test]
    fn refund_outside_window_is_refused() {
        let t = tracker();
        assert!(t.try_consume_at(0, "codex", 0));
        assert!(!t.refund_token_at(0, "codex", 30_001));
    }

    #[test]
    fn refund_without_any_record_is_refused() {
        let t = tracker();
        assert!(!t.refund_token_at(0, "codex", 0));
    }

    #[test]
    fn drain_clamps_at_zero_and_starts_from_full() {
        let t = tracker();
        t.drain_at(0, "codex", 7, 0);
        assert_eq!(t.get_tokens_at(0, "codex", 0), 13);
        t.drain_at(0, "codex", 100, 0);
        assert_eq!(t.get_tokens_at(0, "codex", 0), 0);
    }

    #[test]
    fn quota_keys_are_isolated() {
        let t = tracker();
        t.drain_at(0, "codex:gpt-5-codex", 20, 0);
        assert_eq!(t.get_tokens_at(0, "codex", 0), 20);
        assert_eq!(t.get_tokens_at(0, "codex:gpt-5-codex", 0), 0);
    }

    #[test]
    fn reset_and_clear() {
        let t = tracker();
        t.drain_at(0, "codex", 20, 0);
        t.drain_at(1, "codex", 20, 0);
        t.reset(0, "codex");
        assert_eq!(t.get_tokens_at(0, "codex", 0), 20);
        assert_eq!(t.get_tokens_at(1, "codex", 0), 0);
        t.clear();
        assert_eq!(t.get_tokens_at(1, "codex", 0), 20);
    }
}
