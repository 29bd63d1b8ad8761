use dashmap::DashMap;

use crate::error::RateLimitReason;
use crate::models::BackoffConfig;

#[derive(Debug, Clone)]
struct BackoffRecord {
    attempt: u32,
    first_at_ms: i64,
    last_at_ms: i64,
    last_delay_ms: u64,
}

/// One 429 verdict: which attempt this is, how long to stay away, and
/// whether the report was a duplicate of one just processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffDecision {
    pub attempt: u32,
    pub delay_ms: u64,
    pub is_duplicate: bool,
}

/// Map a lowercased upstream error code onto a backoff reason. Quota-style
/// exhaustion backs off hardest, concurrency limits barely at all.
pub fn parse_rate_limit_reason(code: &str) -> RateLimitReason {
    let code = code.to_lowercase();
    if code.contains("quota") || code.contains("usage_limit") {
        RateLimitReason::Quota
    } else if code.contains("token") || code.contains("tpm") || code.contains("rpm") {
        RateLimitReason::Tokens
    } else if code.contains("concurrent") || code.contains("parallel") {
        RateLimitReason::Concurrent
    } else {
        RateLimitReason::Unknown
    }
}

fn reason_multiplier(reason: RateLimitReason) -> f64 {
    match reason {
        RateLimitReason::Quota => 3.0,
        RateLimitReason::Tokens => 1.5,
        RateLimitReason::Concurrent => 0.5,
        RateLimitReason::Unknown => 1.0,
    }
}

/// Per (account-index, quota-key) attempt counter producing reason-weighted
/// exponential delays, with a dedup window so a burst of parallel 429s for
/// the same incident escalates only once.
pub struct RateLimitBackoff {
    records: DashMap<(usize, String), BackoffRecord>,
    config: BackoffConfig,
}

impl RateLimitBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn normalize_retry_after(&self, server_retry_after_ms: Option<f64>) -> u64 {
        match server_retry_after_ms {
            Some(ms) if ms.is_finite() && ms > 0.0 => ms as u64,
            _ => self.config.fallback_delay_ms,
        }
    }

    fn delay_for(&self, base_ms: u64, attempt: u32, reason: RateLimitReason) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = base_ms as f64 * 2f64.powi(exponent as i32) * reason_multiplier(reason);
        (delay as u64).min(self.config.max_delay_ms)
    }

    pub fn get_rate_limit_backoff(
        &self,
        index: usize,
        key: &str,
        server_retry_after_ms: Option<f64>,
        reason: RateLimitReason,
    ) -> BackoffDecision {
        self.get_rate_limit_backoff_at(index, key, server_retry_after_ms, reason, Self::now_ms())
    }

    pub fn get_rate_limit_backoff_at(
        &self,
        index: usize,
        key: &str,
        server_retry_after_ms: Option<f64>,
        reason: RateLimitReason,
        now_ms: i64,
    ) -> BackoffDecision {
        let base_ms = self.normalize_retry_after(server_retry_after_ms);
        let mut entry = self
            .records
            .entry((index, key.to_string()))
            .or_insert_with(|| BackoffRecord {
                attempt: 0,
                first_at_ms: now_ms,
                last_at_ms: i64::MIN / 2,
                last_delay_ms: 0,
            });

        if entry.attempt > 0 {
            // A second report right after the first is the same incident:
            // hand back the prior verdict without escalating. Duplicates do
            // not move the dedup clock.
            if now_ms - entry.last_at_ms <= self.config.dedup_window_ms {
                return BackoffDecision {
                    attempt: entry.attempt,
                    delay_ms: entry.last_delay_ms,
                    is_duplicate: true,
                };
            }
            // A long quiet period means the previous incident resolved.
            if now_ms - entry.last_at_ms > self.config.quiet_period_ms {
                entry.attempt = 0;
                entry.first_at_ms = now_ms;
            }
        }

        entry.attempt += 1;
        entry.last_at_ms = now_ms;
        let delay_ms = self.delay_for(base_ms, entry.attempt, reason);
        entry.last_delay_ms = delay_ms;

        BackoffDecision {
            attempt: entry.attempt,
            delay_ms,
            is_duplicate: false,
        }
    }

    pub fn reset(&self, index: usize, key: &str) {
        self.records.remove(&(index, key.to_string()));
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}

impl Default for RateLimitBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> RateLimitBackoff {
        RateLimitBackoff::default()
    }

    #[test]
    fn dedup_then_escalation() {
        let b = backoff();
        let first = b.get_rate_limit_backoff_at(0, "codex", Some(1000.0), RateLimitReason::Unknown, 0);
        assert_eq!(
            first,
            BackoffDecision {
                attempt: 1,
                delay_ms: 1000,
                is_duplicate: false
            }
        );

        // Within the dedup window: the prior verdict, unchanged.
        let dup = b.get_rate_limit_backoff_at(0, "codex", Some(1000.0), RateLimitReason::Unknown, 1000);
        assert_eq!(
            dup,
            BackoffDecision {
                attempt: 1,
                delay_ms: 1000,
                is_duplicate: true
            }
        );

        // Past the window (measured from the first report): escalate.
        let second =
            b.get_rate_limit_backoff_at(0, "codex", Some(1000.0), RateLimitReason::Unknown, 2500);
        assert_eq!(
            second,
            BackoffDecision {
                attempt: 2,
                delay_ms: 2000,
                is_duplicate: false
            }
        );
    }

    #[test]
    fn quota_reason_triples_the_delay() {
        let b = backoff();
        b.get_rate_limit_backoff_at(0, "codex", Some(1000.0), RateLimitReason::Quota, 0);
        let second = b.get_rate_limit_backoff_at(0, "codex", Some(1000.0), RateLimitReason::Quota, 5_000);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.delay_ms, 6_000);
    }

    #[test]
    fn concurrent_reason_halves_the_delay() {
        let b = backoff();
        let first =
            b.get_rate_limit_backoff_at(0, "codex", Some(1000.0), RateLimitReason::Concurrent, 0);
        assert_eq!(first.delay_ms, 500);
    }

    #[test]
    fn missing_or_bogus_retry_after_falls_back() {
        let b = backoff();
        let first = b.get_rate_limit_backoff_at(0, "codex", None, RateLimitReason::Unknown, 0);
        assert_eq!(first.delay_ms, 1000);
        let nan =
            b.get_rate_limit_backoff_at(1, "codex", Some(f64::NAN), RateLimitReason::Unknown, 0);
        assert_eq!(nan.delay_ms, 1000);
        let neg =
            b.get_rate_limit_backoff_at(2, "codex", Some(-5.0), RateLimitReason::Unknown, 0);
        assert_eq!(neg.delay_ms, 1000);
    }

    #[test]
    fn delay_is_capped() {
        let b = backoff();
        let mut now = 0;
        let mut last = 0;
        for _ in 0..12 {
            last = b
                .get_rate_limit_backoff_at(0, "codex", Some(60_000.0), RateLimitReason::Quota, now)
                .delay_ms;
            now += 10_000;
        }
        assert_eq!(last, crate::constants::MAX_BACKOFF_MS);
    }

    #[test]
    fn quiet_period_resets_the_attempt_counter() {
        let b = backoff();
        b.get_rate_limit_backoff_at(0, "codex", Some(1000.0), RateLimitReason::Unknown, 0);
        b.get_rate_limit_backoff_at(0, "codex", Some(1000.0), RateLimitReason::Unknown, 10_000);
        let calm = b.get_rate_limit_backoff_at(
            0,
            "codex",
            Some(1000.0),
            RateLimitReason::Unknown,
            10_000 + 120_001,
        );
        assert_eq!(calm.attempt, 1);
        assert_eq!(calm.delay_ms, 1000);
    }

    #[test]
    fn quota_keys_are_isolated() {
        let b = backoff();
        b.get_rate_limit_backoff_at(0, "codex", Some(1000.0), RateLimitReason::Unknown, 0);
        let pinned = b.get_rate_limit_backoff_at(
            0,
            "codex:gpt-5-codex",
            Some(1000.0),
            RateLimitReason::Unknown,
            100,
        );
        assert_eq!(pinned.attempt, 1);
        assert!(!pinned.is_duplicate);
    }

    #[test]
    fn reason_parsing_keyword_table() {
        assert_eq!(parse_rate_limit_reason("QUOTA_EXCEEDED"), RateLimitReason::Quota);
        assert_eq!(parse_rate_limit_reason("usage_limit_reached"), RateLimitReason::Quota);
        assert_eq!(parse_rate_limit_reason("tpm_limit"), RateLimitReason::Tokens);
        assert_eq!(parse_rate_limit_reason("rate_limit_rpm"), RateLimitReason::Tokens);
        assert_eq!(parse_rate_limit_reason("token_budget"), RateLimitReason::Tokens);
        assert_eq!(
            parse_rate_limit_reason("too_many_concurrent_requests"),
            RateLimitReason::Concurrent
        );
        assert_eq!(parse_rate_limit_reason("parallel_cap"), RateLimitReason::Concurrent);
        assert_eq!(parse_rate_limit_reason("slow_down"), RateLimitReason::Unknown);
    }
}
