use dashmap::DashMap;

use crate::models::HealthConfig;

#[derive(Debug, Clone)]
struct HealthRecord {
    // Kept as f64 so fractional passive recovery accrues across frequent
    // reads; the public API rounds down to the integer range.
    score: f64,
    consecutive_failures: u32,
    last_update_ms: i64,
}

/// Per (account-index, quota-key) health score in [0, 100] with passive
/// time-based recovery. Quota keys are strictly isolated: `family:model`
/// never touches `family`.
pub struct HealthTracker {
    records: DashMap<(usize, String), HealthRecord>,
    config: HealthConfig,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn fresh(&self, now_ms: i64) -> HealthRecord {
        HealthRecord {
            score: self.config.max_score as f64,
            consecutive_failures: 0,
            last_update_ms: now_ms,
        }
    }

    fn recovered(&self, record: &HealthRecord, now_ms: i64) -> f64 {
        let elapsed_ms = (now_ms - record.last_update_ms).max(0);
        let hours = elapsed_ms as f64 / 3_600_000.0;
        (record.score + self.config.passive_recovery_per_hour * hours)
            .min(self.config.max_score as f64)
    }

    fn apply<F>(&self, index: usize, key: &str, now_ms: i64, mutate: F) -> i32
    where
        F: FnOnce(&HealthConfig, f64, &mut u32) -> f64,
    {
        let mut entry = self
            .records
            .entry((index, key.to_string()))
            .or_insert_with(|| self.fresh(now_ms));
        let recovered = self.recovered(&entry, now_ms);
        let mut failures = entry.consecutive_failures;
        let next = mutate(&self.config, recovered, &mut failures)
            .clamp(self.config.min_score as f64, self.config.max_score as f64);
        entry.score = next;
        entry.consecutive_failures = failures;
        entry.last_update_ms = now_ms;
        next.floor() as i32
    }

    pub fn get_score(&self, index: usize, key: &str) -> i32 {
        self.get_score_at(index, key, Self::now_ms())
    }

    /// Applies passive recovery, commits it, and returns the current score.
    /// A fresh record reads as the maximum.
    pub fn get_score_at(&self, index: usize, key: &str, now_ms: i64) -> i32 {
        self.apply(index, key, now_ms, |_, score, _| score)
    }

    /// Read-only view of the score: applies recovery arithmetic without
    /// committing it. Used by pure selection paths.
    pub fn peek_score_at(&self, index: usize, key: &str, now_ms: i64) -> i32 {
        match self.records.get(&(index, key.to_string())) {
            Some(record) => self
                .recovered(&record, now_ms)
                .clamp(self.config.min_score as f64, self.config.max_score as f64)
                .floor() as i32,
            None => self.config.max_score,
        }
    }

    pub fn record_success(&self, index: usize, key: &str) {
        self.record_success_at(index, key, Self::now_ms());
    }

    pub fn record_success_at(&self, index: usize, key: &str, now_ms: i64) {
        self.apply(index, key, now_ms, |config, score, failures| {
            *failures = 0;
            score + config.success_delta as f64
        });
    }

    pub fn record_rate_limit(&self, index: usize, key: &str) {
        self.record_rate_limit_at(index, key, Self::now_ms());
    }

    pub fn record_rate_limit_at(&self, index: usize, key: &str, now_ms: i64) {
        self.apply(index, key, now_ms, |config, score, failures| {
            *failures += 1;
            score + config.rate_limit_delta as f64
        });
    }

    pub fn record_failure(&self, index: usize, key: &str) {
        self.record_failure_at(index, key, Self::now_ms());
    }

    pub fn record_failure_at(&self, index: usize, key: &str, now_ms: i64) {
        self.apply(index, key, now_ms, |config, score, failures| {
            *failures += 1;
            score + config.failure_delta as f64
        });
    }

    pub fn consecutive_failures(&self, index: usize, key: &str) -> u32 {
        self.records
            .get(&(index, key.to_string()))
            .map(|r| r.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn reset(&self, index: usize, key: &str) {
        self.records.remove(&(index, key.to_string()));
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> HealthTracker {
        HealthTracker::default()
    }

    #[test]
    fn fresh_record_reads_max_score() {
        let t = tracker();
        assert_eq!(t.get_score_at(0, "codex", 0), 100);
        assert_eq!(t.peek_score_at(3, "codex:gpt-5-codex", 0), 100);
    }

    #[test]
    fn success_clamps_at_max_and_resets_failures() {
        let t = tracker();
        t.record_failure_at(0, "codex", 0);
        t.record_failure_at(0, "codex", 0);
        assert_eq!(t.consecutive_failures(0, "codex"), 2);
        t.record_success_at(0, "codex", 0);
        assert_eq!(t.consecutive_failures(0, "codex"), 0);
        assert_eq!(t.get_score_at(0, "codex", 0), 85);
        for _ in 0..10 {
            t.record_success_at(0, "codex", 0);
        }
        assert_eq!(t.get_score_at(0, "codex", 0), 100);
    }

    #[test]
    fn score_never_escapes_bounds() {
        let t = tracker();
        for _ in 0..20 {
            t.record_rate_limit_at(0, "codex", 0);
        }
        assert_eq!(t.get_score_at(0, "codex", 0), 0);
        for _ in 0..50 {
            t.record_success_at(0, "codex", 0);
        }
        assert_eq!(t.get_score_at(0, "codex", 0), 100);
    }

    #[test]
    fn success_never_decreases_score() {
        let t = tracker();
        t.record_failure_at(0, "codex", 0);
        let before = t.peek_score_at(0, "codex", 1_000);
        t.record_success_at(0, "codex", 1_000);
        assert!(t.peek_score_at(0, "codex", 1_000) >= before);
    }

    #[test]
    fn failures_never_increase_score() {
        let t = tracker();
        t.record_failure_at(0, "codex", 0);
        let before = t.peek_score_at(0, "codex", 0);
        t.record_failure_at(0, "codex", 0);
        assert!(t.peek_score_at(0, "codex", 0) <= before);
        t.record_rate_limit_at(0, "codex", 0);
        assert!(t.peek_score_at(0, "codex", 0) <= before);
    }

    #[test]
    fn passive_recovery_accrues_by_hours() {
        let t = tracker();
        // Drop to 70, then wait two hours: 70 + 2h * 10/h = 90.
        t.record_rate_limit_at(0, "codex", 0);
        t.record_failure_at(0, "codex", 0);
        assert_eq!(t.get_score_at(0, "codex", 0), 70);
        assert_eq!(t.get_score_at(0, "codex", 2 * 3_600_000), 90);
        // Recovery clamps at max.
        assert_eq!(t.get_score_at(0, "codex", 48 * 3_600_000), 100);
    }

    #[test]
    fn peek_does_not_commit_recovery() {
        let t = tracker();
        t.record_rate_limit_at(0, "codex", 0);
        let peeked = t.peek_score_at(0, "codex", 3_600_000);
        let peeked_again = t.peek_score_at(0, "codex", 3_600_000);
        assert_eq!(peeked, peeked_again);
        // A committed read at the same instant agrees with the peek.
        assert_eq!(t.get_score_at(0, "codex", 3_600_000), peeked);
    }

    #[test]
    fn quota_keys_are_isolated() {
        let t = tracker();
        t.record_rate_limit_at(0, "codex:gpt-5-codex", 0);
        assert_eq!(t.get_score_at(0, "codex", 0), 100);
        assert_eq!(t.get_score_at(0, "codex:gpt-5-codex", 0), 80);
        t.record_failure_at(0, "codex", 0);
        assert_eq!(t.get_score_at(0, "codex:gpt-5-codex", 0), 80);
    }

    #[test]
    fn reset_and_clear_restore_fresh_state() {
        let t = tracker();
        t.record_failure_at(0, "codex", 0);
        t.record_failure_at(1, "codex", 0);
        t.reset(0, "codex");
        assert_eq!(t.get_score_at(0, "codex", 0), 100);
        assert_eq!(t.get_score_at(1, "codex", 0), 90);
        t.clear();
        assert_eq!(t.get_score_at(1, "codex", 0), 100);
    }
}
