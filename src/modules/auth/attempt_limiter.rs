use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{AppError, AppResult};
use crate::models::AuthRateLimitConfig;

/// Sliding-window counter guarding login attempts per account key. Keys are
/// normalized (trimmed, lowercased) so `USER@x.com` and `user@x.com ` share
/// one window.
pub struct AuthRateLimiter {
    attempts: DashMap<String, Vec<i64>>,
    config: RwLock<AuthRateLimitConfig>,
}

impl AuthRateLimiter {
    pub fn new(config: AuthRateLimitConfig) -> Self {
        Self {
            attempts: DashMap::new(),
            config: RwLock::new(config),
        }
    }

    pub fn configure(&self, config: AuthRateLimitConfig) {
        *self.config.write() = config;
    }

    fn normalize(key: &str) -> String {
        key.trim().to_lowercase()
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn window_entries(&self, key: &str, now_ms: i64) -> Vec<i64> {
        let window_ms = self.config.read().window_ms;
        self.attempts
            .get(&Self::normalize(key))
            .map(|entry| {
                entry
                    .iter()
                    .copied()
                    .filter(|at| now_ms - at < window_ms)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn can_attempt(&self, key: &str) -> bool {
        self.can_attempt_at(key, Self::now_ms())
    }

    pub fn can_attempt_at(&self, key: &str, now_ms: i64) -> bool {
        let max = self.config.read().max_attempts as usize;
        self.window_entries(key, now_ms).len() < max
    }

    pub fn record_attempt(&self, key: &str) {
        self.record_attempt_at(key, Self::now_ms());
    }

    pub fn record_attempt_at(&self, key: &str, now_ms: i64) {
        let window_ms = self.config.read().window_ms;
        let mut entry = self.attempts.entry(Self::normalize(key)).or_default();
        entry.retain(|at| now_ms - at < window_ms);
        entry.push(now_ms);
    }

    pub fn attempts_remaining(&self, key: &str) -> u32 {
        self.attempts_remaining_at(key, Self::now_ms())
    }

    pub fn attempts_remaining_at(&self, key: &str, now_ms: i64) -> u32 {
        let max = self.config.read().max_attempts;
        let used = self.window_entries(key, now_ms).len() as u32;
        max.saturating_sub(used)
    }

    /// Milliseconds until the oldest in-window attempt ages out; zero when
    /// the window is empty.
    pub fn time_until_reset(&self, key: &str) -> u64 {
        self.time_until_reset_at(key, Self::now_ms())
    }

    pub fn time_until_reset_at(&self, key: &str, now_ms: i64) -> u64 {
        let window_ms = self.config.read().window_ms;
        self.window_entries(key, now_ms)
            .iter()
            .min()
            .map(|oldest| (oldest + window_ms - now_ms).max(0) as u64)
            .unwrap_or(0)
    }

    pub fn reset(&self, key: &str) {
        self.attempts.remove(&Self::normalize(key));
    }

    pub fn reset_all(&self) {
        self.attempts.clear();
    }

    /// Gate a login attempt: passes silently or fails with a typed error
    /// carrying the remaining budget and the reset horizon.
    pub fn check_auth_rate_limit(&self, key: &str) -> AppResult<()> {
        self.check_auth_rate_limit_at(key, Self::now_ms())
    }

    pub fn check_auth_rate_limit_at(&self, key: &str, now_ms: i64) -> AppResult<()> {
        if self.can_attempt_at(key, now_ms) {
            return Ok(());
        }
        Err(AppError::AuthRateLimit {
            key: Self::normalize(key),
            attempts_remaining: self.attempts_remaining_at(key, now_ms),
            reset_after_ms: self.time_until_reset_at(key, now_ms),
        })
    }
}

impl Default for AuthRateLimiter {
    fn default() -> Self {
        Self::new(AuthRateLimitConfig::default())
    }
}
