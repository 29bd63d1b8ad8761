use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub min_score: i32,
    pub max_score: i32,
    pub success_delta: i32,
    pub rate_limit_delta: i32,
    pub failure_delta: i32,
    pub passive_recovery_per_hour: f64,
}

impl HealthConfig {
    pub fn new() -> Self {
        Self {
            min_score: 0,
            max_score: 100,
            success_delta: 5,
            rate_limit_delta: -20,
            failure_delta: -10,
            passive_recovery_per_hour: 10.0,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    pub max_tokens: f64,
    pub tokens_per_minute: f64,
    pub refund_window_ms: i64,
}

impl TokenBucketConfig {
    pub fn new() -> Self {
        Self {
            max_tokens: 20.0,
            tokens_per_minute: 10.0,
            refund_window_ms: 30_000,
        }
    }
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub dedup_window_ms: i64,
    pub quiet_period_ms: i64,
    pub fallback_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl BackoffConfig {
    pub fn new() -> Self {
        Self {
            dedup_window_ms: 2_000,
            quiet_period_ms: 120_000,
            fallback_delay_ms: 1_000,
            max_delay_ms: crate::constants::MAX_BACKOFF_MS,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub failure_window_ms: i64,
    pub reset_timeout_ms: i64,
    pub half_open_max_attempts: u32,
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 60_000,
            reset_timeout_ms: 30_000,
            half_open_max_attempts: 1,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRateLimitConfig {
    pub max_attempts: u32,
    pub window_ms: i64,
}

impl AuthRateLimitConfig {
    pub fn new() -> Self {
        Self {
            max_attempts: 5,
            window_ms: 60_000,
        }
    }
}

impl Default for AuthRateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Hybrid-score weights. The defaults are load-bearing policy; callers may
/// tune them but the shipped values stay 2 / 5 / 2.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionWeights {
    pub health: f64,
    pub tokens: f64,
    pub idle_hours: f64,
}

impl SelectionWeights {
    pub fn new() -> Self {
        Self {
            health: 2.0,
            tokens: 5.0,
            idle_hours: 2.0,
        }
    }
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self::new()
    }
}
