use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

use crate::constants::BREAKER_REGISTRY_CAPACITY;
use crate::error::{AppError, AppResult};
use crate::models::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Three-state breaker for a single target. Failures inside a sliding
/// window trip it open; after the reset timeout one trial call may probe
/// the target again.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: BreakerState,
    failures: Vec<i64>,
    last_state_change_ms: i64,
    half_open_attempts: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            failures: Vec::new(),
            last_state_change_ms: 0,
            half_open_attempts: 0,
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn prune_stale(&mut self, now_ms: i64) {
        let horizon = now_ms - self.config.failure_window_ms;
        self.failures.retain(|at| *at > horizon);
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn can_execute(&mut self, key: &str) -> AppResult<()> {
        self.can_execute_at(key, Self::now_ms())
    }

    /// Ok when the call may proceed. An open breaker flips to half-open once
    /// the reset timeout has elapsed; the call that observes the flip counts
    /// as the trial.
    pub fn can_execute_at(&mut self, key: &str, now_ms: i64) -> AppResult<()> {
        match self.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                if now_ms - self.last_state_change_ms >= self.config.reset_timeout_ms {
                    self.state = BreakerState::HalfOpen;
                    self.last_state_change_ms = now_ms;
                    self.half_open_attempts = 1;
                    Ok(())
                } else {
                    let remaining =
                        self.config.reset_timeout_ms - (now_ms - self.last_state_change_ms);
                    Err(AppError::CircuitOpen {
                        key: key.to_string(),
                        message: format!("circuit is open, next trial allowed in {}ms", remaining),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if self.half_open_attempts < self.config.half_open_max_attempts {
                    self.half_open_attempts += 1;
                    Ok(())
                } else {
                    Err(AppError::CircuitOpen {
                        key: key.to_string(),
                        message: "circuit is half-open and its trial budget is exhausted"
                            .to_string(),
                    })
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.record_success_at(Self::now_ms());
    }

    pub fn record_success_at(&mut self, now_ms: i64) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Closed;
                self.failures.clear();
                self.half_open_attempts = 0;
                self.last_state_change_ms = now_ms;
            }
            // A success while closed only ages out stale failures; it does
            // not reset state.
            BreakerState::Closed | BreakerState::Open => self.prune_stale(now_ms),
        }
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Self::now_ms());
    }

    pub fn record_failure_at(&mut self, now_ms: i64) {
        self.failures.push(now_ms);
        self.prune_stale(now_ms);
        match self.state {
            BreakerState::Closed => {
                if self.failures.len() >= self.config.failure_threshold {
                    self.state = BreakerState::Open;
                    self.last_state_change_ms = now_ms;
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.last_state_change_ms = now_ms;
                self.half_open_attempts = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.failures.clear();
        self.half_open_attempts = 0;
        self.last_state_change_ms = Self::now_ms();
    }
}

/// Registry mapping target keys (e.g. `account:<id>`) to breakers, bounded
/// by LRU eviction so abandoned targets age out.
pub struct BreakerRegistry {
    inner: Mutex<RegistryInner>,
    config: CircuitBreakerConfig,
    capacity: usize,
}

struct RegistryInner {
    breakers: HashMap<String, CircuitBreaker>,
    order: VecDeque<String>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_capacity(config, BREAKER_REGISTRY_CAPACITY)
    }

    pub fn with_capacity(config: CircuitBreakerConfig, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                breakers: HashMap::new(),
                order: VecDeque::new(),
            }),
            config,
            capacity,
        }
    }

    fn with_breaker<R>(&self, key: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut inner = self.inner.lock();
        if !inner.breakers.contains_key(key) {
            inner
                .breakers
                .insert(key.to_string(), CircuitBreaker::new(self.config.clone()));
        } else {
            inner.order.retain(|k| k != key);
        }
        inner.order.push_back(key.to_string());
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.breakers.remove(&evicted);
            }
        }
        let breaker = inner.breakers.get_mut(key).expect("breaker just inserted");
        f(breaker)
    }

    pub fn can_execute(&self, key: &str) -> AppResult<()> {
        self.with_breaker(key, |b| b.can_execute(key))
    }

    pub fn can_execute_at(&self, key: &str, now_ms: i64) -> AppResult<()> {
        self.with_breaker(key, |b| b.can_execute_at(key, now_ms))
    }

    pub fn record_success(&self, key: &str) {
        self.with_breaker(key, |b| b.record_success());
    }

    pub fn record_failure(&self, key: &str) {
        self.with_breaker(key, |b| b.record_failure());
    }

    pub fn record_failure_at(&self, key: &str, now_ms: i64) {
        self.with_breaker(key, |b| b.record_failure_at(now_ms));
    }

    pub fn reset(&self, key: &str) {
        self.with_breaker(key, |b| b.reset());
    }

    pub fn state_of(&self, key: &str) -> Option<BreakerState> {
        self.inner.lock().breakers.get(key).map(|b| b.state())
    }

    pub fn states(&self) -> Vec<(String, BreakerState)> {
        self.inner
            .lock()
            .breakers
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
