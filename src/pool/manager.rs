use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::constants::{EXPIRY_SWEEP_INTERVAL_SECS, MAX_ACCOUNTS};
use crate::error::{AppError, AppResult};
use crate::models::{
    Account, AccountStorage, AuthRateLimitConfig, BackoffConfig, CircuitBreakerConfig,
    CooldownReason, HealthConfig, LastSwitchReason, QuotaKey, SelectionWeights, TokenBucketConfig,
};
use crate::modules::auth::{AccountMetadata, AuthRateLimiter};
use crate::modules::persistence::AccountStore;
use crate::modules::system::Logger;
use crate::pool::backoff::{parse_rate_limit_reason, BackoffDecision, RateLimitBackoff};
use crate::pool::breaker::BreakerRegistry;
use crate::pool::health::HealthTracker;
use crate::pool::prober::ProbeCandidate;
use crate::pool::selection::{self, ScoredCandidate, Selection};
use crate::pool::token_bucket::TokenBucketTracker;

/// Outcome of `acquire`: which account to use, and whether it is a real
/// pick or only the least-recently-used fallback. A fallback is a selection
/// signal, not a usability verdict; refusing the request stays with the
/// caller.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub index: usize,
    pub account: Account,
    pub fallback: bool,
}

/// Tunables for the whole pool core, all shipped with the policy defaults.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    pub health: HealthConfig,
    pub token_bucket: TokenBucketConfig,
    pub backoff: BackoffConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub auth_rate_limit: AuthRateLimitConfig,
    pub weights: SelectionWeights,
}

/// Owner of the in-memory pool mirror and every per-account tracker. All
/// durable mutations flow through the store (and thus the write mutex).
pub struct AccountManager {
    store: AccountStore,
    pool: tokio::sync::RwLock<AccountStorage>,
    health: HealthTracker,
    buckets: TokenBucketTracker,
    backoff: RateLimitBackoff,
    breakers: BreakerRegistry,
    auth_limiter: AuthRateLimiter,
    weights: SelectionWeights,
    logger: Logger,
    sweep_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel_token: CancellationToken,
}

impl AccountManager {
    pub fn new(store: AccountStore) -> Self {
        Self::with_config(store, PoolConfig::default())
    }

    pub fn with_config(store: AccountStore, config: PoolConfig) -> Self {
        Self {
            store,
            pool: tokio::sync::RwLock::new(AccountStorage::empty()),
            health: HealthTracker::new(config.health),
            buckets: TokenBucketTracker::new(config.token_bucket),
            backoff: RateLimitBackoff::new(config.backoff),
            breakers: BreakerRegistry::new(config.circuit_breaker),
            auth_limiter: AuthRateLimiter::new(config.auth_rate_limit),
            weights: config.weights,
            logger: Logger::scoped("pool"),
            sweep_handle: tokio::sync::Mutex::new(None),
            cancel_token: CancellationToken::new(),
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn breaker_key(account: &Account) -> String {
        format!("account:{}", account.key())
    }

    pub fn health_tracker(&self) -> &HealthTracker {
        &self.health
    }

    pub fn token_buckets(&self) -> &TokenBucketTracker {
        &self.buckets
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn auth_limiter(&self) -> &AuthRateLimiter {
        &self.auth_limiter
    }

    pub fn store(&self) -> &AccountStore {
        &self.store
    }

    /// Pull the durable pool into the mirror. Missing or unreadable storage
    /// yields an empty pool.
    pub async fn load(&self) -> AppResult<usize> {
        let loaded = self.store.load().await?.unwrap_or_default();
        let count = loaded.accounts.len();
        *self.pool.write().await = loaded;
        self.logger.info(&format!("loaded {} account(s)", count), None);
        Ok(count)
    }

    pub async fn snapshot(&self) -> AccountStorage {
        self.pool.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.pool.read().await.accounts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Append a freshly authenticated identity, dedup against the existing
    /// pool (newest wins), and persist. Returns the index of the account.
    pub async fn add_account(&self, meta: AccountMetadata) -> AppResult<usize> {
        let account = meta.into_account(Self::now_ms());
        let key = account.key().to_string();

        let mut pool = self.pool.write().await;
        let mut merged = pool.clone();
        merged.accounts.push(account);

        let raw = serde_json::to_value(&merged)
            .map_err(|e| AppError::validation("pool", format!("serializable state ({})", e)))?;
        let outcome =
            crate::modules::persistence::normalize::normalize_account_storage(&raw, Self::now_ms())
                .ok_or_else(|| AppError::validation("pool", "a normalizable account pool"))?;
        let next = outcome.storage;

        if next.accounts.len() > MAX_ACCOUNTS {
            return Err(AppError::validation(
                "pool size",
                format!("at most {} accounts", MAX_ACCOUNTS),
            ));
        }

        self.store.save(&next).await?;
        *pool = next;
        let index = pool
            .accounts
            .iter()
            .position(|a| a.key() == key)
            .ok_or_else(|| AppError::validation("account", "to survive normalization"))?;
        self.logger.info(
            &format!("added account {} at index {}", pool.accounts[index].display_name(), index),
            None,
        );
        Ok(index)
    }

    fn resolve_index(pool: &AccountStorage, selector: &str) -> Option<usize> {
        if let Ok(index) = selector.parse::<usize>() {
            if index < pool.accounts.len() {
                return Some(index);
            }
        }
        pool.accounts
            .iter()
            .position(|a| a.account_id.as_deref() == Some(selector))
            .or_else(|| {
                pool.accounts
                    .iter()
                    .position(|a| a.trimmed_email() == Some(selector.trim()))
            })
    }

    /// Remove an account by index, accountId, or email. Index-based tracker
    /// state is cleared wholesale because every index above the removed slot
    /// shifts down.
    pub async fn remove_account(&self, selector: &str) -> AppResult<Account> {
        let mut pool = self.pool.write().await;
        let index = Self::resolve_index(&pool, selector)
            .ok_or_else(|| AppError::validation("account selector", "an existing index, id, or email"))?;

        let removed = pool.accounts.remove(index);
        let len = pool.accounts.len();
        let clamp = |i: usize| {
            if len == 0 {
                0
            } else if i > index {
                i - 1
            } else {
                i.min(len - 1)
            }
        };
        pool.active_index = clamp(pool.active_index);
        let remapped: Vec<(String, usize)> = pool
            .active_index_by_family
            .iter()
            .map(|(family, i)| (family.clone(), clamp(*i)))
            .collect();
        pool.active_index_by_family = remapped.into_iter().collect();

        self.store.save(&pool).await?;
        self.health.clear();
        self.buckets.clear();
        self.backoff.clear();
        self.logger.info(
            &format!("removed account {}", removed.display_name()),
            None,
        );
        Ok(removed)
    }

    pub async fn rename_account(&self, selector: &str, email: Option<String>) -> AppResult<()> {
        self.mutate_account(selector, |account| {
            account.email = email.clone().filter(|e| !e.trim().is_empty());
        })
        .await
    }

    pub async fn relabel_account(&self, selector: &str, label: Option<String>) -> AppResult<()> {
        self.mutate_account(selector, |account| {
            account.account_label = label.clone().filter(|l| !l.trim().is_empty());
        })
        .await
    }

    async fn mutate_account<F>(&self, selector: &str, mutate: F) -> AppResult<()>
    where
        F: Fn(&mut Account),
    {
        let mut pool = self.pool.write().await;
        let index = Self::resolve_index(&pool, selector)
            .ok_or_else(|| AppError::validation("account selector", "an existing index, id, or email"))?;
        mutate(&mut pool.accounts[index]);
        self.store.save(&pool).await
    }

    /// Make `index` the default active account.
    pub async fn switch_active(&self, index: usize) -> AppResult<()> {
        let mut pool = self.pool.write().await;
        if index >= pool.accounts.len() {
            return Err(AppError::validation(
                "index",
                format!("less than {}", pool.accounts.len()),
            ));
        }
        pool.active_index = index;
        pool.accounts[index].last_switch_reason = Some(LastSwitchReason::Rotation);
        self.store.save(&pool).await
    }

    /// Pick the best account for the request, consult its breaker, stamp it
    /// as used, and persist. `None` only for an empty pool.
    pub async fn acquire(&self, family: &str, model: Option<&str>) -> AppResult<Option<Acquired>> {
        let now = Self::now_ms();
        let quota_key = QuotaKey::new(family, model.map(str::to_string));
        let key_str = quota_key.as_str_key();

        let mut pool = self.pool.write().await;
        if pool.accounts.is_empty() {
            return Ok(None);
        }

        let ranked = selection::top_candidates(
            &pool.accounts,
            &quota_key,
            &self.health,
            &self.buckets,
            &self.weights,
            pool.accounts.len(),
            now,
        );

        // The breaker gets a veto on each candidate, best first.
        let mut chosen: Option<usize> = None;
        for candidate in &ranked {
            let breaker_key = Self::breaker_key(&pool.accounts[candidate.index]);
            match self.breakers.can_execute_at(&breaker_key, now) {
                Ok(()) => {
                    chosen = Some(candidate.index);
                    break;
                }
                Err(e) => {
                    self.logger
                        .debug(&format!("candidate {} vetoed: {}", candidate.index, e), None);
                }
            }
        }

        let Some(index) = chosen else {
            // Nothing usable: surface the LRU fallback the way the pure
            // selection does.
            let selection = selection::select_hybrid_account(
                &pool.accounts,
                &quota_key,
                &self.health,
                &self.buckets,
                &self.weights,
                now,
            );
            let fallback_index = match selection {
                Some(Selection::FallbackLru(i)) => i,
                Some(Selection::Available(c)) => c.index,
                None => return Ok(None),
            };
            return Ok(Some(Acquired {
                index: fallback_index,
                account: pool.accounts[fallback_index].clone(),
                fallback: true,
            }));
        };

        let previous = pool.active_index_for(family);
        if previous != index {
            let reason = if pool
                .accounts
                .get(previous)
                .map(|a| a.is_rate_limited_for(&quota_key, now))
                .unwrap_or(false)
            {
                LastSwitchReason::RateLimit
            } else {
                LastSwitchReason::Rotation
            };
            pool.accounts[index].last_switch_reason = Some(reason);
        }
        pool.accounts[index].last_used = now;
        pool.accounts[index].prune_expired_rate_limits(now);
        pool.active_index_by_family.insert(family.to_string(), index);
        self.buckets.try_consume_at(index, &key_str, now);
        self.store.save(&pool).await?;

        Ok(Some(Acquired {
            index,
            account: pool.accounts[index].clone(),
            fallback: false,
        }))
    }

    /// Top-N candidates wrapped with cancellation handles for the prober.
    /// Pure with respect to trackers and the pool.
    pub async fn probe_candidates(
        &self,
        family: &str,
        model: Option<&str>,
        n: usize,
    ) -> Vec<(ScoredCandidate, ProbeCandidate<Account>)> {
        let now = Self::now_ms();
        let quota_key = QuotaKey::new(family, model.map(str::to_string));
        let pool = self.pool.read().await;
        selection::top_candidates(
            &pool.accounts,
            &quota_key,
            &self.health,
            &self.buckets,
            &self.weights,
            n,
            now,
        )
        .into_iter()
        .map(|scored| {
            let account = pool.accounts[scored.index].clone();
            (scored, ProbeCandidate::new(account))
        })
        .collect()
    }

    /// Post-call success: heal the trackers, close the breaker, forget the
    /// backoff history, and drop any expired marks on the account.
    pub async fn report_success(&self, index: usize, family: &str, model: Option<&str>) {
        let quota_key = QuotaKey::new(family, model.map(str::to_string));
        let key_str = quota_key.as_str_key();
        self.health.record_success(index, &key_str);
        self.backoff.reset(index, &key_str);

        let mut pool = self.pool.write().await;
        let Some(account) = pool.accounts.get_mut(index) else {
            return;
        };
        self.breakers.record_success(&Self::breaker_key(account));

        let mut dirty = account.rate_limit_reset_times.remove(&key_str).is_some();
        if account.cooling_down_until.is_some() {
            account.cooling_down_until = None;
            account.cooldown_reason = None;
            dirty = true;
        }
        if dirty {
            if let Err(e) = self.store.save(&pool).await {
                self.logger
                    .warn(&format!("failed to persist success cleanup: {}", e), None);
            }
        }
    }

    /// Post-call 429: compute the reason-weighted backoff, mark the account
    /// rate-limited for the quota key until the delay elapses, and persist.
    pub async fn report_rate_limit(
        &self,
        index: usize,
        family: &str,
        model: Option<&str>,
        retry_after_ms: Option<f64>,
        error_code: &str,
    ) -> AppResult<BackoffDecision> {
        let now = Self::now_ms();
        let quota_key = QuotaKey::new(family, model.map(str::to_string));
        let key_str = quota_key.as_str_key();
        let reason = parse_rate_limit_reason(error_code);
        let decision =
            self.backoff
                .get_rate_limit_backoff_at(index, &key_str, retry_after_ms, reason, now);
        self.health.record_rate_limit(index, &key_str);

        let mut pool = self.pool.write().await;
        if let Some(account) = pool.accounts.get_mut(index) {
            account
                .rate_limit_reset_times
                .insert(key_str.clone(), now + decision.delay_ms as i64);
            self.store.save(&pool).await?;
        }

        self.logger.warn(
            &format!(
                "account {} rate-limited on {} (attempt {}, backing off {}ms)",
                index, key_str, decision.attempt, decision.delay_ms
            ),
            None,
        );
        Ok(decision)
    }

    /// Post-call hard failure: damage health, trip the breaker toward open,
    /// and refund the consumed token since no upstream work happened.
    pub async fn report_failure(&self, index: usize, family: &str, model: Option<&str>) {
        let quota_key = QuotaKey::new(family, model.map(str::to_string));
        let key_str = quota_key.as_str_key();
        self.health.record_failure(index, &key_str);
        self.buckets.refund_token(index, &key_str);
        let pool = self.pool.read().await;
        if let Some(account) = pool.accounts.get(index) {
            self.breakers.record_failure(&Self::breaker_key(account));
        }
    }

    /// Put an account on cooldown (auth failure or network trouble).
    pub async fn set_cooldown(
        &self,
        index: usize,
        reason: CooldownReason,
        duration_ms: i64,
    ) -> AppResult<()> {
        let mut pool = self.pool.write().await;
        let Some(account) = pool.accounts.get_mut(index) else {
            return Err(AppError::validation("index", "an existing account"));
        };
        account.cooling_down_until = Some(Self::now_ms() + duration_ms);
        account.cooldown_reason = Some(reason);
        self.store.save(&pool).await
    }

    /// Drop expired rate-limit marks and finished cooldowns. Persists only
    /// when something actually changed. Returns the number of pruned marks.
    pub async fn sweep_expired(&self) -> usize {
        let now = Self::now_ms();
        let mut pool = self.pool.write().await;
        let mut pruned = 0;
        for account in &mut pool.accounts {
            pruned += account.prune_expired_rate_limits(now);
            if account
                .cooling_down_until
                .is_some_and(|until| until <= now)
            {
                account.cooling_down_until = None;
                account.cooldown_reason = None;
                pruned += 1;
            }
        }
        if pruned > 0 {
            if let Err(e) = self.store.save(&pool).await {
                self.logger
                    .warn(&format!("failed to persist expiry sweep: {}", e), None);
            }
        }
        pruned
    }

    /// Background task pruning expired marks on an interval. Idempotent per
    /// manager: a second call replaces the previous task.
    pub async fn start_expiry_sweep(self: Arc<Self>) {
        let manager = Arc::clone(&self);
        let cancel = self.cancel_token.child_token();
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(EXPIRY_SWEEP_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let pruned = manager.sweep_expired().await;
                        if pruned > 0 {
                            manager.logger.debug(
                                &format!("expiry sweep pruned {} mark(s)", pruned),
                                None,
                            );
                        }
                    }
                }
            }
        });

        let mut guard = self.sweep_handle.lock().await;
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel background work and wait for it, bounded by `timeout`.
    pub async fn graceful_shutdown(&self, timeout: Duration) {
        self.cancel_token.cancel();
        let handle = self.sweep_handle.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                self.logger
                    .warn("expiry sweep did not stop in time, aborted", None);
            }
        }
    }
}
