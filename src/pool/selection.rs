use crate::models::{Account, QuotaKey, SelectionWeights};
use crate::pool::health::HealthTracker;
use crate::pool::token_bucket::TokenBucketTracker;

/// One scored candidate from a selection pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub index: usize,
    pub score: f64,
    pub health: i32,
    pub tokens: u32,
    pub idle_hours: f64,
}

/// Outcome of a single-pick selection.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// The best currently-usable account.
    Available(ScoredCandidate),
    /// Nothing is usable; this is the least-recently-used account, offered
    /// only as a signal. Whether to refuse the request stays with the
    /// caller.
    FallbackLru(usize),
}

fn is_available(account: &Account, key: &QuotaKey, now_ms: i64) -> bool {
    !account.is_rate_limited_for(key, now_ms) && !account.is_cooling_down(now_ms)
}

fn score_one(
    index: usize,
    account: &Account,
    key: &str,
    health: &HealthTracker,
    buckets: &TokenBucketTracker,
    weights: &SelectionWeights,
    now_ms: i64,
) -> ScoredCandidate {
    let health_score = health.peek_score_at(index, key, now_ms);
    let tokens = buckets.peek_tokens_at(index, key, now_ms);
    let idle_hours = ((now_ms - account.last_used).max(0)) as f64 / 3_600_000.0;
    ScoredCandidate {
        index,
        score: weights.health * health_score as f64
            + weights.tokens * tokens as f64
            + weights.idle_hours * idle_hours,
        health: health_score,
        tokens,
        idle_hours,
    }
}

/// Score every available account and rank descending, ties broken by lower
/// index. Pure: trackers are only peeked, never committed.
fn ranked_candidates(
    accounts: &[Account],
    quota_key: &QuotaKey,
    health: &HealthTracker,
    buckets: &TokenBucketTracker,
    weights: &SelectionWeights,
    now_ms: i64,
) -> Vec<ScoredCandidate> {
    let key = quota_key.as_str_key();
    let mut candidates: Vec<ScoredCandidate> = accounts
        .iter()
        .enumerate()
        .filter(|(_, account)| is_available(account, quota_key, now_ms))
        .map(|(index, account)| {
            score_one(index, account, &key, health, buckets, weights, now_ms)
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.index.cmp(&b.index))
    });
    candidates
}

/// Pick the single best account for the quota key, or the LRU fallback when
/// nothing is usable. Deterministic: same pool and tracker state, same
/// winner.
pub fn select_hybrid_account(
    accounts: &[Account],
    quota_key: &QuotaKey,
    health: &HealthTracker,
    buckets: &TokenBucketTracker,
    weights: &SelectionWeights,
    now_ms: i64,
) -> Option<Selection> {
    if accounts.is_empty() {
        return None;
    }

    let ranked = ranked_candidates(accounts, quota_key, health, buckets, weights, now_ms);
    if let Some(best) = ranked.into_iter().next() {
        return Some(Selection::Available(best));
    }

    // Everyone is rate-limited or cooling down: surface the account that has
    // rested longest.
    let lru = accounts
        .iter()
        .enumerate()
        .min_by_key(|(index, account)| (account.last_used, *index))
        .map(|(index, _)| index)?;
    Some(Selection::FallbackLru(lru))
}

/// Top `n` available accounts for parallel probing, best first.
pub fn top_candidates(
    accounts: &[Account],
    quota_key: &QuotaKey,
    health: &HealthTracker,
    buckets: &TokenBucketTracker,
    weights: &SelectionWeights,
    n: usize,
    now_ms: i64,
) -> Vec<ScoredCandidate> {
    let mut ranked = ranked_candidates(accounts, quota_key, health, buckets, weights, now_ms);
    ranked.truncate(n);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CooldownReason, HealthConfig, TokenBucketConfig};

    fn account(last_used: i64) -> Account {
        Account::new(format!("tok-{}", last_used), last_used)
    }

    fn fixtures() -> (HealthTracker, TokenBucketTracker, SelectionWeights) {
        (
            HealthTracker::new(HealthConfig::default()),
            TokenBucketTracker::new(TokenBucketConfig::default()),
            SelectionWeights::default(),
        )
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let (health, buckets, weights) = fixtures();
        let key = QuotaKey::family("codex");
        assert_eq!(
            select_hybrid_account(&[], &key, &health, &buckets, &weights, 0),
            None
        );
    }

    #[test]
    fn healthier_account_wins() {
        let (health, buckets, weights) = fixtures();
        let accounts = vec![account(0), account(0)];
        health.record_rate_limit_at(0, "codex", 0);
        match select_hybrid_account(
            &accounts,
            &QuotaKey::family("codex"),
            &health,
            &buckets,
            &weights,
            0,
        ) {
            Some(Selection::Available(best)) => assert_eq!(best.index, 1),
            other => panic!("unexpected selection: {other:?}"),
        }
    }

    #[test]
    fn drained_bucket_loses() {
        let (health, buckets, weights) = fixtures();
        let accounts = vec![account(0), account(0)];
        buckets.drain_at(0, "codex", 20, 0);
        match select_hybrid_account(
            &accounts,
            &QuotaKey::family("codex"),
            &health,
            &buckets,
            &weights,
            0,
        ) {
            Some(Selection::Available(best)) => assert_eq!(best.index, 1),
            other => panic!("unexpected selection: {other:?}"),
        }
    }

    #[test]
    fn idle_time_breaks_otherwise_equal_accounts() {
        let (health, buckets, weights) = fixtures();
        // Account 1 has been idle ten hours, account 0 one hour.
        let now = 20 * 3_600_000;
        let accounts = vec![account(now - 3_600_000), account(now - 10 * 3_600_000)];
        match select_hybrid_account(
            &accounts,
            &QuotaKey::family("codex"),
            &health,
            &buckets,
            &weights,
            now,
        ) {
            Some(Selection::Available(best)) => {
                assert_eq!(best.index, 1);
                assert!((best.idle_hours - 10.0).abs() < 1e-9);
            }
            other => panic!("unexpected selection: {other:?}"),
        }
    }

    #[test]
    fn exact_ties_resolve_to_lower_index() {
        let (health, buckets, weights) = fixtures();
        let accounts = vec![account(0), account(0), account(0)];
        match select_hybrid_account(
            &accounts,
            &QuotaKey::family("codex"),
            &health,
            &buckets,
            &weights,
            0,
        ) {
            Some(Selection::Available(best)) => assert_eq!(best.index, 0),
            other => panic!("unexpected selection: {other:?}"),
        }
    }

    #[test]
    fn rate_limited_and_cooling_accounts_are_filtered() {
        let (health, buckets, weights) = fixtures();
        let mut limited = account(0);
        limited.rate_limit_reset_times.insert("codex".into(), 10_000);
        let mut cooling = account(0);
        cooling.cooling_down_until = Some(10_000);
        cooling.cooldown_reason = Some(CooldownReason::NetworkError);
        let accounts = vec![limited, cooling, account(5)];
        match select_hybrid_account(
            &accounts,
            &QuotaKey::family("codex"),
            &health,
            &buckets,
            &weights,
            5_000,
        ) {
            Some(Selection::Available(best)) => assert_eq!(best.index, 2),
            other => panic!("unexpected selection: {other:?}"),
        }
    }

    #[test]
    fn all_unavailable_falls_back_to_lru() {
        let (health, buckets, weights) = fixtures();
        let mut a = account(9_000);
        a.rate_limit_reset_times.insert("codex".into(), 100_000);
        let mut b = account(3_000);
        b.rate_limit_reset_times.insert("codex".into(), 100_000);
        let accounts = vec![a, b];
        assert_eq!(
            select_hybrid_account(
                &accounts,
                &QuotaKey::family("codex"),
                &health,
                &buckets,
                &weights,
                10_000,
            ),
            Some(Selection::FallbackLru(1))
        );
    }

    #[test]
    fn pinned_model_uses_its_own_quota_key() {
        let (health, buckets, weights) = fixtures();
        let mut a = account(0);
        a.rate_limit_reset_times.insert("codex:gpt-5-codex".into(), 100_000);
        let accounts = vec![a, account(0)];
        let pinned = QuotaKey::new("codex", Some("gpt-5-codex".into()));

        match select_hybrid_account(&accounts, &pinned, &health, &buckets, &weights, 0) {
            Some(Selection::Available(best)) => assert_eq!(best.index, 1),
            other => panic!("unexpected selection: {other:?}"),
        }
        // The family-level key is unaffected by the model-level limit.
        match select_hybrid_account(
            &accounts,
            &QuotaKey::family("codex"),
            &health,
            &buckets,
            &weights,
            0,
        ) {
            Some(Selection::Available(best)) => assert_eq!(best.index, 0),
            other => panic!("unexpected selection: {other:?}"),
        }
    }

    #[test]
    fn top_candidates_is_ranked_and_pure() {
        let (health, buckets, weights) = fixtures();
        let accounts = vec![account(0), account(0), account(0), account(0)];
        health.record_rate_limit_at(2, "codex", 0);
        health.record_failure_at(3, "codex", 0);

        let top = top_candidates(
            &accounts,
            &QuotaKey::family("codex"),
            &health,
            &buckets,
            &weights,
            3,
            0,
        );
        let indices: Vec<usize> = top.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 3]);

        // Purity: a second identical call sees identical scores.
        let again = top_candidates(
            &accounts,
            &QuotaKey::family("codex"),
            &health,
            &buckets,
            &weights,
            3,
            0,
        );
        assert_eq!(top, again);
    }

    #[test]
    fn selection_is_deterministic() {
        let (health, buckets, weights) = fixtures();
        let accounts = vec![account(100), account(200), account(300)];
        health.record_failure_at(1, "codex", 0);
        let key = QuotaKey::family("codex");
        let first = select_hybrid_account(&accounts, &key, &health, &buckets, &weights, 10_000);
        let second = select_hybrid_account(&accounts, &key, &health, &buckets, &weights, 10_000);
        assert_eq!(first, second);
    }
}
