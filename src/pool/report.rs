use serde::Serialize;

use crate::constants::KNOWN_FAMILIES;
use crate::models::QuotaKey;
use crate::pool::breaker::BreakerState;
use crate::pool::manager::AccountManager;

/// Point-in-time view of one account's standing for one family.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyHealth {
    pub family: String,
    pub health_score: i32,
    pub tokens: u32,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited_until: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountHealth {
    pub index: usize,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub active: bool,
    pub last_used: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooling_down_until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerState>,
    pub families: Vec<FamilyHealth>,
}

/// The `accounts health` report: every account crossed with every known
/// family, plus breaker states.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub generated_at: i64,
    pub account_count: usize,
    pub accounts: Vec<AccountHealth>,
}

pub async fn health_report(manager: &AccountManager) -> HealthReport {
    let now = chrono::Utc::now().timestamp_millis();
    let snapshot = manager.snapshot().await;
    let health = manager.health_tracker();
    let buckets = manager.token_buckets();

    let accounts = snapshot
        .accounts
        .iter()
        .enumerate()
        .map(|(index, account)| {
            let families = KNOWN_FAMILIES
                .iter()
                .map(|family| {
                    let key = QuotaKey::family(*family).as_str_key();
                    FamilyHealth {
                        family: family.to_string(),
                        health_score: health.peek_score_at(index, &key, now),
                        tokens: buckets.peek_tokens_at(index, &key, now),
                        consecutive_failures: health.consecutive_failures(index, &key),
                        rate_limited_until: account
                            .rate_limit_reset_times
                            .get(&key)
                            .copied()
                            .filter(|reset| *reset > now),
                    }
                })
                .collect();

            AccountHealth {
                index,
                name: account.display_name(),
                email: account.trimmed_email().map(str::to_string),
                active: index == snapshot.active_index,
                last_used: account.last_used,
                cooling_down_until: account.cooling_down_until.filter(|until| *until > now),
                breaker: manager
                    .breakers()
                    .state_of(&format!("account:{}", account.key())),
                families,
            }
        })
        .collect();

    HealthReport {
        generated_at: now,
        account_count: snapshot.accounts.len(),
        accounts,
    }
}
