use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::constants::STORAGE_VERSION;

/// Why the selection engine last switched to this account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LastSwitchReason {
    RateLimit,
    Initial,
    Rotation,
}

/// Why an account is temporarily cooling down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CooldownReason {
    AuthFailure,
    NetworkError,
}

/// One usable upstream identity. Field names match the storage file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id_source: Option<String>,
    pub refresh_token: String,
    #[serde(default)]
    pub added_at: i64,
    #[serde(default)]
    pub last_used: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_switch_reason: Option<LastSwitchReason>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub rate_limit_reset_times: HashMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooling_down_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_reason: Option<CooldownReason>,
}

impl Account {
    pub fn new(refresh_token: String, now_ms: i64) -> Self {
        Self {
            account_id: None,
            email: None,
            account_label: None,
            account_id_source: None,
            refresh_token,
            added_at: now_ms,
            last_used: now_ms,
            last_switch_reason: Some(LastSwitchReason::Initial),
            rate_limit_reset_times: HashMap::new(),
            cooling_down_until: None,
            cooldown_reason: None,
        }
    }

    /// Dedup identity: `accountId` when present and non-empty, else the
    /// refresh token.
    pub fn key(&self) -> &str {
        match self.account_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => &self.refresh_token,
        }
    }

    pub fn trimmed_email(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }

    /// Display name for CLI output: label, else email, else a token stub.
    pub fn display_name(&self) -> String {
        if let Some(label) = self.account_label.as_deref().filter(|l| !l.trim().is_empty()) {
            return label.to_string();
        }
        if let Some(email) = self.trimmed_email() {
            return email.to_string();
        }
        let chars: Vec<char> = self.refresh_token.chars().collect();
        if chars.len() > 10 {
            let prefix: String = chars[..6].iter().collect();
            let suffix: String = chars[chars.len() - 4..].iter().collect();
            format!("{}…{}", prefix, suffix)
        } else {
            "<unnamed>".to_string()
        }
    }

    /// Whether a rate limit is active for this quota key at `now_ms`.
    /// Entries whose reset instant has passed count as expired.
    pub fn is_rate_limited_for(&self, key: &QuotaKey, now_ms: i64) -> bool {
        let active = |k: &str| {
            self.rate_limit_reset_times
                .get(k)
                .map(|reset| *reset > now_ms)
                .unwrap_or(false)
        };
        // A family-level limit disables all of that family's models.
        if active(key.family_name()) {
            return true;
        }
        key.model().is_some() && active(&key.as_str_key())
    }

    pub fn is_cooling_down(&self, now_ms: i64) -> bool {
        self.cooling_down_until
            .map(|until| until > now_ms)
            .unwrap_or(false)
    }

    /// Drop reset entries whose instant has passed. Returns how many were
    /// removed.
    pub fn prune_expired_rate_limits(&mut self, now_ms: i64) -> usize {
        let before = self.rate_limit_reset_times.len();
        self.rate_limit_reset_times.retain(|_, reset| *reset > now_ms);
        before - self.rate_limit_reset_times.len()
    }
}

/// Unit of rate-limit and health tracking: `family` or `family:model`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey {
    family: String,
    model: Option<String>,
}

impl QuotaKey {
    pub fn new(family: impl Into<String>, model: Option<String>) -> Self {
        Self {
            family: family.into(),
            model: model.filter(|m| !m.is_empty()),
        }
    }

    pub fn family(family: impl Into<String>) -> Self {
        Self::new(family, None)
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn as_str_key(&self) -> String {
        match &self.model {
            Some(m) => format!("{}:{}", self.family, m),
            None => self.family.clone(),
        }
    }
}

impl QuotaKey {
    pub fn family_name(&self) -> &str {
        &self.family
    }
}

impl std::fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str_key())
    }
}

/// The durable v3 pool: insertion-ordered accounts plus active indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStorage {
    pub version: u32,
    pub accounts: Vec<Account>,
    pub active_index: usize,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub active_index_by_family: HashMap<String, usize>,
}

impl AccountStorage {
    pub fn empty() -> Self {
        Self {
            version: STORAGE_VERSION,
            accounts: Vec::new(),
            active_index: 0,
            active_index_by_family: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Active index for a family, falling back to the pool default.
    pub fn active_index_for(&self, family: &str) -> usize {
        self.active_index_by_family
            .get(family)
            .copied()
            .unwrap_or(self.active_index)
    }
}

impl Default for AccountStorage {
    fn default() -> Self {
        Self::empty()
    }
}
