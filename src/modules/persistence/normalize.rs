use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::constants::{KNOWN_FAMILIES, STORAGE_VERSION};
use crate::models::{Account, AccountStorage};

/// Result of a normalization pass over raw parsed JSON.
#[derive(Debug)]
pub struct NormalizeOutcome {
    pub storage: AccountStorage,
    pub warnings: Vec<String>,
    /// True when the input carried the v1 schema and was migrated.
    pub migrated: bool,
}

/// Dedup identity of a raw (pre-parse) account value: `accountId` when
/// present and non-empty, else `refreshToken`. Mirrors `Account::key`.
fn raw_key(value: &Value) -> Option<String> {
    if let Some(id) = value.get("accountId").and_then(Value::as_str) {
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    value
        .get("refreshToken")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Replace a v1 scalar `rateLimitResetTime` with the v3 per-family map. A
/// still-future scalar is replicated to every known family; expired values
/// are discarded.
fn migrate_v1_account(value: &mut Value, now_ms: i64) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };
    let scalar = obj
        .remove("rateLimitResetTime")
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)));
    if let Some(reset) = scalar {
        if reset > now_ms {
            let mut map = serde_json::Map::new();
            for family in KNOWN_FAMILIES {
                map.insert(family.to_string(), Value::from(reset));
            }
            obj.insert("rateLimitResetTimes".to_string(), Value::Object(map));
        }
    }
}

/// Pick the newest of two indexed accounts: greater `lastUsed`, else greater
/// `addedAt`, else the later index.
fn newer(a: (usize, &Account), b: (usize, &Account)) -> usize {
    let (ai, aa) = a;
    let (bi, bb) = b;
    if aa.last_used != bb.last_used {
        return if aa.last_used > bb.last_used { ai } else { bi };
    }
    if aa.added_at != bb.added_at {
        return if aa.added_at > bb.added_at { ai } else { bi };
    }
    ai.max(bi)
}

/// Collapse duplicates under `group_key`, keeping the newest entry per group
/// and preserving the original relative order of survivors. Entries mapped
/// to `None` by `group_key` are always kept.
fn dedup_by<F>(accounts: Vec<Account>, group_key: F, warnings: &mut Vec<String>, what: &str) -> Vec<Account>
where
    F: Fn(&Account) -> Option<String>,
{
    let mut winner_by_group: HashMap<String, usize> = HashMap::new();
    for (index, account) in accounts.iter().enumerate() {
        let Some(group) = group_key(account) else {
            continue;
        };
        match winner_by_group.get(&group) {
            None => {
                winner_by_group.insert(group, index);
            }
            Some(&current) => {
                let kept = newer((current, &accounts[current]), (index, account));
                winner_by_group.insert(group, kept);
            }
        }
    }

    let keep: HashSet<usize> = accounts
        .iter()
        .enumerate()
        .filter_map(|(index, account)| match group_key(account) {
            None => Some(index),
            Some(group) => (winner_by_group.get(&group) == Some(&index)).then_some(index),
        })
        .collect();

    let dropped = accounts.len() - keep.len();
    if dropped > 0 {
        warnings.push(format!("dropped {} duplicate account(s) by {}", dropped, what));
    }

    accounts
        .into_iter()
        .enumerate()
        .filter_map(|(index, account)| keep.contains(&index).then_some(account))
        .collect()
}

fn clamp_index(index: i64, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    index.clamp(0, len as i64 - 1) as usize
}

/// Normalize raw parsed JSON into a valid v3 pool. Total: any input either
/// yields a pool or `None`; malformed entries are dropped with warnings,
/// never propagated as errors. Normalizing an already-valid v3 pool is a
/// fixpoint.
pub fn normalize_account_storage(raw: &Value, now_ms: i64) -> Option<NormalizeOutcome> {
    let obj = raw.as_object()?;
    let version = obj.get("version").and_then(Value::as_u64)?;
    if version != 1 && version as u32 != STORAGE_VERSION {
        return None;
    }
    let raw_accounts = obj.get("accounts")?.as_array()?;

    let mut warnings = Vec::new();
    let migrated = version == 1;

    let raw_active = obj.get("activeIndex").and_then(Value::as_i64).unwrap_or(0);
    let clamped_active = clamp_index(raw_active, raw_accounts.len());
    let active_key = raw_accounts.get(clamped_active).and_then(raw_key);

    // Work on a copy so migration never mutates caller data.
    let mut working: Vec<Value> = raw_accounts.to_vec();
    if migrated {
        for value in &mut working {
            migrate_v1_account(value, now_ms);
        }
    }

    // Parse and filter: objects with a non-empty trimmed refreshToken.
    let mut accounts: Vec<Account> = Vec::with_capacity(working.len());
    for (index, value) in working.iter().enumerate() {
        if !value.is_object() {
            warnings.push(format!("account #{} is not an object, dropped", index));
            continue;
        }
        let token_ok = value
            .get("refreshToken")
            .and_then(Value::as_str)
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false);
        if !token_ok {
            warnings.push(format!("account #{} has no usable refreshToken, dropped", index));
            continue;
        }
        match serde_json::from_value::<Account>(value.clone()) {
            Ok(account) => accounts.push(account),
            Err(e) => warnings.push(format!("account #{} failed to parse ({}), dropped", index, e)),
        }
    }

    let accounts = dedup_by(accounts, |a| Some(a.key().to_string()), &mut warnings, "account key");
    let accounts = dedup_by(
        accounts,
        |a| a.trimmed_email().map(str::to_string),
        &mut warnings,
        "email",
    );

    // Remap the active index onto the survivor that carries the same key;
    // when that account was dropped entirely, clamp the old index.
    let find_by_key = |key: &str| accounts.iter().position(|a| a.key() == key);
    let active_index = active_key
        .as_deref()
        .and_then(find_by_key)
        .unwrap_or_else(|| clamp_index(clamped_active as i64, accounts.len()));

    // Per-family indices: resolve each raw index through its raw key, then
    // fill every known family that is still missing with the default.
    let mut active_index_by_family: HashMap<String, usize> = HashMap::new();
    if let Some(by_family) = obj.get("activeIndexByFamily").and_then(Value::as_object) {
        for (family, value) in by_family {
            let Some(raw_index) = value.as_i64() else {
                continue;
            };
            let clamped = clamp_index(raw_index, raw_accounts.len());
            let remapped = raw_accounts
                .get(clamped)
                .and_then(raw_key)
                .as_deref()
                .and_then(find_by_key)
                .unwrap_or_else(|| clamp_index(clamped as i64, accounts.len()));
            active_index_by_family.insert(family.clone(), remapped);
        }
    }
    for family in KNOWN_FAMILIES {
        active_index_by_family
            .entry(family.to_string())
            .or_insert(active_index);
    }

    Some(NormalizeOutcome {
        storage: AccountStorage {
            version: STORAGE_VERSION,
            accounts,
            active_index,
            active_index_by_family,
        },
        warnings,
        migrated,
    })
}
