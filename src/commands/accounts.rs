use crate::error::AppResult;
use crate::modules::persistence::paths::expand_tilde;
use crate::pool::report;
use crate::pool::AccountManager;

/// Render the pool as indexed rows for `accounts list`.
pub async fn list(manager: &AccountManager) -> AppResult<String> {
    let snapshot = manager.snapshot().await;
    if snapshot.accounts.is_empty() {
        return Ok("No accounts configured. Run `auth login` to add one.".to_string());
    }

    let now = chrono::Utc::now().timestamp_millis();
    let mut lines = Vec::with_capacity(snapshot.accounts.len());
    for (index, account) in snapshot.accounts.iter().enumerate() {
        let marker = if index == snapshot.active_index { "*" } else { " " };
        let mut flags = Vec::new();
        if account
            .rate_limit_reset_times
            .values()
            .any(|reset| *reset > now)
        {
            flags.push("rate-limited");
        }
        if account.is_cooling_down(now) {
            flags.push("cooling-down");
        }
        let suffix = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        lines.push(format!(
            "{} {:>2}  {}{}",
            marker,
            index,
            account.display_name(),
            suffix
        ));
    }
    Ok(lines.join("\n"))
}

pub async fn remove(manager: &AccountManager, selector: &str) -> AppResult<String> {
    let removed = manager.remove_account(selector).await?;
    Ok(format!("Removed account {}.", removed.display_name()))
}

pub async fn rename(manager: &AccountManager, selector: &str, email: &str) -> AppResult<String> {
    manager
        .rename_account(selector, Some(email.to_string()))
        .await?;
    Ok(format!("Renamed account to {}.", email))
}

pub async fn switch(manager: &AccountManager, index: usize) -> AppResult<String> {
    manager.switch_active(index).await?;
    Ok(format!("Active account is now #{}.", index))
}

pub async fn export(manager: &AccountManager, path: &str, force: bool) -> AppResult<String> {
    let dest = expand_tilde(path);
    manager.store().export(&dest, force).await?;
    Ok(format!("Exported accounts to {}.", dest.display()))
}

pub async fn import(manager: &AccountManager, path: &str) -> AppResult<String> {
    let src = expand_tilde(path);
    let outcome = manager.store().import(&src).await?;
    // The mirror must follow the durable pool.
    manager.load().await?;
    Ok(format!(
        "Imported {} account(s), skipped {}, pool now holds {}.",
        outcome.imported, outcome.skipped, outcome.total
    ))
}

pub async fn health(manager: &AccountManager) -> AppResult<String> {
    let report = report::health_report(manager).await;
    serde_json::to_string_pretty(&report)
        .map_err(|e| crate::error::AppError::validation("health report", format!("serializable ({})", e)))
}
