use crate::error::AppResult;
use crate::modules::auth::OAuthFlow;
use crate::pool::AccountManager;

/// Key used to gate login attempts before the identity is known.
const LOGIN_ATTEMPT_KEY: &str = "login";

/// Run the OAuth collaborator and append the resulting identity to the
/// pool. Every attempt, successful or not, consumes login-rate-limit budget
/// under both the generic key and (when known afterwards) the account key.
pub async fn login(manager: &AccountManager, flow: &dyn OAuthFlow) -> AppResult<String> {
    let limiter = manager.auth_limiter();
    limiter.check_auth_rate_limit(LOGIN_ATTEMPT_KEY)?;
    limiter.record_attempt(LOGIN_ATTEMPT_KEY);

    let meta = flow.login().await?;
    if let Some(email) = meta.email.as_deref() {
        limiter.record_attempt(email);
    }

    let index = manager.add_account(meta).await?;
    let snapshot = manager.snapshot().await;
    Ok(format!(
        "Logged in as {} (account #{}).",
        snapshot.accounts[index].display_name(),
        index
    ))
}
