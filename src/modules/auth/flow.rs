use async_trait::async_trait;

use crate::error::AppResult;
use crate::models::Account;

/// What the OAuth collaborator hands back after a successful login or
/// refresh. The pool mints the `Account` from this.
#[derive(Debug, Clone)]
pub struct AccountMetadata {
    pub account_id: Option<String>,
    pub email: Option<String>,
    pub account_label: Option<String>,
    pub account_id_source: Option<String>,
    pub refresh_token: String,
}

impl AccountMetadata {
    pub fn into_account(self, now_ms: i64) -> Account {
        let mut account = Account::new(self.refresh_token, now_ms);
        account.account_id = self.account_id;
        account.email = self.email;
        account.account_label = self.account_label;
        account.account_id_source = self.account_id_source;
        account
    }
}

/// Contract of the external OAuth collaborator. The PKCE flow and its local
/// callback server live outside this crate; both methods may fail with
/// `AppError::Auth` (retryable or not) or `AppError::Network`.
#[async_trait]
pub trait OAuthFlow: Send + Sync {
    /// Run an interactive login and return the new identity.
    async fn login(&self) -> AppResult<AccountMetadata>;

    /// Refresh credentials for an existing account.
    async fn refresh(&self, account: &Account) -> AppResult<AccountMetadata>;
}
