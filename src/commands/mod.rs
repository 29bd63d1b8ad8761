pub mod accounts;
pub mod auth;

use crate::error::AppResult;
use crate::modules::persistence::AccountStore;
use crate::pool::AccountManager;

const USAGE: &str = "\
Usage:
  codex-relay auth login
  codex-relay accounts list
  codex-relay accounts remove <idx|id|email>
  codex-relay accounts rename <idx|id|email> <email>
  codex-relay accounts switch <idx>
  codex-relay accounts export <path> [--force]
  codex-relay accounts import <path>
  codex-relay accounts health";

async fn manager_for_cwd() -> AppResult<AccountManager> {
    let cwd = std::env::current_dir().ok();
    let store = AccountStore::resolve(cwd.as_deref())?;
    let manager = AccountManager::new(store);
    manager.load().await?;
    Ok(manager)
}

async fn run_command(args: &[String]) -> AppResult<String> {
    let words: Vec<&str> = args.iter().map(String::as_str).collect();
    match words.as_slice() {
        ["auth", "login"] => Err(crate::error::AppError::Auth {
            account_id: None,
            message: "the interactive OAuth flow is provided by the host integration; \
                      embed this crate and wire an OAuthFlow implementation"
                .to_string(),
            retryable: false,
        }),
        ["accounts", "list"] => accounts::list(&manager_for_cwd().await?).await,
        ["accounts", "remove", selector] => {
            accounts::remove(&manager_for_cwd().await?, selector).await
        }
        ["accounts", "rename", selector, email] => {
            accounts::rename(&manager_for_cwd().await?, selector, email).await
        }
        ["accounts", "switch", raw_index] => {
            let index = raw_index.parse::<usize>().map_err(|_| {
                crate::error::AppError::validation("index", "a non-negative integer")
            })?;
            accounts::switch(&manager_for_cwd().await?, index).await
        }
        ["accounts", "export", path] => {
            accounts::export(&manager_for_cwd().await?, path, false).await
        }
        ["accounts", "export", path, "--force"] => {
            accounts::export(&manager_for_cwd().await?, path, true).await
        }
        ["accounts", "import", path] => {
            accounts::import(&manager_for_cwd().await?, path).await
        }
        ["accounts", "health"] => accounts::health(&manager_for_cwd().await?).await,
        _ => Ok(USAGE.to_string()),
    }
}

/// Dispatch one CLI invocation. Exit code 0 on success, 1 on failure, with
/// human-readable output either way.
pub async fn dispatch(args: &[String]) -> i32 {
    match run_command(args).await {
        Ok(message) => {
            println!("{}", message);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}
