pub mod commands;
pub mod constants;
pub mod error;
pub mod models;
pub mod modules;
pub mod pool;
#[cfg(test)]
mod test_utils;

pub use error::{AppError, AppResult};
pub use models::{Account, AccountStorage, QuotaKey};
pub use modules::auth::{AccountMetadata, OAuthFlow};
pub use modules::persistence::AccountStore;
pub use pool::{probe_first_success, AccountManager, Acquired, PoolConfig, ProbeCandidate};

use modules::system::{logger, shutdown};

/// Headless CLI entry point: initialize logging, install signal handlers,
/// dispatch the command, run the before-exit cleanup, and exit.
pub fn run() {
    logger::init_logger();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async {
        shutdown::install_signal_handlers();
        let code = commands::dispatch(&args).await;
        shutdown::run_cleanup().await;
        code
    });

    std::process::exit(code);
}
