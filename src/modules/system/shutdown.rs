use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::modules::system::logger::Logger;

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send>;

static CLEANUPS: Lazy<Mutex<Vec<(String, CleanupFn)>>> = Lazy::new(|| Mutex::new(Vec::new()));
static HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);
static CLEANUP_RAN: AtomicBool = AtomicBool::new(false);

fn logger() -> Logger {
    Logger::scoped("shutdown")
}

/// Register a named cleanup. Cleanups run in registration order when the
/// process shuts down, whether through a signal or the before-exit path.
pub async fn register<F, Fut>(name: &str, cleanup: F)
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
{
    let mut cleanups = CLEANUPS.lock().await;
    cleanups.push((name.to_string(), Box::new(move || Box::pin(cleanup()))));
}

/// Drain the registry in registration order. Individual failures are logged
/// and swallowed so one broken cleanup cannot block the rest. Runs at most
/// once; later calls are no-ops.
pub async fn run_cleanup() {
    if CLEANUP_RAN.swap(true, Ordering::SeqCst) {
        return;
    }
    let log = logger();
    let entries: Vec<(String, CleanupFn)> = {
        let mut cleanups = CLEANUPS.lock().await;
        cleanups.drain(..).collect()
    };
    for (name, cleanup) in entries {
        match cleanup().await {
            Ok(()) => log.debug(&format!("cleanup '{}' completed", name), None),
            Err(e) => log.warn(&format!("cleanup '{}' failed: {}", name, e), None),
        }
    }
}

/// Install one-shot SIGINT/SIGTERM handlers. Each runs the cleanup chain and
/// exits 0. Installed exactly once per process; later calls are no-ops.
pub fn install_signal_handlers() {
    if HANDLERS_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }

    tokio::spawn(async move {
        wait_for_signal().await;
        logger().info("shutdown signal received, running cleanup", None);
        run_cleanup().await;
        std::process::exit(0);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            logger().warn(&format!("failed to install SIGTERM handler: {}", e), None);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn cleanups_run_in_registration_order_and_failures_are_swallowed() {
        // The registry is process-global; this test owns it by running first
        // registrations through a private ordering log.
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        let o1 = order.clone();
        register("first", move || async move {
            o1.lock().await.push("first");
            Ok(())
        })
        .await;

        let o2 = order.clone();
        register("broken", move || async move {
            o2.lock().await.push("broken");
            Err("deliberate".to_string())
        })
        .await;

        let o3 = order.clone();
        let c3 = counter.clone();
        register("last", move || async move {
            o3.lock().await.push("last");
            c3.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        run_cleanup().await;
        assert_eq!(*order.lock().await, vec!["first", "broken", "last"]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Second invocation is a no-op even for cleanups registered later.
        let c4 = counter.clone();
        register("late", move || async move {
            c4.fetch_add(10, Ordering::SeqCst);
            Ok(())
        })
        .await;
        run_cleanup().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
