use once_cell::sync::Lazy;
use parking_lot::RwLock;
use uuid::Uuid;

// Process-wide "current" correlation ID. Callers handling concurrent
// requests must set/clear it per request; every record emitted while it is
// set carries it.
static CURRENT: Lazy<RwLock<Option<String>>> = Lazy::new(|| RwLock::new(None));

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn set(id: impl Into<String>) {
    *CURRENT.write() = Some(id.into());
}

pub fn get() -> Option<String> {
    CURRENT.read().clone()
}

pub fn clear() {
    *CURRENT.write() = None;
}

/// Sets a correlation ID for the lifetime of the guard, restoring the
/// previous value on drop.
pub struct CorrelationScope {
    previous: Option<String>,
}

impl CorrelationScope {
    pub fn enter(id: impl Into<String>) -> Self {
        let mut slot = CURRENT.write();
        let previous = slot.take();
        *slot = Some(id.into());
        Self { previous }
    }
}

impl Drop for CorrelationScope {
    fn drop(&mut self) {
        *CURRENT.write() = self.previous.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Correlation state is process-wide; serialize tests touching it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn set_get_clear_round_trip() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        clear();
        assert_eq!(get(), None);
        set("corr-1");
        assert_eq!(get().as_deref(), Some("corr-1"));
        clear();
        assert_eq!(get(), None);
    }

    #[test]
    fn scope_restores_previous_value() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        clear();
        set("outer");
        {
            let _scope = CorrelationScope::enter("inner");
            assert_eq!(get().as_deref(), Some("inner"));
        }
        assert_eq!(get().as_deref(), Some("outer"));
        clear();
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(new_correlation_id(), new_correlation_id());
    }
}
