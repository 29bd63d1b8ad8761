use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::constants::LOGGER_TIMER_CAPACITY;
use crate::modules::system::{correlation, redact};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Resolve the configured minimum level. `DEBUG_CODEX_PLUGIN=1` wins;
/// otherwise `CODEX_PLUGIN_LOG_LEVEL`, with invalid values falling back to
/// info. Errors always emit regardless of this value.
pub fn resolve_level() -> LogLevel {
    if std::env::var("DEBUG_CODEX_PLUGIN").map(|v| v == "1").unwrap_or(false) {
        return LogLevel::Debug;
    }
    match std::env::var("CODEX_PLUGIN_LOG_LEVEL")
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "debug" => LogLevel::Debug,
        "warn" => LogLevel::Warn,
        "error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

fn console_enabled() -> bool {
    std::env::var("CODEX_CONSOLE_LOG").map(|v| v == "1").unwrap_or(false)
}

fn file_logging_enabled() -> bool {
    std::env::var("ENABLE_PLUGIN_REQUEST_LOGGING")
        .map(|v| v == "1")
        .unwrap_or(false)
}

fn log_dir() -> Option<PathBuf> {
    let dir = dirs::home_dir()?.join(crate::constants::DATA_DIR).join("logs");
    if !dir.exists() {
        fs::create_dir_all(&dir).ok()?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700));
    }
    Some(dir)
}

struct LocalTimer;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().to_rfc3339())
    }
}

/// Install the global subscriber once. Safe to call repeatedly; later calls
/// are no-ops because `try_init` refuses a second global default.
pub fn init_logger() {
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::new(resolve_level().as_str());
    let registry = tracing_subscriber::registry().with(filter);

    let console_layer = console_enabled().then(|| {
        fmt::Layer::new()
            .with_target(false)
            .with_level(true)
            .with_timer(LocalTimer)
    });

    let file_layer = if file_logging_enabled() {
        log_dir().map(|dir| {
            let appender = tracing_appender::rolling::daily(dir, "codex-relay.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            // Keep the background writer alive for the process lifetime.
            std::mem::forget(guard);
            fmt::Layer::new()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_level(true)
                .with_timer(LocalTimer)
        })
    } else {
        None
    };

    let _ = registry.with(console_layer).with(file_layer).try_init();
}

// Active timers, bounded so leaked labels cannot grow without limit.
struct TimerMap {
    started: HashMap<String, i64>,
    order: VecDeque<String>,
}

static TIMERS: Lazy<Mutex<TimerMap>> = Lazy::new(|| {
    Mutex::new(TimerMap {
        started: HashMap::new(),
        order: VecDeque::new(),
    })
});

/// Scoped, leveled, redacting logger. One per subsystem; cheap to clone.
#[derive(Debug, Clone)]
pub struct Logger {
    service: String,
}

impl Logger {
    pub fn scoped(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    pub fn debug(&self, message: &str, data: Option<&Value>) {
        self.emit(LogLevel::Debug, message, data);
    }

    pub fn info(&self, message: &str, data: Option<&Value>) {
        self.emit(LogLevel::Info, message, data);
    }

    pub fn warn(&self, message: &str, data: Option<&Value>) {
        self.emit(LogLevel::Warn, message, data);
    }

    pub fn error(&self, message: &str, data: Option<&Value>) {
        self.emit(LogLevel::Error, message, data);
    }

    /// Start a named timer. Oldest entries are evicted past the cap.
    pub fn time(&self, label: &str) {
        let key = format!("{}:{}", self.service, label);
        let mut timers = TIMERS.lock();
        if !timers.started.contains_key(&key) {
            timers.order.push_back(key.clone());
        }
        timers.started.insert(key, chrono::Utc::now().timestamp_millis());
        while timers.order.len() > LOGGER_TIMER_CAPACITY {
            if let Some(evicted) = timers.order.pop_front() {
                timers.started.remove(&evicted);
            }
        }
    }

    /// Stop a named timer and log the elapsed time at debug.
    pub fn time_end(&self, label: &str) {
        let key = format!("{}:{}", self.service, label);
        let started = {
            let mut timers = TIMERS.lock();
            let started = timers.started.remove(&key);
            timers.order.retain(|k| k != &key);
            started
        };
        if let Some(started_at) = started {
            let elapsed = chrono::Utc::now().timestamp_millis() - started_at;
            self.debug(&format!("{} took {}ms", label, elapsed), None);
        }
    }

    fn emit(&self, level: LogLevel, message: &str, data: Option<&Value>) {
        // Errors always emit; lower levels honor the configured minimum.
        if level != LogLevel::Error && level < resolve_level() {
            return;
        }

        let message = redact::scrub_text(message);
        let correlation_id = correlation::get();
        let data = data.map(redact::sanitize_value);
        let data_str = data.as_ref().map(|d| d.to_string());

        match level {
            LogLevel::Debug => tracing::debug!(
                service = %self.service,
                correlation_id = correlation_id.as_deref(),
                data = data_str.as_deref(),
                "{}",
                message
            ),
            LogLevel::Info => tracing::info!(
                service = %self.service,
                correlation_id = correlation_id.as_deref(),
                data = data_str.as_deref(),
                "{}",
                message
            ),
            LogLevel::Warn => tracing::warn!(
                service = %self.service,
                correlation_id = correlation_id.as_deref(),
                data = data_str.as_deref(),
                "{}",
                message
            ),
            LogLevel::Error => tracing::error!(
                service = %self.service,
                correlation_id = correlation_id.as_deref(),
                data = data_str.as_deref(),
                "{}",
                message
            ),
        }
    }
}
