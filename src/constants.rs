// Policy constants shared across the pool core. Tunable knobs that callers
// may override live in `models::config`; the values here are fixed contract.

/// Model families with independent quota semantics upstream.
pub const KNOWN_FAMILIES: &[&str] = &["codex", "codex-mini"];

/// Hard cap on pool size; imports and logins refuse to grow past this.
pub const MAX_ACCOUNTS: usize = 10;

/// Current on-disk schema version. v1 files are migrated on load.
pub const STORAGE_VERSION: u32 = 3;

/// Storage file name, both project-local and global.
pub const STORAGE_FILE: &str = "openai-codex-accounts.json";

/// Directory holding plugin state inside a project or under the home dir.
pub const DATA_DIR: &str = ".opencode";

/// Markers that identify a project root while walking up from the cwd.
pub const PROJECT_ROOT_MARKERS: &[&str] = &[
    ".git",
    "package.json",
    "Cargo.toml",
    "go.mod",
    "pyproject.toml",
    ".opencode",
];

/// Upper bound for any computed rate-limit backoff delay.
pub const MAX_BACKOFF_MS: u64 = 5 * 60 * 1000;

/// Bounded size of the circuit-breaker registry.
pub const BREAKER_REGISTRY_CAPACITY: usize = 100;

/// Bounded size of the logger's active-timer map.
pub const LOGGER_TIMER_CAPACITY: usize = 100;

/// Depth cap for the log sanitizer when walking nested values.
pub const SANITIZE_MAX_DEPTH: usize = 10;

/// Interval of the background sweep that prunes expired rate-limit entries.
pub const EXPIRY_SWEEP_INTERVAL_SECS: u64 = 15;
