use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Storage failure classification, carried by `AppError::Storage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StorageErrorCode {
    #[serde(rename = "EACCES")]
    Access,
    #[serde(rename = "EPERM")]
    Permission,
    #[serde(rename = "EBUSY")]
    Busy,
    #[serde(rename = "ENOSPC")]
    NoSpace,
    #[serde(rename = "EEMPTY")]
    Empty,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl StorageErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageErrorCode::Access => "EACCES",
            StorageErrorCode::Permission => "EPERM",
            StorageErrorCode::Busy => "EBUSY",
            StorageErrorCode::NoSpace => "ENOSPC",
            StorageErrorCode::Empty => "EEMPTY",
            StorageErrorCode::Unknown => "UNKNOWN",
        }
    }

    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => StorageErrorCode::Access,
            _ => match err.raw_os_error() {
                Some(libc_code) => match libc_code {
                    13 => StorageErrorCode::Access,
                    1 => StorageErrorCode::Permission,
                    16 | 26 => StorageErrorCode::Busy,
                    28 => StorageErrorCode::NoSpace,
                    _ => StorageErrorCode::Unknown,
                },
                None => StorageErrorCode::Unknown,
            },
        }
    }

    /// Human-readable remediation hint, platform-aware for permission errors.
    pub fn hint(&self, path: &std::path::Path) -> String {
        match self {
            StorageErrorCode::Access | StorageErrorCode::Permission => {
                if cfg!(windows) {
                    format!(
                        "Access denied writing {}. Check antivirus exclusions and verify the current user has write permissions on the folder.",
                        path.display()
                    )
                } else {
                    format!(
                        "Permission denied writing {}. Check folder permissions; try: chmod 755 {}",
                        path.display(),
                        path.parent().unwrap_or(path).display()
                    )
                }
            }
            StorageErrorCode::Busy => format!(
                "{} is locked by another process. Close other instances and retry.",
                path.display()
            ),
            StorageErrorCode::NoSpace => {
                format!("Disk full while writing {}. Free up space and retry.", path.display())
            }
            StorageErrorCode::Empty => format!(
                "Written file was 0 bytes ({}); the write was aborted to protect existing data.",
                path.display()
            ),
            StorageErrorCode::Unknown => format!(
                "Could not write {}. Verify the path exists and the current user can write to it.",
                path.display()
            ),
        }
    }
}

/// Why an upstream call was rejected with a 429-class response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    Quota,
    Tokens,
    Concurrent,
    Unknown,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        headers: Vec<(String, String)>,
    },

    #[error("Auth error for account {account_id:?}: {message}")]
    Auth {
        account_id: Option<String>,
        message: String,
        retryable: bool,
    },

    #[error("Invalid {field}: expected {expected}")]
    Validation { field: String, expected: String },

    #[error("Rate limited ({reason:?}): retry after {retry_after_ms:?} ms")]
    RateLimit {
        retry_after_ms: Option<u64>,
        account_id: Option<String>,
        reason: RateLimitReason,
    },

    #[error("Timed out after {elapsed_ms} ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Storage error [{}] at {}: {message}. {hint}", .code.as_str(), .path.display())]
    Storage {
        code: StorageErrorCode,
        path: PathBuf,
        message: String,
        hint: String,
    },

    #[error("Circuit breaker open for {key}: {message}")]
    CircuitOpen { key: String, message: String },

    #[error("Too many login attempts for {key}: {attempts_remaining} remaining, resets in {reset_after_ms} ms")]
    AuthRateLimit {
        key: String,
        attempts_remaining: u32,
        reset_after_ms: u64,
    },
}

impl AppError {
    pub fn storage(code: StorageErrorCode, path: &std::path::Path, message: impl Into<String>) -> Self {
        AppError::Storage {
            code,
            path: path.to_path_buf(),
            message: message.into(),
            hint: code.hint(path),
        }
    }

    pub fn storage_io(err: &std::io::Error, path: &std::path::Path) -> Self {
        Self::storage(StorageErrorCode::from_io(err), path, err.to_string())
    }

    pub fn network(message: impl Into<String>) -> Self {
        AppError::Network {
            message: message.into(),
            source: None,
        }
    }

    pub fn validation(field: impl Into<String>, expected: impl Into<String>) -> Self {
        AppError::Validation {
            field: field.into(),
            expected: expected.into(),
        }
    }

    /// Whether retrying the failed operation can plausibly succeed.
    pub fn retryable(&self) -> bool {
        match self {
            AppError::Network { .. } => true,
            AppError::Api { status, .. } => {
                *status == 429 || *status >= 500
            }
            AppError::Auth { retryable, .. } => *retryable,
            AppError::RateLimit { .. } => true,
            AppError::Timeout { .. } => true,
            AppError::CircuitOpen { .. } => false,
            AppError::AuthRateLimit { .. } => false,
            AppError::Validation { .. } => false,
            AppError::Storage { code, .. } => matches!(code, StorageErrorCode::Busy),
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn empty_write_hint_mentions_zero_bytes() {
        let hint = StorageErrorCode::Empty.hint(Path::new("/tmp/accounts.json"));
        assert!(hint.contains("0 bytes"));
    }

    #[test]
    fn permission_hint_is_platform_aware() {
        let hint = StorageErrorCode::Access.hint(Path::new("/home/u/.opencode/a.json"));
        if cfg!(windows) {
            assert!(hint.contains("antivirus"));
        } else {
            assert!(hint.contains("chmod 755"));
        }
    }

    #[test]
    fn storage_error_carries_code_path_and_hint() {
        let err = AppError::storage(
            StorageErrorCode::NoSpace,
            Path::new("/data/accounts.json"),
            "write failed",
        );
        let text = err.to_string();
        assert!(text.contains("ENOSPC"));
        assert!(text.contains("/data/accounts.json"));
        assert!(text.contains("Disk full"));
    }

    #[test]
    fn retryable_classification() {
        assert!(AppError::network("dns failure").retryable());
        assert!(AppError::Api {
            status: 503,
            message: "overloaded".into(),
            headers: vec![],
        }
        .retryable());
        assert!(!AppError::Api {
            status: 404,
            message: "missing".into(),
            headers: vec![],
        }
        .retryable());
        assert!(!AppError::validation("email", "non-empty string").retryable());
        assert!(!AppError::CircuitOpen {
            key: "account:a".into(),
            message: "open".into(),
        }
        .retryable());
    }

    #[test]
    fn io_error_maps_to_code() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(StorageErrorCode::from_io(&denied), StorageErrorCode::Access);
        let other = std::io::Error::new(std::io::ErrorKind::Other, "???");
        assert_eq!(StorageErrorCode::from_io(&other), StorageErrorCode::Unknown);
    }
}
