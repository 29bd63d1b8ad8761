use once_cell::sync::Lazy;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::MAX_ACCOUNTS;
use crate::error::{AppError, AppResult, StorageErrorCode};
use crate::models::AccountStorage;
use crate::modules::persistence::normalize::normalize_account_storage;
use crate::modules::persistence::paths;
use crate::modules::system::Logger;

// Durable writes are strictly serialized process-wide. tokio's Mutex wakes
// waiters in FIFO order, which is the ordering contract for the on-disk
// schema.
static WRITE_LOCK: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    pub imported: usize,
    pub skipped: usize,
    pub total: usize,
}

/// Owner of the canonical serialized pool.
pub struct AccountStore {
    path: PathBuf,
    logger: Logger,
}

impl AccountStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            logger: Logger::scoped("store"),
        }
    }

    /// Resolve against the project context (or the global location) and
    /// refuse paths outside the allowed roots.
    pub fn resolve(project_dir: Option<&Path>) -> AppResult<Self> {
        Ok(Self::new(paths::resolve_storage_path(project_dir)?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Load and normalize the pool. Missing files, malformed JSON, and
    /// unknown schemas all yield `Ok(None)` with warnings; only the caller
    /// decides whether an empty pool is fatal. A v1 file is migrated and
    /// re-saved; a failed re-save is logged, not propagated.
    pub async fn load(&self) -> AppResult<Option<AccountStorage>> {
        if !self.path.exists() {
            for candidate in paths::recovery_storage_candidates() {
                if candidate.exists() {
                    self.logger.info(
                        &format!(
                            "no pool at {}, recovery copy found at {}",
                            self.path.display(),
                            candidate.display()
                        ),
                        None,
                    );
                }
            }
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|e| AppError::storage_io(&e, &self.path))?;
        let raw: Value = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(e) => {
                self.logger
                    .warn(&format!("pool file is not valid JSON, ignoring: {}", e), None);
                return Ok(None);
            }
        };

        let Some(outcome) = normalize_account_storage(&raw, Self::now_ms()) else {
            self.logger
                .warn("pool file has an unrecognized shape or version, ignoring", None);
            return Ok(None);
        };
        for warning in &outcome.warnings {
            self.logger.warn(warning, None);
        }

        if outcome.migrated {
            self.logger.info("migrated account storage v1 -> v3", None);
            if let Err(e) = self.save(&outcome.storage).await {
                self.logger
                    .warn(&format!("failed to persist migrated pool: {}", e), None);
            }
        }

        Ok(Some(outcome.storage))
    }

    /// Serialize and atomically replace the pool file. Serialized against
    /// all other durable writes by the process-wide mutex.
    pub async fn save(&self, pool: &AccountStorage) -> AppResult<()> {
        let _write = WRITE_LOCK.lock().await;
        self.write_atomic(&self.path, pool)?;
        self.maintain_gitignore();
        Ok(())
    }

    /// Remove the pool file. A file that never existed is not an error.
    pub async fn clear(&self) -> AppResult<()> {
        let _write = WRITE_LOCK.lock().await;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::storage_io(&e, &self.path)),
        }
    }

    /// Write the current pool to `dest` with owner-only permissions.
    pub async fn export(&self, dest: &Path, force: bool) -> AppResult<()> {
        paths::ensure_allowed(dest)?;
        if dest.exists() && !force {
            return Err(AppError::validation(
                "export path",
                format!("{} not to exist (pass --force to overwrite)", dest.display()),
            ));
        }
        let pool = self.load().await?.unwrap_or_default();
        if pool.is_empty() {
            return Err(AppError::validation("pool", "at least one account to export"));
        }
        self.write_atomic(dest, &pool)
    }

    /// Merge accounts from `src` into the current pool: append the new ones,
    /// dedup, keep the current active indices, refuse to exceed the cap.
    pub async fn import(&self, src: &Path) -> AppResult<ImportOutcome> {
        let content = fs::read_to_string(src).map_err(|e| AppError::storage_io(&e, src))?;
        let raw: Value = serde_json::from_str(&content).map_err(|e| {
            AppError::validation("import file", format!("valid pool JSON ({})", e))
        })?;
        let incoming = normalize_account_storage(&raw, Self::now_ms())
            .ok_or_else(|| AppError::validation("import file", "a v1 or v3 account pool"))?;
        let incoming_count = incoming.storage.accounts.len();

        let _write = WRITE_LOCK.lock().await;
        let current = self.load_unlocked()?.unwrap_or_default();
        let current_count = current.accounts.len();

        let mut merged = current.clone();
        merged.accounts.extend(incoming.storage.accounts);
        let merged_raw = serde_json::to_value(&merged)
            .map_err(|e| AppError::validation("pool", format!("serializable state ({})", e)))?;
        let Some(deduped) = normalize_account_storage(&merged_raw, Self::now_ms()) else {
            return Err(AppError::validation("import file", "a mergeable account pool"));
        };
        let mut result = deduped.storage;
        // The import must not move the active selection.
        result.active_index = current.active_index.min(result.accounts.len().saturating_sub(1));
        result.active_index_by_family = current.active_index_by_family.clone();

        if result.accounts.len() > MAX_ACCOUNTS {
            return Err(AppError::validation(
                "pool size",
                format!("at most {} accounts after import", MAX_ACCOUNTS),
            ));
        }

        self.write_atomic(&self.path, &result)?;
        let total = result.accounts.len();
        Ok(ImportOutcome {
            imported: total - current_count,
            skipped: incoming_count - (total - current_count),
            total,
        })
    }

    // load() without taking the write lock; used inside locked sections.
    fn load_unlocked(&self) -> AppResult<Option<AccountStorage>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| AppError::storage_io(&e, &self.path))?;
        let raw: Value = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        Ok(normalize_account_storage(&raw, Self::now_ms()).map(|o| o.storage))
    }

    /// The atomic write protocol: temp file next to the target, non-zero
    /// size check, owner-only mode, rename into place. Any failure unlinks
    /// the temp file and leaves the live target untouched.
    fn write_atomic(&self, target: &Path, pool: &AccountStorage) -> AppResult<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| AppError::storage_io(&e, parent))?;
        }

        let tmp = PathBuf::from(format!("{}.{}.tmp", target.display(), Self::now_ms()));
        let json = serde_json::to_string_pretty(pool).map_err(|e| {
            AppError::storage(StorageErrorCode::Unknown, target, format!("serialize failed: {}", e))
        })?;

        let cleanup_tmp = |tmp: &Path| {
            let _ = fs::remove_file(tmp);
        };

        if let Err(e) = fs::write(&tmp, &json) {
            cleanup_tmp(&tmp);
            return Err(AppError::storage_io(&e, target));
        }

        let written = fs::metadata(&tmp).map(|m| m.len()).unwrap_or(0);
        if written == 0 {
            cleanup_tmp(&tmp);
            return Err(AppError::storage(
                StorageErrorCode::Empty,
                target,
                "temp file was written as 0 bytes",
            ));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
        }

        if let Err(e) = fs::rename(&tmp, target) {
            cleanup_tmp(&tmp);
            return Err(AppError::storage_io(&e, target));
        }
        Ok(())
    }

    /// When the pool lives in a project's `.opencode/` next to a `.git`
    /// checkout, make sure `.opencode/` is ignored.
    fn maintain_gitignore(&self) {
        let Some(data_dir) = self.path.parent() else {
            return;
        };
        if data_dir.file_name().and_then(|n| n.to_str()) != Some(crate::constants::DATA_DIR) {
            return;
        }
        let Some(project_root) = data_dir.parent() else {
            return;
        };
        if !project_root.join(".git").exists() {
            return;
        }

        let gitignore = project_root.join(".gitignore");
        let entry = format!("{}/", crate::constants::DATA_DIR);
        let existing = fs::read_to_string(&gitignore).unwrap_or_default();
        if existing.lines().any(|line| line.trim() == entry) {
            return;
        }
        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&entry);
        updated.push('\n');
        if let Err(e) = fs::write(&gitignore, updated) {
            self.logger
                .warn(&format!("could not update .gitignore: {}", e), None);
        }
    }
}
