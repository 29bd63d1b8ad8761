use std::path::{Component, Path, PathBuf};

use crate::constants::{DATA_DIR, PROJECT_ROOT_MARKERS, STORAGE_FILE};
use crate::error::{AppError, AppResult, StorageErrorCode};

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(raw: &str) -> PathBuf {
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Walk up from `start` looking for a directory containing any project-root
/// marker. Returns the nearest match.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        for marker in PROJECT_ROOT_MARKERS {
            if dir.join(marker).exists() {
                return Some(dir.to_path_buf());
            }
        }
        current = dir.parent();
    }
    None
}

/// Lexically normalize a path: resolve `.` and `..` components without
/// touching the filesystem, so containment checks work on paths that do not
/// exist yet.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn is_within(base: &Path, candidate: &Path) -> bool {
    candidate.starts_with(normalize_lexically(base))
}

/// Any storage path must live under home, the cwd, or the temp dir; anything
/// else is refused before a single byte is written.
pub fn ensure_allowed(path: &Path) -> AppResult<()> {
    let absolute = if path.is_absolute() {
        normalize_lexically(path)
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| AppError::storage_io(&e, path))?;
        normalize_lexically(&cwd.join(path))
    };

    let mut allowed_roots: Vec<PathBuf> = vec![std::env::temp_dir()];
    if let Some(home) = dirs::home_dir() {
        allowed_roots.push(home);
    }
    if let Ok(cwd) = std::env::current_dir() {
        allowed_roots.push(cwd);
    }

    if allowed_roots.iter().any(|root| is_within(root, &absolute)) {
        Ok(())
    } else {
        Err(AppError::storage(
            StorageErrorCode::Access,
            &absolute,
            "storage path outside of home, cwd, and tempdir",
        ))
    }
}

/// Resolve the storage file location. With a project context the file lives
/// in `<project-root>/.opencode/`; otherwise it is global under home.
pub fn resolve_storage_path(project_dir: Option<&Path>) -> AppResult<PathBuf> {
    let path = project_dir
        .and_then(find_project_root)
        .map(|root| root.join(DATA_DIR).join(STORAGE_FILE))
        .or_else(|| dirs::home_dir().map(|home| home.join(DATA_DIR).join(STORAGE_FILE)))
        .unwrap_or_else(|| std::env::temp_dir().join(DATA_DIR).join(STORAGE_FILE));

    ensure_allowed(&path)?;
    Ok(path)
}

/// Candidate directories that may hold a recovery copy of the storage file.
/// `APPDATA` and `XDG_DATA_HOME` are consulted for discovery only; nothing
/// is ever read from or written to these automatically.
pub fn recovery_storage_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(appdata) = std::env::var("APPDATA") {
        if !appdata.trim().is_empty() {
            candidates.push(PathBuf::from(appdata).join(DATA_DIR).join(STORAGE_FILE));
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.trim().is_empty() {
            candidates.push(PathBuf::from(xdg).join(DATA_DIR).join(STORAGE_FILE));
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{lock_env, ScopedEnvVar};

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/x/y"), home.join("x/y"));
            assert_eq!(expand_tilde("~"), home);
        }
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn project_root_detected_by_marker() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        let nested = root.join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();

        let found = find_project_root(&nested).unwrap();
        assert_eq!(found, root);
    }

    #[test]
    fn no_marker_means_no_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        // The tempdir ancestors may contain markers on some machines, so only
        // assert that the nested dir itself is not identified as a root.
        if let Some(found) = find_project_root(&nested) {
            assert_ne!(found, nested);
        }
    }

    #[test]
    fn tempdir_paths_are_allowed() {
        let path = std::env::temp_dir().join(".opencode/openai-codex-accounts.json");
        assert!(ensure_allowed(&path).is_ok());
    }

    #[test]
    fn escaping_root_is_denied() {
        let err = ensure_allowed(Path::new("/etc/passwd-adjacent.json")).unwrap_err();
        match err {
            crate::error::AppError::Storage { code, .. } => {
                assert_eq!(code, StorageErrorCode::Access)
            }
            other => panic!("expected storage error, got {other}"),
        }
    }

    #[test]
    fn lexical_traversal_does_not_escape() {
        let sneaky = std::env::temp_dir().join("x/../../../../etc/shadow.json");
        assert!(ensure_allowed(&sneaky).is_err());
    }

    #[test]
    fn recovery_candidates_follow_env() {
        let _guard = lock_env();
        let _xdg = ScopedEnvVar::set("XDG_DATA_HOME", "/tmp/xdg-data");
        let _app = ScopedEnvVar::unset("APPDATA");
        let candidates = recovery_storage_candidates();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].starts_with("/tmp/xdg-data"));
    }
}
