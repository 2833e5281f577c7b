//! Containment of caller-supplied relative paths

use std::path::{Component, Path, PathBuf};

use crate::error::{OrchestratorError, Result};

/// Join `relative` onto `root`, rejecting anything that could leave it
///
/// Purely lexical: absolute paths, drive prefixes and `..` are refused
/// before the filesystem is touched.
pub fn join_within(root: &Path, relative: &str) -> Result<PathBuf> {
    let trimmed = relative.trim();
    if trimmed.is_empty() {
        return Err(OrchestratorError::validation("A file path is required."));
    }
    if trimmed.contains('\0') || trimmed.starts_with('\\') {
        return Err(OrchestratorError::PathEscape(relative.to_string()));
    }

    let mut joined = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => {
                joined.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(OrchestratorError::PathEscape(relative.to_string()));
            }
        }
    }
    if depth == 0 {
        return Err(OrchestratorError::validation("A file path is required."));
    }
    Ok(joined)
}

/// Confirm an existing path resolves (through symlinks) inside `root`
pub async fn ensure_contained(root: &Path, path: &Path, relative: &str) -> Result<PathBuf> {
    let root = tokio::fs::canonicalize(root).await?;
    let resolved = tokio::fs::canonicalize(path).await?;
    if !resolved.starts_with(&root) {
        return Err(OrchestratorError::PathEscape(relative.to_string()));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_within_accepts_nested() {
        let root = Path::new("/srv/app");
        assert_eq!(join_within(root, "src/index.js").unwrap(), root.join("src/index.js"));
        assert_eq!(join_within(root, "./a.txt").unwrap(), root.join("a.txt"));
    }

    #[test]
    fn test_join_within_rejects_escape() {
        let root = Path::new("/srv/app");
        for bad in ["../secret", "a/../../b", "/etc/passwd", "\\evil"] {
            assert!(
                matches!(join_within(root, bad), Err(OrchestratorError::PathEscape(_))),
                "{bad} should be rejected"
            );
        }
        assert!(matches!(join_within(root, ""), Err(OrchestratorError::Validation(_))));
        assert!(matches!(join_within(root, "."), Err(OrchestratorError::Validation(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_root_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), root.path().join("link")).unwrap();

        let path = join_within(root.path(), "link").unwrap();
        let err = ensure_contained(root.path(), &path, "link").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PathEscape(_)));
    }
}
