//! Mapping of logical keys onto physical paths inside the storage root.

use crate::engine::LOCKS_DIR;
use crate::error::StorageError;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Resolves a `/`-separated logical key to a path inside `root`.
///
/// Rejects empty keys, keys addressing the reserved lock area, absolute paths and
/// `..` sequences that climb above the root. Existing ancestors are canonicalised so a
/// symlink pointing outside the root is refused as well.
pub(crate) fn resolve_key(root: &Path, key: &str) -> Result<PathBuf, StorageError> {
    let relative = normalize_key(key)?;
    if relative.as_os_str().is_empty() {
        return Err(StorageError::invalid_key(key, "Key resolves to the storage root"));
    }
    if relative.components().next() == Some(Component::Normal(OsStr::new(LOCKS_DIR))) {
        return Err(StorageError::invalid_key(key, "Key addresses the reserved lock area"));
    }

    confine(root, &root.join(relative))
}

/// Like [`resolve_key`], but an empty prefix addresses the root itself.
pub(crate) fn resolve_prefix(root: &Path, prefix: &str) -> Result<PathBuf, StorageError> {
    if prefix.trim_matches('/').is_empty() {
        return Ok(root.to_path_buf());
    }
    resolve_key(root, prefix)
}

/// Collapses `.` / `..` lexically without ever climbing above the relative base.
fn normalize_key(key: &str) -> Result<PathBuf, StorageError> {
    let path = Path::new(key);
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::Normal(segment) => out.push(segment),
            Component::ParentDir if out.pop() => {},
            Component::ParentDir => {
                return Err(StorageError::PathTraversalAttempt {
                    message: key.to_owned().into(),
                    context: Some("Key attempted to escape sandbox via '..'".into()),
                });
            },
            Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversalAttempt {
                    message: key.to_owned().into(),
                    context: Some("Absolute keys are not allowed".into()),
                });
            },
        }
    }

    Ok(out)
}

/// Verifies that `joined` stays under `root` once symlinks are resolved.
///
/// For paths that do not exist yet, the first existing ancestor is canonicalised
/// instead; the remaining components were normalised lexically and cannot escape.
fn confine(root: &Path, joined: &Path) -> Result<PathBuf, StorageError> {
    let mut current = Some(joined);

    while let Some(path) = current {
        if path == root {
            return Ok(joined.to_path_buf());
        }

        match path.canonicalize() {
            Ok(canonical) if canonical.starts_with(root) => return Ok(joined.to_path_buf()),
            Ok(canonical) => {
                return Err(StorageError::PathTraversalAttempt {
                    message: canonical.display().to_string().into(),
                    context: Some("Path resolves outside the sandbox through a symlink".into()),
                });
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => current = path.parent(),
            Err(err) => {
                return Err(StorageError::Io {
                    source: err,
                    context: Some(format!("Failed to verify {}", path.display()).into()),
                });
            },
        }
    }

    Err(StorageError::PathTraversalAttempt {
        message: joined.display().to_string().into(),
        context: Some("No ancestor found within sandbox".into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_keys_stay_below_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();

        let path = resolve_key(&root, "certificates/acme/example.com/example.com.crt").unwrap();
        assert_eq!(path, root.join("certificates/acme/example.com/example.com.crt"));

        let collapsed = resolve_key(&root, "a/./b/../c.key").unwrap();
        assert_eq!(collapsed, root.join("a/c.key"));
    }

    #[test]
    fn escaping_and_reserved_keys_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();

        assert!(matches!(
            resolve_key(&root, "../etc/passwd"),
            Err(StorageError::PathTraversalAttempt { .. })
        ));
        assert!(matches!(
            resolve_key(&root, "/etc/passwd"),
            Err(StorageError::PathTraversalAttempt { .. })
        ));
        assert!(matches!(resolve_key(&root, ""), Err(StorageError::InvalidKey { .. })));
        assert!(matches!(resolve_key(&root, "a/.."), Err(StorageError::InvalidKey { .. })));
        assert!(matches!(resolve_key(&root, "locks/x.lock"), Err(StorageError::InvalidKey { .. })));
        assert!(resolve_key(&root, "certs/locks/x").is_ok());
    }

    #[test]
    fn empty_prefix_is_the_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        assert_eq!(resolve_prefix(&root, "").unwrap(), root);
        assert_eq!(resolve_prefix(&root, "/").unwrap(), root);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("escape")).unwrap();

        assert!(matches!(
            resolve_key(&root, "escape/secret.key"),
            Err(StorageError::PathTraversalAttempt { .. })
        ));
    }
}
