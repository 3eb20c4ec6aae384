use crate::engine::{LOCKS_DIR, TMP_INFIX};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{error, info};
use walkdir::{DirEntry, WalkDir};

/// Temp files younger than this may still belong to a live writer in another process.
const TMP_GRACE: Duration = Duration::from_secs(300);

pub(crate) async fn purge_tmp(root: &Path) {
    let root = root.to_path_buf();
    let now = SystemTime::now();

    match tokio::task::spawn_blocking(move || remove_orphans(&root, now, TMP_GRACE)).await {
        Ok((removed, failed)) if removed > 0 || failed > 0 => {
            info!(removed, failed, "Cleaned up temporary files");
        },
        Err(e) => {
            error!(error = %e, "Temp file cleanup task panicked");
        },
        _ => {},
    }
}

fn remove_orphans(root: &Path, now: SystemTime, grace: Duration) -> (usize, usize) {
    let locks = root.join(LOCKS_DIR);
    let mut removed = 0;
    let mut failed = 0;

    WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.path() != locks)
        .flatten()
        .filter(|e| is_tmp(e) && is_orphaned(e, now, grace))
        .for_each(|entry| match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "Temp removal failed");
                failed += 1;
            },
        });

    (removed, failed)
}

fn is_tmp(entry: &DirEntry) -> bool {
    entry.file_type().is_file()
        && entry.file_name().to_str().is_some_and(|name| name.contains(TMP_INFIX))
}

fn is_orphaned(entry: &DirEntry, now: SystemTime, grace: Duration) -> bool {
    entry
        .metadata()
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|modified| now.duration_since(modified).ok())
        .map_or(true, |age| age > grace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn only_old_temp_files_outside_locks_are_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("certs")).unwrap();
        fs::create_dir_all(root.join(LOCKS_DIR)).unwrap();

        let orphan = root.join(format!("certs/a.pem{TMP_INFIX}1.1"));
        let value = root.join("certs/a.pem");
        let marker = root.join(LOCKS_DIR).join(format!("x{TMP_INFIX}.lock"));
        for path in [&orphan, &value, &marker] {
            fs::write(path, b"x").unwrap();
        }

        let later = SystemTime::now() + Duration::from_secs(3600);
        assert_eq!(remove_orphans(root, later, TMP_GRACE), (1, 0));
        assert!(!orphan.exists());
        assert!(value.exists());
        assert!(marker.exists());

        let fresh = root.join(format!("certs/b.pem{TMP_INFIX}1.2"));
        fs::write(&fresh, b"x").unwrap();
        assert_eq!(remove_orphans(root, SystemTime::now(), TMP_GRACE), (0, 0));
        assert!(fresh.exists());
    }
}
