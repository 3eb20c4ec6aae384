//! On-disk lock markers: naming, staleness and the exclusive-create primitive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::debug;

/// Suffix of every marker file in the lock area.
pub const MARKER_SUFFIX: &str = ".lock";

const ESCAPE: u8 = b'~';

/// Maps a logical key to its marker file name.
///
/// Bytes in `[a-z0-9_-]` are kept; every other byte of the UTF-8 encoding, including
/// uppercase letters and the escape character itself, becomes `~XX`. The mapping is
/// injective, and [`decode_marker_name`] reverses it.
///
/// ```rust
/// use lockbox_storage::locking::marker_file_name;
///
/// assert_eq!(marker_file_name("cert/example.com"), "cert~2Fexample~2Ecom.lock");
/// assert_eq!(marker_file_name("Issue_1"), "~49ssue_1.lock");
/// ```
#[must_use]
pub fn marker_file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + MARKER_SUFFIX.len());
    for &byte in key.as_bytes() {
        if is_plain(byte) {
            name.push(char::from(byte));
        } else {
            name.push(char::from(ESCAPE));
            name.push_str(&hex::encode_upper([byte]));
        }
    }
    name.push_str(MARKER_SUFFIX);
    name
}

/// Recovers the logical key from a marker file name, or `None` if the name was not
/// produced by [`marker_file_name`].
#[must_use]
pub fn decode_marker_name(file_name: &str) -> Option<String> {
    let encoded = file_name.strip_suffix(MARKER_SUFFIX)?.as_bytes();
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut i = 0;

    while i < encoded.len() {
        let byte = encoded[i];
        if is_plain(byte) {
            bytes.push(byte);
            i += 1;
            continue;
        }
        if byte != ESCAPE {
            return None;
        }
        let pair = encoded.get(i + 1..i + 3)?;
        if !pair.iter().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(b)) {
            return None;
        }
        bytes.extend(hex::decode(pair).ok()?);
        i += 3;
    }

    String::from_utf8(bytes).ok()
}

const fn is_plain(byte: u8) -> bool {
    byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'_' || byte == b'-'
}

/// Returns `true` if a marker last modified at `modified` is older than `threshold`.
///
/// A missing timestamp counts as stale: there is nothing left to protect. A timestamp
/// ahead of `now` (clock skew between hosts sharing the root) counts as fresh.
#[must_use]
pub fn is_stale(modified: Option<SystemTime>, now: SystemTime, threshold: Duration) -> bool {
    modified.map_or(true, |modified| {
        now.duration_since(modified).is_ok_and(|age| age > threshold)
    })
}

/// Diagnostic body written into a marker after it is created. Never consulted for
/// correctness; ownership is decided by the file's existence and age alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerBody {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

impl MarkerBody {
    fn current() -> Self {
        Self { pid: std::process::id(), created_at: Utc::now() }
    }
}

/// A marker found in the lock area.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub key: String,
    pub path: PathBuf,
    pub modified: Option<SystemTime>,
    pub stale: bool,
    /// Whether this storage instance is the holder.
    pub held_here: bool,
    pub body: Option<MarkerBody>,
}

impl LockInfo {
    /// Age of the marker, if its timestamp is readable and not in the future.
    #[must_use]
    pub fn age(&self) -> Option<Duration> {
        self.modified.and_then(|m| SystemTime::now().duration_since(m).ok())
    }
}

/// Atomically creates the marker, failing with [`ErrorKind::AlreadyExists`] if present.
///
/// Synchronous so that a cancelled `lock` future can never leave a marker behind that no
/// waiter knows about.
pub(super) fn create_exclusive(path: &Path) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o644);

    let mut file = options.open(path)?;

    let written = serde_json::to_vec(&MarkerBody::current())
        .map_err(std::io::Error::from)
        .and_then(|body| file.write_all(&body));
    if let Err(err) = written {
        debug!(marker = %path.display(), error = %err, "Lock marker body not written");
    }
    Ok(())
}

/// Removes a marker; a marker that is already gone counts as removed.
pub(super) fn remove(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

pub(super) async fn read_body(path: &Path) -> Option<MarkerBody> {
    let raw = fs::read(path).await.ok()?;
    serde_json::from_slice(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn staleness_is_strictly_past_the_threshold() {
        let now = SystemTime::now();
        assert!(!is_stale(Some(now), now, 2 * HOUR));
        assert!(!is_stale(Some(now - 2 * HOUR), now, 2 * HOUR));
        assert!(is_stale(Some(now - 3 * HOUR), now, 2 * HOUR));
    }

    #[test]
    fn missing_timestamp_is_stale_and_future_one_is_fresh() {
        let now = SystemTime::now();
        assert!(is_stale(None, now, 2 * HOUR));
        assert!(!is_stale(Some(now + HOUR), now, 2 * HOUR));
    }

    #[test]
    fn marker_names_escape_everything_but_the_safe_set() {
        assert_eq!(marker_file_name("abc-1_2"), "abc-1_2.lock");
        assert_eq!(marker_file_name("a b"), "a~20b.lock");
        assert_eq!(marker_file_name("~"), "~7E.lock");
        assert_eq!(marker_file_name("*.example.com"), "~2A~2Eexample~2Ecom.lock");
        assert_eq!(marker_file_name("é"), "~C3~A9.lock");
    }

    #[test]
    fn keys_that_differ_only_by_case_or_escape_do_not_collide() {
        assert_ne!(marker_file_name("Cert"), marker_file_name("cert"));
        assert_ne!(marker_file_name("a/b"), marker_file_name("a~2Fb"));
        assert_ne!(marker_file_name("a.b"), marker_file_name("a_b"));
    }

    #[test]
    fn foreign_names_do_not_decode() {
        assert_eq!(decode_marker_name("cert.pem.lock"), None);
        assert_eq!(decode_marker_name("cert~2f.lock"), None);
        assert_eq!(decode_marker_name("cert~2.lock"), None);
        assert_eq!(decode_marker_name("cert"), None);
        assert_eq!(decode_marker_name("Cert.lock"), None);
        assert_eq!(decode_marker_name("~FF.lock"), None);
    }

    #[tokio::test]
    async fn exclusive_create_refuses_an_existing_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(marker_file_name("cert/example.com"));

        create_exclusive(&path).unwrap();
        let err = create_exclusive(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let body = read_body(&path).await.expect("body should be readable");
        assert_eq!(body.pid, std::process::id());

        remove(&path).unwrap();
        remove(&path).unwrap();
        assert!(!path.exists());
    }
}
