//! Cross-process key locks built on exclusive-create marker files.
//!
//! A key is locked while `<root>/locks/<sanitized key>.lock` exists. Any process sharing
//! the root, including ones on other hosts over a network filesystem, observes the same
//! marker, so the filesystem is the only source of truth. Markers left behind by crashed
//! holders are reclaimed once their modification time is older than
//! [`LockPolicy::stale_after`].
//!
//! Inside one [`Storage`] instance, callers contending for the same key do not all poll the
//! disk: the first one owns the attempt and the rest wait on its completion signal.
//!
//! ```rust
//! use lockbox_storage::{Storage, StorageError};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), StorageError> {
//!     # let tmp = tempfile::tempdir().unwrap();
//!     let storage = Storage::builder().root(tmp.path()).connect().await?;
//!
//!     storage.lock_timeout("issue/example.com", Duration::from_secs(30)).await?;
//!     assert_eq!(storage.held_locks(), ["issue/example.com"]);
//!     storage.unlock("issue/example.com")?;
//!
//!     assert!(storage.locks().await?.is_empty());
//!     Ok(())
//! }
//! ```

mod marker;
mod waiter;

pub use marker::{LockInfo, MARKER_SUFFIX, MarkerBody, decode_marker_name, is_stale, marker_file_name};
pub(crate) use waiter::WaiterTable;

use crate::engine::{LOCKS_DIR, Storage, create_private_dir};
use crate::error::StorageError;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use waiter::{Claim, Waiter, pause};

/// Markers older than this are presumed abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(2 * 60 * 60);
/// Delay between attempts while a marker is held elsewhere.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timing of the lock protocol.
///
/// Every process sharing a root should use the same `stale_after`; a process with a shorter
/// threshold will reclaim markers the others still consider live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub stale_after: Duration,
    pub poll_interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self { stale_after: DEFAULT_STALE_AFTER, poll_interval: DEFAULT_POLL_INTERVAL }
    }
}

impl LockPolicy {
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidConfiguration`] if either duration is zero.
    pub fn validate(&self) -> Result<(), StorageError> {
        let problem = if self.stale_after.is_zero() {
            "stale_after must be greater than zero"
        } else if self.poll_interval.is_zero() {
            "poll_interval must be greater than zero"
        } else {
            return Ok(());
        };

        Err(StorageError::InvalidConfiguration { message: problem.into(), context: None })
    }
}

impl Storage {
    /// Directory holding the lock markers.
    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }

    /// Physical path of the marker for `key`.
    #[must_use]
    pub fn marker_path(&self, key: &str) -> PathBuf {
        self.lock_dir().join(marker_file_name(key))
    }

    /// Blocks until this instance holds the lock for `key`.
    ///
    /// Locks are not reentrant: locking a key this instance already holds waits for its own
    /// `unlock`. A marker older than the staleness threshold is removed and taken over.
    ///
    /// Local callers queued behind an attempt for the same key create no marker while it is
    /// in flight or held. Once it ends, each of them acquires the marker for itself, one at
    /// a time, so every successful return is paired with exactly one `unlock`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] for an empty key and [`StorageError::Io`] when
    /// the marker cannot be created for a reason other than contention.
    pub async fn lock(&self, key: &str) -> Result<(), StorageError> {
        self.lock_until(key, None).await
    }

    /// Like [`Storage::lock`], giving up after `timeout`.
    ///
    /// A timeout too large to express as a deadline, such as [`Duration::MAX`], waits
    /// without one.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LockTimeout`] when the lock is still held elsewhere once the
    /// timeout elapses, plus every error of [`Storage::lock`].
    pub async fn lock_timeout(&self, key: &str, timeout: Duration) -> Result<(), StorageError> {
        self.lock_until(key, Instant::now().checked_add(timeout)).await
    }

    async fn lock_until(&self, key: &str, deadline: Option<Instant>) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::invalid_key(key, "Lock keys must not be empty"));
        }

        loop {
            let pending = match self.waiters.claim(key, || self.marker_path(key)) {
                Claim::Join(waiter) => {
                    debug!(storage = %self, key, "Waiting on local lock attempt");
                    waiter.join(&self.waiters, &self.policy, deadline).await?;
                    continue;
                },
                Claim::Acquire(pending) => pending,
            };

            self.acquire_marker(pending.waiter(), deadline).await?;
            pending.complete();
            debug!(storage = %self, key, "Lock obtained");
            return Ok(());
        }
    }

    async fn acquire_marker(
        &self,
        waiter: &Waiter,
        deadline: Option<Instant>,
    ) -> Result<(), StorageError> {
        let lock_dir = self.lock_dir();
        let marker = waiter.marker();
        let key = waiter.key();
        let poll = self.policy.poll_interval;

        loop {
            if let Err(err) = create_private_dir(&lock_dir).await {
                warn!(storage = %self, key, error = %err, "Lock directory unavailable, retrying");
                pause(poll, deadline, key).await?;
                continue;
            }

            match marker::create_exclusive(marker) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {},
                Err(err) => {
                    return Err(StorageError::Io {
                        source: err,
                        context: Some(
                            format!("Failed to create lock marker {}", marker.display()).into(),
                        ),
                    });
                },
            }

            let meta = match fs::metadata(marker).await {
                Ok(meta) => meta,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    debug!(key, marker = %marker.display(), error = %err, "Lock marker stat failed");
                    pause(poll, deadline, key).await?;
                    continue;
                },
            };

            if !is_stale(meta.modified().ok(), SystemTime::now(), self.policy.stale_after) {
                pause(poll, deadline, key).await?;
                continue;
            }

            warn!(storage = %self, key, marker = %marker.display(), "Reclaiming stale lock marker");
            if let Err(err) = marker::remove(marker) {
                warn!(key, marker = %marker.display(), error = %err, "Stale lock marker removal failed");
                pause(poll, deadline, key).await?;
            }
        }
    }

    /// Releases a lock this instance holds.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LockNotHeld`] without touching the filesystem if the key is not
    /// held here, and [`StorageError::Io`] if the marker could not be deleted. In the latter
    /// case the key is no longer tracked as held.
    pub fn unlock(&self, key: &str) -> Result<(), StorageError> {
        self.waiters.release(key)?;
        debug!(storage = %self, key, "Lock released");
        Ok(())
    }

    /// Releases every lock this instance holds, for shutdown paths.
    ///
    /// Only keys whose marker has been created are released. Attempts still in flight are
    /// left to their callers, which hold the lock once they return and must unlock it
    /// themselves; drop or time out those futures to abandon them instead.
    ///
    /// Failures are logged and skipped. Returns how many locks were released cleanly.
    pub fn unlock_all_obtained(&self) -> usize {
        self.waiters
            .held()
            .into_iter()
            .filter(|key| match self.unlock(key) {
                Ok(()) => true,
                Err(err) => {
                    error!(storage = %self, key = %key, error = %err, "Failed to release lock");
                    false
                },
            })
            .count()
    }

    /// Keys this instance currently holds, sorted.
    #[must_use]
    pub fn held_locks(&self) -> Vec<String> {
        self.waiters.held()
    }

    /// Every marker currently in the lock area, from any process, sorted by key.
    ///
    /// Files whose names do not decode to a key are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the lock area exists but cannot be read.
    pub async fn locks(&self) -> Result<Vec<LockInfo>, StorageError> {
        let lock_dir = self.lock_dir();
        let mut entries = match fs::read_dir(&lock_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(StorageError::Io {
                    source: err,
                    context: Some(format!("Failed to read {}", lock_dir.display()).into()),
                });
            },
        };

        let now = SystemTime::now();
        let mut locks = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    return Err(StorageError::Io {
                        source: err,
                        context: Some(format!("Failed to read {}", lock_dir.display()).into()),
                    });
                },
            };

            let Some(key) = entry.file_name().to_str().and_then(decode_marker_name) else {
                continue;
            };
            let path = entry.path();
            let modified = entry.metadata().await.ok().and_then(|m| m.modified().ok());

            locks.push(LockInfo {
                held_here: self.waiters.is_held(&key),
                stale: is_stale(modified, now, self.policy.stale_after),
                body: marker::read_body(&path).await,
                key,
                path,
                modified,
            });
        }

        locks.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(locks)
    }

    /// Removes every stale marker not held by this instance and returns how many went.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the lock area cannot be read. Individual removal
    /// failures are logged and skipped.
    pub async fn reap_stale_locks(&self) -> Result<usize, StorageError> {
        let mut reaped = 0;
        for lock in self.locks().await?.into_iter().filter(|l| l.stale && !l.held_here) {
            match marker::remove(&lock.path) {
                Ok(()) => {
                    info!(storage = %self, key = %lock.key, "Reaped stale lock marker");
                    reaped += 1;
                },
                Err(err) => {
                    warn!(key = %lock.key, marker = %lock.path.display(), error = %err, "Stale lock marker removal failed");
                },
            }
        }
        Ok(reaped)
    }
}
