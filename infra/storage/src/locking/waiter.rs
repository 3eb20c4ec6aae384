//! Process-local bookkeeping for locks held or being acquired by one storage instance.

use super::{LockPolicy, marker};
use crate::error::StorageError;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::{Instant, sleep, sleep_until, timeout_at};
use tracing::warn;

/// Lifecycle of one local acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaiterState {
    /// The owning caller is still trying to create the marker.
    Acquiring,
    /// The marker was created; the owning caller holds the lock.
    Held,
    /// `unlock` ran and deleted the marker.
    Released,
    /// The owning caller gave up (error, timeout or a dropped future) without holding the lock.
    Abandoned,
}

impl WaiterState {
    const fn is_final(self) -> bool {
        matches!(self, Self::Released | Self::Abandoned)
    }
}

/// One per key per storage instance. Local callers that find a waiter for their key
/// attach to it instead of polling the disk themselves.
#[derive(Debug)]
pub(crate) struct Waiter {
    key: String,
    marker: PathBuf,
    state: watch::Sender<WaiterState>,
}

impl Waiter {
    fn new(key: &str, marker: PathBuf) -> Self {
        let (state, _) = watch::channel(WaiterState::Acquiring);
        Self { key: key.to_owned(), marker, state }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn marker(&self) -> &Path {
        &self.marker
    }

    fn state(&self) -> WaiterState {
        *self.state.borrow()
    }

    fn set(&self, state: WaiterState) {
        self.state.send_replace(state);
    }

    /// Blocks until the attempt this waiter tracks is over and the marker looks free.
    ///
    /// After the local signal, the marker is polled until it is gone or stale, giving up
    /// once the staleness threshold has elapsed since the wait began. The signal only
    /// proves this instance is done; another process may have recreated the marker. Polling
    /// also stops as soon as `table` tracks a newer attempt for the key, so the caller can
    /// wait on that one instead of the disk.
    pub(crate) async fn join(
        &self,
        table: &WaiterTable,
        policy: &LockPolicy,
        deadline: Option<Instant>,
    ) -> Result<(), StorageError> {
        let started = Instant::now();
        let mut rx = self.state.subscribe();

        let signalled = {
            let finished = rx.wait_for(|state| state.is_final());
            match deadline {
                Some(deadline) => timeout_at(deadline, finished)
                    .await
                    .map_err(|_| StorageError::lock_timeout(&self.key))?
                    .map(|state| *state),
                None => finished.await.map(|state| *state),
            }
        };

        // A closed channel means the waiter was dropped, which only happens once it is final.
        if matches!(signalled, Ok(WaiterState::Abandoned) | Err(_)) {
            return Ok(());
        }

        while started.elapsed() < policy.stale_after {
            if table.is_superseded(self) {
                return Ok(());
            }

            match tokio::fs::metadata(&self.marker).await {
                Err(_) => return Ok(()),
                Ok(meta)
                    if marker::is_stale(
                        meta.modified().ok(),
                        SystemTime::now(),
                        policy.stale_after,
                    ) =>
                {
                    return Ok(());
                },
                Ok(_) => pause(policy.poll_interval, deadline, &self.key).await?,
            }
        }

        Ok(())
    }
}

/// Sleeps one poll interval, or fails with [`StorageError::LockTimeout`] if the deadline
/// falls inside it.
pub(crate) async fn pause(
    interval: Duration,
    deadline: Option<Instant>,
    key: &str,
) -> Result<(), StorageError> {
    let wake = Instant::now().checked_add(interval);
    match deadline {
        Some(deadline) if wake.is_none_or(|wake| deadline <= wake) => {
            sleep_until(deadline).await;
            Err(StorageError::lock_timeout(key))
        },
        _ => {
            sleep(interval).await;
            Ok(())
        },
    }
}

/// Outcome of registering interest in a key.
#[derive(Debug)]
pub(crate) enum Claim<'a> {
    /// Another local caller owns the attempt; wait on it.
    Join(Arc<Waiter>),
    /// This caller owns a fresh attempt and must acquire the marker.
    Acquire(PendingAcquire<'a>),
}

/// Table of waiters keyed by logical key, owned by one storage instance.
///
/// The mutex is only held for lookups and mutations, never across an `.await`.
#[derive(Debug, Default)]
pub(crate) struct WaiterTable {
    waiters: Mutex<FxHashMap<String, Arc<Waiter>>>,
}

impl WaiterTable {
    pub(crate) fn claim(&self, key: &str, marker: impl FnOnce() -> PathBuf) -> Claim<'_> {
        let mut waiters = self.waiters.lock();
        if let Some(existing) = waiters.get(key) {
            return Claim::Join(Arc::clone(existing));
        }

        let waiter = Arc::new(Waiter::new(key, marker()));
        waiters.insert(key.to_owned(), Arc::clone(&waiter));
        Claim::Acquire(PendingAcquire { table: self, waiter, completed: false })
    }

    /// Deletes the marker of a held key and wakes local joiners.
    ///
    /// The in-memory entry is cleared even when deleting the marker fails; that error is
    /// returned afterwards. Keys that are absent or still being acquired are refused
    /// without touching the filesystem.
    pub(crate) fn release(&self, key: &str) -> Result<(), StorageError> {
        let mut waiters = self.waiters.lock();
        let waiter = match waiters.get(key) {
            Some(waiter) if waiter.state() == WaiterState::Held => Arc::clone(waiter),
            _ => return Err(StorageError::not_held(key)),
        };

        let removed = marker::remove(waiter.marker());
        waiter.set(WaiterState::Released);
        waiters.remove(key);

        removed.map_err(|source| StorageError::Io {
            source,
            context: Some(format!("Failed to remove lock marker {}", waiter.marker().display()).into()),
        })
    }

    pub(crate) fn held(&self) -> Vec<String> {
        let mut held: Vec<String> = self
            .waiters
            .lock()
            .values()
            .filter(|w| w.state() == WaiterState::Held)
            .map(|w| w.key.clone())
            .collect();
        held.sort_unstable();
        held
    }

    pub(crate) fn is_held(&self, key: &str) -> bool {
        self.waiters.lock().get(key).is_some_and(|w| w.state() == WaiterState::Held)
    }

    /// Whether the table tracks an attempt for the waiter's key other than `waiter`.
    fn is_superseded(&self, waiter: &Waiter) -> bool {
        self.waiters
            .lock()
            .get(waiter.key())
            .is_some_and(|current| !std::ptr::eq(Arc::as_ptr(current), waiter))
    }

    fn abandon(&self, waiter: &Arc<Waiter>) {
        let mut waiters = self.waiters.lock();
        if waiters.get(waiter.key()).is_some_and(|current| Arc::ptr_eq(current, waiter)) {
            waiters.remove(waiter.key());
        }
        waiter.set(WaiterState::Abandoned);
    }
}

/// Ownership of an in-flight acquisition.
///
/// Dropping it before [`PendingAcquire::complete`] abandons the attempt: the waiter is
/// removed from the table and joiners are woken, whether the caller returned an error or
/// its future was dropped mid-poll.
#[derive(Debug)]
pub(crate) struct PendingAcquire<'a> {
    table: &'a WaiterTable,
    waiter: Arc<Waiter>,
    completed: bool,
}

impl PendingAcquire<'_> {
    pub(crate) fn waiter(&self) -> &Waiter {
        &self.waiter
    }

    pub(crate) fn complete(mut self) {
        self.waiter.set(WaiterState::Held);
        self.completed = true;
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if !self.completed {
            warn!(key = self.waiter.key(), "Lock acquisition abandoned");
            self.table.abandon(&self.waiter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LockPolicy {
        LockPolicy { stale_after: Duration::from_secs(5), poll_interval: Duration::from_millis(10) }
    }

    fn expect_acquire<'a>(claim: Claim<'a>) -> PendingAcquire<'a> {
        match claim {
            Claim::Acquire(pending) => pending,
            Claim::Join(_) => panic!("expected to own the attempt"),
        }
    }

    fn expect_join(claim: Claim<'_>) -> Arc<Waiter> {
        match claim {
            Claim::Join(waiter) => waiter,
            Claim::Acquire(_) => panic!("expected to join an existing attempt"),
        }
    }

    #[test]
    fn second_claim_joins_the_first() {
        let table = WaiterTable::default();
        let pending = expect_acquire(table.claim("k", || PathBuf::from("k.lock")));
        let joined = expect_join(table.claim("k", || unreachable!()));
        assert_eq!(joined.key(), "k");
        pending.complete();
        assert!(table.is_held("k"));
        assert_eq!(table.held(), ["k"]);
    }

    #[test]
    fn dropped_attempt_is_removed_and_marked_abandoned() {
        let table = WaiterTable::default();
        let pending = expect_acquire(table.claim("k", || PathBuf::from("k.lock")));
        let joined = expect_join(table.claim("k", || unreachable!()));
        drop(pending);

        assert_eq!(joined.state(), WaiterState::Abandoned);
        assert!(!table.is_held("k"));
        expect_acquire(table.claim("k", || PathBuf::from("k.lock")));
    }

    #[test]
    fn release_refuses_unknown_and_acquiring_keys() {
        let table = WaiterTable::default();
        assert!(matches!(table.release("k"), Err(StorageError::LockNotHeld { .. })));

        let _pending = expect_acquire(table.claim("k", || PathBuf::from("k.lock")));
        assert!(matches!(table.release("k"), Err(StorageError::LockNotHeld { .. })));
        expect_join(table.claim("k", || unreachable!()));
    }

    #[tokio::test]
    async fn join_returns_once_released_marker_is_gone() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("k.lock");
        std::fs::write(&path, b"").unwrap();

        let table = WaiterTable::default();
        expect_acquire(table.claim("k", || path.clone())).complete();
        let joined = expect_join(table.claim("k", || unreachable!()));

        let policy = policy();
        let join = joined.join(&table, &policy, None);
        let release = async {
            tokio::task::yield_now().await;
            table.release("k").unwrap();
        };

        let both = async { tokio::join!(join, release) };
        let (outcome, ()) = tokio::time::timeout(Duration::from_secs(2), both).await.unwrap();
        outcome.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn join_stops_polling_once_a_newer_attempt_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("k.lock");
        std::fs::write(&path, b"").unwrap();

        let table = WaiterTable::default();
        expect_acquire(table.claim("k", || path.clone())).complete();
        let joined = expect_join(table.claim("k", || unreachable!()));

        let policy = policy();
        let join = joined.join(&table, &policy, None);
        let successor = async {
            tokio::task::yield_now().await;
            table.release("k").unwrap();
            std::fs::write(&path, b"").unwrap();
            expect_acquire(table.claim("k", || path.clone())).complete();
        };

        let both = async { tokio::join!(join, successor) };
        let (outcome, ()) = tokio::time::timeout(Duration::from_secs(2), both).await.unwrap();
        outcome.unwrap();
        assert!(path.exists(), "the successor's marker is live");
        assert!(table.is_held("k"));
    }

    #[tokio::test]
    async fn join_honours_the_deadline() {
        let table = WaiterTable::default();
        let _pending = expect_acquire(table.claim("k", || PathBuf::from("k.lock")));
        let joined = expect_join(table.claim("k", || unreachable!()));

        let deadline = Instant::now() + Duration::from_millis(30);
        let err = joined.join(&table, &policy(), Some(deadline)).await.unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn pause_times_out_inside_the_interval() {
        let deadline = Instant::now() + Duration::from_millis(5);
        let err = pause(Duration::from_secs(1), Some(deadline), "k").await.unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));
        pause(Duration::from_millis(1), None, "k").await.unwrap();
    }

    #[tokio::test]
    async fn pause_accepts_an_interval_past_the_clock_range() {
        let deadline = Instant::now() + Duration::from_millis(5);
        let err = pause(Duration::MAX, Some(deadline), "k").await.unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));
    }
}
