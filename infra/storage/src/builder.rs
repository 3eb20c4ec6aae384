use crate::engine::{Compression, Storage, StorageInner};
use crate::error::{StorageError, StorageErrorExt};
use crate::locking::{LockPolicy, WaiterTable};
use private::Sealed;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;
use tokio::fs;
use tracing::info;

#[derive(Debug, Clone)]
struct StorageConfig {
    compression: Compression,
    create: bool,
    policy: LockPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { compression: Compression::None, create: true, policy: LockPolicy::default() }
    }
}

#[derive(Debug, Default)]
pub struct NoRoot;
#[derive(Debug)]
pub struct WithRoot(PathBuf);

mod private {
    pub(super) trait Sealed {}
}
impl Sealed for NoRoot {}
impl Sealed for WithRoot {}

#[allow(private_bounds)]
#[derive(Debug, Default)]
pub struct StorageBuilder<S: Sealed = NoRoot> {
    state: S,
    config: StorageConfig,
}

#[allow(private_bounds)]
impl<S: Sealed> StorageBuilder<S> {
    #[must_use = "Sets compression for stored values"]
    pub const fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    #[must_use = "Sets whether the storage root should be created if it does not exist"]
    pub const fn create(mut self, enable: bool) -> Self {
        self.config.create = enable;
        self
    }

    /// Age past which a lock marker is presumed abandoned and may be reclaimed.
    #[must_use = "Sets the lock staleness threshold"]
    pub const fn stale_after(mut self, threshold: Duration) -> Self {
        self.config.policy.stale_after = threshold;
        self
    }

    /// Delay between attempts while a lock is held elsewhere.
    #[must_use = "Sets the lock polling interval"]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.policy.poll_interval = interval;
        self
    }

    #[must_use = "Replaces the whole lock policy"]
    pub const fn lock_policy(mut self, policy: LockPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    fn transition<N: Sealed>(self, state: N) -> StorageBuilder<N> {
        StorageBuilder { state, config: self.config }
    }
}

impl StorageBuilder<NoRoot> {
    #[must_use = "Creates a new storage builder with default configuration"]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use = "Sets the root directory path for the storage engine"]
    pub fn root(self, path: impl Into<PathBuf>) -> StorageBuilder<WithRoot> {
        self.transition(WithRoot(path.into()))
    }
}

impl StorageBuilder<WithRoot> {
    /// Consumes the configuration and opens the store.
    ///
    /// Boot sequence:
    /// 1. **Validation**: the lock policy must have non-zero durations.
    /// 2. **Bootstrapping**: creates the root directory if `create(true)` was set.
    /// 3. **Canonicalization**: resolves the root to a physical path so symlinks cannot
    ///    be used to escape it.
    /// 4. **Self-Healing**: removes orphaned temporary files left by crashed writers.
    ///    Lock markers are left alone; they are reclaimed only through staleness.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidConfiguration`] for a zero poll interval or staleness
    /// threshold, and [`StorageError::Io`] if the root cannot be created or resolved.
    pub async fn connect(self) -> Result<Storage, StorageError> {
        let root = &self.state.0;
        self.config.policy.validate()?;

        if self.config.create {
            crate::engine::create_private_dir(root)
                .await
                .context(format!("Failed to bootstrap storage root: {}", root.display()))?;
            info!(path = %root.display(), "Bootstrapped storage root directory");
        }

        let canonical = fs::canonicalize(root)
            .await
            .context(format!("Failed to resolve storage root: {}", root.display()))?;

        let storage = Storage {
            inner: Arc::new(StorageInner {
                root: canonical,
                compression: self.config.compression,
                tmp_counter: AtomicU64::new(1),
                policy: self.config.policy,
                waiters: WaiterTable::default(),
            }),
        };

        storage.purge_tmp().await;

        Ok(storage)
    }
}
