//! Core storage engine: atomic, optionally compressed key-value I/O under a sandboxed root.
//!
//! Every operation resolves its logical key through [`security`](crate::security) first,
//! so nothing in this module ever touches a path outside the configured root.

use crate::builder::StorageBuilder;
use crate::error::{StorageError, StorageErrorExt};
use crate::locking::{LockPolicy, WaiterTable};
use crate::{maintenance, security};
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use walkdir::WalkDir;

/// Directory under the root that holds lock markers. Keys may not start with it.
pub(crate) const LOCKS_DIR: &str = "locks";
/// Infix of in-flight temporary files produced by [`Storage::store`].
pub(crate) const TMP_INFIX: &str = ".lockboxtmp.";

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum Compression {
    #[default]
    None,
    Lz4,
}

impl Compression {
    #[must_use]
    fn compress(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::None => data.to_vec(),
            Self::Lz4 => lz4_flex::compress_prepend_size(data),
        }
    }

    fn decompress(self, data: Vec<u8>) -> Result<Vec<u8>, StorageError> {
        match self {
            Self::None => Ok(data),
            Self::Lz4 => {
                lz4_flex::decompress_size_prepended(&data).context("Lz4 decompression failed")
            },
        }
    }
}

/// Metadata about a stored key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key: String,
    pub modified: SystemTime,
    /// Size on disk; the compressed size when compression is enabled.
    pub size: u64,
    /// `false` when the key names a directory of further keys.
    pub is_terminal: bool,
}

/// The internal shared state of a [`Storage`] instance.
#[derive(Debug)]
pub struct StorageInner {
    /// The canonicalized physical path on the disk where all data is stored.
    pub(crate) root: PathBuf,
    pub(crate) compression: Compression,
    /// A unique counter used to generate temporary file names.
    pub(crate) tmp_counter: AtomicU64,
    pub(crate) policy: LockPolicy,
    /// Locks held or being acquired through this instance.
    pub(crate) waiters: WaiterTable,
}

/// A thread-safe handle to a filesystem-backed key-value store.
///
/// Keys are `/`-separated paths relative to the root, e.g. `certificates/acme/example.com.crt`.
/// The handle is reference counted; clones share the same lock table, so two clones act as
/// one process-local owner while two separately connected instances behave like two
/// independent processes.
///
/// # Example
///
/// ```rust
/// use lockbox_storage::{Storage, StorageError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), StorageError> {
///     # let tmp = tempfile::tempdir().unwrap();
///     let storage = Storage::builder().root(tmp.path()).connect().await?;
///
///     storage.lock("certificates/example.com").await?;
///     storage.store("certificates/example.com/cert.pem", b"-----BEGIN CERTIFICATE-----").await?;
///     storage.unlock("certificates/example.com")?;
///
///     let keys = storage.list("certificates", true).await?;
///     assert_eq!(keys, ["certificates/example.com", "certificates/example.com/cert.pem"]);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Storage {
    pub(crate) inner: Arc<StorageInner>,
}

impl Deref for Storage {
    type Target = StorageInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage:{}", self.root.display())
    }
}

impl Storage {
    #[must_use = "The storage engine is not initialized until you call .connect()"]
    pub fn builder() -> StorageBuilder {
        StorageBuilder::new()
    }

    /// The canonical storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lock timing currently in effect.
    #[must_use]
    pub fn lock_policy(&self) -> LockPolicy {
        self.inner.policy
    }

    /// Returns the physical path a key is stored at.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PathTraversalAttempt`] if the key tries to escape the root and
    /// [`StorageError::InvalidKey`] for empty keys or keys inside the reserved `locks` area.
    pub fn filename(&self, key: &str) -> Result<PathBuf, StorageError> {
        security::resolve_key(&self.root, key)
    }

    /// Returns `true` if anything is stored at `key`.
    ///
    /// # Errors
    ///
    /// Only key validation errors are returned; a missing key is `Ok(false)`.
    pub fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.filename(key)?.exists())
    }

    /// Loads the value stored at `key`, decompressing it if compression is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::FileNotFound`] if nothing is stored at the key and
    /// [`StorageError::Decompress`] if the stored bytes are not valid LZ4 blocks.
    pub async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let resolved = self.filename(key)?;

        let data = match fs::read(&resolved).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::FileNotFound {
                    message: key.to_owned().into(),
                    context: None,
                });
            },
            Err(err) => {
                return Err(StorageError::Io {
                    source: err,
                    context: Some(format!("Read failed: {}", resolved.display()).into()),
                });
            },
        };

        self.compression.decompress(data)
    }

    /// Stores `value` at `key` atomically.
    ///
    /// The value is written to a unique temporary sibling, synced, then renamed over the
    /// target, so readers observe either the previous value or the new one. Parent
    /// directories are created as needed. On unix, directories are created `0700` and
    /// files `0600`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the disk is full, permissions are missing or the
    /// rename fails.
    pub async fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let resolved = self.filename(key)?;

        if let Some(parent) = resolved.parent() {
            create_private_dir(parent)
                .await
                .context(format!("Failed to create parents of {}", resolved.display()))?;
        }

        let temp = unique_tmp_path(&resolved, &self.tmp_counter);
        let payload = self.compression.compress(value);

        {
            let mut file = private_file_options()
                .open(&temp)
                .await
                .context(format!("Temp creation failed: {}", temp.display()))?;
            file.write_all(&payload).await.context("Write failed")?;
            file.sync_all().await.context("Hardware sync failed")?;
        }

        if let Err(err) = fs::rename(&temp, &resolved).await {
            let _ = fs::remove_file(&temp).await;
            return Err(StorageError::Io {
                source: err,
                context: Some(
                    format!("Atomic swap failed: {} -> {}", temp.display(), resolved.display())
                        .into(),
                ),
            });
        }

        if let Some(parent) = resolved.parent() {
            Self::sync_dir(parent).await;
        }

        debug!(key, path = %resolved.display(), "Value stored atomically");
        Ok(())
    }

    /// Deletes the value stored at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::FileNotFound`] if nothing is stored at the key.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let resolved = self.filename(key)?;
        match fs::remove_file(&resolved).await {
            Ok(()) => {},
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::FileNotFound {
                    message: key.to_owned().into(),
                    context: None,
                });
            },
            Err(err) => {
                return Err(StorageError::Io {
                    source: err,
                    context: Some(format!("Failed to delete: {}", resolved.display()).into()),
                });
            },
        }
        debug!(key, "Value deleted");
        Ok(())
    }

    /// Lists the keys below `prefix`.
    ///
    /// Keys are reported as `prefix/suffix` with `/` separators. When `recursive` is false
    /// only direct children are returned (sub-directories appear as keys but are not
    /// descended into). An empty prefix lists from the root. Temporary files and the lock
    /// area are never reported.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DirectoryNotFound`] if `prefix` does not exist.
    pub async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>, StorageError> {
        let base = security::resolve_prefix(&self.root, prefix)?;
        let prefix = prefix.trim_matches('/').to_owned();
        let root = self.root.clone();

        tokio::task::spawn_blocking(move || walk_keys(&root, &base, &prefix, recursive))
            .await
            .map_err(|err| StorageError::Internal {
                message: err.to_string().into(),
                context: Some("Key listing task failed".into()),
            })?
    }

    /// Returns metadata about `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::FileNotFound`] if nothing is stored at the key.
    pub async fn stat(&self, key: &str) -> Result<KeyInfo, StorageError> {
        let resolved = self.filename(key)?;
        let meta = match fs::metadata(&resolved).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::FileNotFound {
                    message: key.to_owned().into(),
                    context: None,
                });
            },
            Err(err) => {
                return Err(StorageError::Io {
                    source: err,
                    context: Some(format!("Failed to get metadata: {}", resolved.display()).into()),
                });
            },
        };

        Ok(KeyInfo {
            key: key.to_owned(),
            modified: meta.modified().context("Modification time unavailable")?,
            size: meta.len(),
            is_terminal: !meta.is_dir(),
        })
    }

    pub(crate) async fn purge_tmp(&self) {
        maintenance::purge_tmp(&self.root).await;
    }

    async fn sync_dir(path: &Path) {
        match fs::File::open(path).await {
            Ok(dir) => {
                if let Err(err) = dir.sync_all().await {
                    tracing::warn!(path = %path.display(), error = %err, "Directory sync failed");
                }
            },
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Directory open failed");
            },
        }
    }
}

/// `create_dir_all`, restricted to the owner on unix.
pub(crate) async fn create_private_dir(path: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(path).await
}

fn private_file_options() -> fs::OpenOptions {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    options
}

fn unique_tmp_path(target: &Path, counter: &AtomicU64) -> PathBuf {
    let counter = counter.fetch_add(1, Ordering::Relaxed);
    let file_name = target.file_name().and_then(|s| s.to_str()).unwrap_or("value");
    target.with_file_name(format!("{file_name}{TMP_INFIX}{}.{counter}", std::process::id()))
}

fn walk_keys(
    root: &Path,
    base: &Path,
    prefix: &str,
    recursive: bool,
) -> Result<Vec<String>, StorageError> {
    if !base.exists() {
        return Err(StorageError::DirectoryNotFound {
            message: prefix.to_owned().into(),
            context: None,
        });
    }

    let locks = root.join(LOCKS_DIR);
    let mut walker = WalkDir::new(base).min_depth(1).sort_by_file_name();
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut keys = Vec::new();
    for entry in walker.into_iter().filter_entry(|e| e.path() != locks) {
        let entry = entry.map_err(|err| StorageError::Io {
            source: err.into(),
            context: Some(format!("Failed to walk {}", base.display()).into()),
        })?;

        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_file() && name.contains(TMP_INFIX) {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(base) else { continue };
        let suffix = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        keys.push(if prefix.is_empty() { suffix } else { format!("{prefix}/{suffix}") });
    }

    Ok(keys)
}
