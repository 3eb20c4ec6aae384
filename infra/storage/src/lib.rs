//! A durable, sandboxed key-value store with cross-process key locks.
//!
//! Values live as plain files under a single root directory and are addressed by
//! `/`-separated keys. Independent processes sharing the root, possibly over a network
//! filesystem, coordinate through lock markers under `<root>/locks`.
//!
//! # Core Features
//!
//! - **Sandbox Security**: Keys resolve through physical path canonicalization; traversal and symlink escapes are rejected.
//! - **Atomic Writes**: Unique temp write + `fsync` + `rename`, so a crash never leaves a torn value.
//! - **Transparent Compression**: Optional LZ4 block compression, invisible to the consumer.
//! - **Key Locks**: Exclusive-create markers with staleness-based reclamation of markers left by crashed holders.
//! - **Self-Healing**: Orphaned temporary files are cleaned up on connect.
//!
//! # Architectural Overview
//!
//! 1.  **[`Storage`]**: The thread-safe handle; key-value I/O and the lock API.
//! 2.  **[`StorageBuilder`]**: A typestate builder for the root, compression and [`LockPolicy`].
//! 3.  **[`locking`]**: Marker naming, the staleness predicate and lock inspection types.
//!
//! # Examples
//!
//! ```rust
//! use lockbox_storage::{Compression, Storage, StorageError};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), StorageError> {
//!     # let tmp = tempfile::tempdir().unwrap();
//!     # let root = tmp.path().join("data");
//!     let storage = Storage::builder()
//!         .root(&root)
//!         .compression(Compression::Lz4)
//!         .stale_after(Duration::from_secs(600))
//!         .connect()
//!         .await?;
//!
//!     storage.lock("accounts/admin").await?;
//!     storage.store("accounts/admin/key.pem", b"private key").await?;
//!     storage.unlock("accounts/admin")?;
//!
//!     let data = storage.load("accounts/admin/key.pem").await?;
//!     assert_eq!(data, b"private key");
//!     Ok(())
//! }
//! ```

mod builder;
mod engine;
mod error;
pub mod locking;
mod maintenance;
mod security;

pub use builder::StorageBuilder;
pub use engine::{Compression, KeyInfo, Storage};
pub use error::{StorageError, StorageErrorExt};
pub use locking::{LockInfo, LockPolicy};
