use std::borrow::Cow;

/// A specialized [`StorageError`] enum of this crate.
#[lockbox_derive::lockbox_error]
pub enum StorageError {
    #[error("Directory not found{}: {message}", format_context(.context))]
    DirectoryNotFound { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("File not found{}: {message}", format_context(.context))]
    FileNotFound { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Path traversal security violation{}: {message}", format_context(.context))]
    PathTraversalAttempt { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Invalid key{}: {message}", format_context(.context))]
    InvalidKey { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Invalid storage configuration{}: {message}", format_context(.context))]
    InvalidConfiguration { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// `unlock` was called for a key this instance does not hold.
    #[error("No lock to release{}: {message}", format_context(.context))]
    LockNotHeld { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    /// The caller's deadline passed before the lock became free.
    #[error("Timed out waiting for lock{}: {message}", format_context(.context))]
    LockTimeout { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Hardware I/O failure{}: {source}", format_context(.context))]
    Io { source: std::io::Error, context: Option<Cow<'static, str>> },

    #[error("Decompression failure{}: {source}", format_context(.context))]
    Decompress { source: lz4_flex::block::DecompressError, context: Option<Cow<'static, str>> },

    #[error("Internal storage fault{}: {message}", format_context(.context))]
    Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

impl StorageError {
    pub(crate) fn not_held(key: &str) -> Self {
        Self::LockNotHeld { message: key.to_owned().into(), context: None }
    }

    pub(crate) fn lock_timeout(key: &str) -> Self {
        Self::LockTimeout { message: key.to_owned().into(), context: None }
    }

    pub(crate) fn invalid_key(key: &str, reason: &'static str) -> Self {
        Self::InvalidKey { message: key.to_owned().into(), context: Some(reason.into()) }
    }
}
