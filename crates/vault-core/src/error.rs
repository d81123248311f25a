//! Error types for vault-core

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for vault-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while opening, saving or mutating a vault
#[derive(Error, Debug)]
pub enum Error {
    /// Structural corruption detected before any decryption was attempted
    #[error("malformed container header: {0}")]
    MalformedHeader(String),

    /// The container declares a format version this build does not read
    #[error("unsupported container version: {0}.{1}")]
    UnsupportedVersion(u16, u16),

    /// The container names a key derivation function this build does not know
    #[error("unsupported key derivation function: id {0}")]
    UnsupportedKdf(u32),

    /// The container names a cipher this build does not know
    #[error("unsupported cipher: id {0}")]
    UnsupportedCipher(u32),

    /// Wrong secret or tampered/corrupted body. Deliberately carries no
    /// detail: callers must not be able to tell the two cases apart.
    #[error("authentication failed: wrong secret or corrupted data")]
    AuthenticationFailed,

    /// Key derivation cost parameters are outside the algorithm's valid range
    #[error("invalid key derivation parameters: {0}")]
    InvalidParams(String),

    /// The operation was cancelled before the cipher stage began
    #[error("operation cancelled")]
    Cancelled,

    /// The body authenticated but its inner structure does not parse
    #[error("corrupted database body: {0}")]
    Corrupted(String),

    /// Entry not found
    #[error("entry not found: {0}")]
    EntryNotFound(Uuid),

    /// Group not found
    #[error("group not found: {0}")]
    GroupNotFound(Uuid),

    /// Invalid group operation (cycle, root deletion, ...)
    #[error("invalid group operation: {0}")]
    InvalidGroup(String),

    /// Referenced binary attachment is not in the pool
    #[error("binary attachment not found")]
    BinaryNotFound,

    /// IO error
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
