//! Error types for the tessera-crypto crate

use std::io;
use thiserror::Error;

/// Result type alias using `CryptoError`
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur while encrypting, snapshotting or persisting an upload
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Offset/length pair does not fit inside the caller's buffer
    #[error("range out of bounds: offset {offset} + length {length} exceeds buffer of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        length: usize,
        capacity: usize,
    },

    /// Invalid argument (zero buffer sizes and similar programming errors)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Part numbers must advance by exactly one
    #[error("part {actual} is out of order: expected part {expected}")]
    PartOutOfOrder { expected: u32, actual: u32 },

    /// Operation is not valid in the current state
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Another caller is already mutating this upload
    #[error("upload is already being encrypted by another caller")]
    ConcurrentAccess,

    /// Unknown cipher or MAC identifier
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid key format or length
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The engine has no encodable state, so it cannot be resumed
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Encoded engine or MAC state could not be parsed
    #[error("invalid engine state: {0}")]
    InvalidState(String),

    /// MAC or AEAD tag did not verify
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Envelope bytes are structurally malformed
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Encryption failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Plaintext source failed while a part was being encrypted
    #[error("reading plaintext for part {part_number} failed at offset {offset}: {source}")]
    PlaintextRead {
        part_number: u32,
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CryptoError {
    /// Returns the underlying I/O error, if this error came from I/O
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            Self::Io(e) => Some(e),
            Self::PlaintextRead { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Convert into an `io::Error` for `Read`/`Write` implementations.
    ///
    /// I/O errors pass through untouched so their kind survives for
    /// classification further up.
    pub fn into_io_error(self) -> io::Error {
        match self {
            Self::Io(e) => e,
            Self::PlaintextRead { source, .. } => source,
            Self::OutOfBounds { .. } | Self::InvalidArgument(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, self)
            }
            Self::IllegalState(_) => io::Error::new(io::ErrorKind::NotConnected, self),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
