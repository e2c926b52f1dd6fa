//! Client error types

use crate::classify::{classify, IoDisposition};
use std::io;
use tessera_crypto::CryptoError;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// Encryption, snapshot or envelope error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Reading plaintext failed and could not be continued
    #[error("plaintext source failed for part {part_number} at offset {offset}: {source}")]
    Source {
        part_number: u32,
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// The plaintext source ended before the part was full
    #[error("plaintext source ended early in part {part_number}: expected {expected} bytes, got {actual}")]
    SourceTruncated {
        part_number: u32,
        expected: u64,
        actual: u64,
    },

    /// Uploading an encrypted part failed
    #[error("uploading part {part_number} (offset {offset}) failed: {source}")]
    Transport {
        part_number: u32,
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// A part kept failing with resumable errors
    #[error("part {part_number} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        part_number: u32,
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },

    /// A part was lost and the cipher cannot be rewound to send it again
    #[error("part {part_number} was not stored and the cipher state cannot be rewound; abort and restart the upload")]
    PartLost { part_number: u32 },

    /// Saved state does not fit the plaintext source
    #[error("saved state does not match the source: {0}")]
    StateMismatch(String),

    /// Completing an upload that still has parts to send
    #[error("upload is not finished: {parts_sent} of {total_parts} parts sent")]
    Unfinished { parts_sent: u32, total_parts: u32 },

    /// IO error outside a part (sizing the source, completing, aborting)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// The I/O error behind this error, if any
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            Self::Source { source, .. } | Self::Transport { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            Self::Crypto(e) => e.io_error(),
            Self::RetriesExhausted { source, .. } => source.io_error(),
            _ => None,
        }
    }

    /// Whether repeating the operation can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RetriesExhausted { .. } => false,
            _ => self
                .io_error()
                .map_or(false, |e| classify(e) == IoDisposition::Resumable),
        }
    }

    /// Whether the upload cannot make progress without intervention
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }

    /// Part the error occurred in, if it is tied to one
    pub fn part_number(&self) -> Option<u32> {
        match self {
            Self::Source { part_number, .. }
            | Self::SourceTruncated { part_number, .. }
            | Self::Transport { part_number, .. }
            | Self::RetriesExhausted { part_number, .. }
            | Self::PartLost { part_number } => Some(*part_number),
            Self::Crypto(CryptoError::PlaintextRead { part_number, .. }) => Some(*part_number),
            _ => None,
        }
    }
}
