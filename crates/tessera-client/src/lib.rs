//! # Tessera Client
//!
//! Drives encrypted multipart uploads on top of `tessera-crypto`.
//!
//! ## Features
//!
//! - **Transparent retries**: plaintext read failures are continued from the
//!   last confirmed byte; upload failures rewind the cipher and resend the part
//! - **Failure classification**: interrupted, refused, unknown-host and TLS
//!   failures stop the upload; everything else is retried
//! - **Cross-process resume**: upload state is saved as an authenticated,
//!   encrypted envelope and restored with the same key
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_client::{EncryptedMultipartUpload, FileSource, UploadConfig};
//! use tessera_crypto::SecretKey;
//!
//! let key = SecretKey::generate();
//! let mut upload = EncryptedMultipartUpload::start(
//!     UploadConfig::default(),
//!     &key,
//!     "/videos/big.mp4",
//!     my_transport,
//!     FileSource::new("big.mp4"),
//! )?;
//!
//! while let Some(part) = upload.upload_next_part()? {
//!     std::fs::write("upload.state", upload.save_state(&key)?)?;
//!     println!("part {} stored as {}", part.part_number, part.etag);
//! }
//! upload.complete()?;
//! ```

pub mod classify;
mod config;
mod error;
pub mod transport;
mod upload;

pub use classify::{classify, FatalCause, IoDisposition};
pub use config::{UploadConfig, MAX_PART_SIZE};
pub use error::{ClientError, Result};
pub use transport::{FileSource, MemorySource, MemoryTransport, PartTransport, RangeSource};
pub use upload::{EncryptedMultipartUpload, UploadProgress};

// Re-export the crypto types callers need alongside the client
pub use tessera_crypto::{CompletedPart, CryptoError, SecretKey, UploadMetadata};
