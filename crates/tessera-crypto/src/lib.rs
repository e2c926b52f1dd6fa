//! # Tessera Crypto
//!
//! Resumable client-side encryption for multipart uploads.
//!
//! This crate provides:
//! - **Cipher engines**: AES-CTR (resumable) and streaming AES-GCM behind one
//!   [`CipherEngine`](engine::CipherEngine) trait
//! - **Resumable HMAC**: HMAC-SHA256/512 whose inner and outer states can be
//!   exported and re-imported
//! - **Continuable streams**: a byte source that can be spliced onto a
//!   replacement after an I/O failure, and relays that carry one stream
//!   across per-part endpoints
//! - **Encryption pipeline**: one cipher stream spanning every part of an
//!   upload, with snapshot/rewind for byte-identical retries
//! - **State envelopes**: authenticated, encrypted persistence of upload
//!   state for resuming in another process
//!
//! ## Security Model
//!
//! - The secret key is supplied by the caller and never persisted
//! - Cipher and MAC keys are derived separately with HKDF-SHA256
//! - Every upload and every envelope gets a fresh random IV
//! - MACs and tags are compared in constant time
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_crypto::{CryptoRegistry, EncryptionPipeline, SecretKey, StateSnapshotter};
//!
//! let registry = CryptoRegistry::standard();
//! let key = SecretKey::generate();
//! let mut pipeline = EncryptionPipeline::initiate(&registry, &key, "AES256/CTR/NoPadding")?;
//!
//! let snapshot = StateSnapshotter::record(&pipeline)?;
//! let part = match pipeline.encrypt_part(1, reader) {
//!     Ok(part) => part,
//!     Err(_) => {
//!         StateSnapshotter::rewind(&mut pipeline, &snapshot)?;
//!         pipeline.encrypt_part(1, reopened_reader)?
//!     }
//! };
//! ```

pub mod decrypt;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod pipeline;
pub mod registry;
pub mod snapshot;
pub mod stream;

pub use decrypt::{decrypt_object, decrypt_parts, ObjectDecryptor};
pub use engine::{CipherEngine, Direction, EngineKind, EngineState, MacState};
pub use envelope::{
    CompletedPart, EnvelopeCodec, ResumableUploadState, UploadMetadata, ENVELOPE_FORMAT_VERSION,
    STATE_SCHEMA_VERSION,
};
pub use error::{CryptoError, Result};
pub use keys::SecretKey;
pub use pipeline::{EncryptionPipeline, SharedPipeline, UploadPhase};
pub use registry::{CipherDescriptor, CipherFamily, CryptoRegistry, MacAlgorithm};
pub use snapshot::{EncryptionStateSnapshot, StateSnapshotter};
pub use stream::{ContinuableByteSource, SpliceReader, SpliceWriter};

/// Cipher used when the caller does not choose one
pub const DEFAULT_CIPHER: &str = "AES256/CTR/NoPadding";

/// Default plaintext bytes per part (8 MB)
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;
