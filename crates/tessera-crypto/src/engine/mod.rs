//! Cipher and MAC engines with exportable state
//!
//! Every engine the pipeline can drive implements [`CipherEngine`]. Engines
//! that can be resumed encode their position into an [`EngineState`] and are
//! rebuilt from it with [`EngineState::import`]. Engines that cannot be resumed
//! report [`CryptoError::Unsupported`] from `export_state` instead of
//! producing a state that would yield the wrong keystream on retry.

mod ctr;
mod gcm;
mod hmac;

pub use self::ctr::CtrEngine;
pub use self::gcm::GcmEngine;
pub use self::hmac::{MacState, ResumableHmac};

use crate::{CryptoError, Result};
use std::fmt;

/// Which way an engine is running. Only matters for modes that
/// authenticate the ciphertext themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Identity of a concrete engine implementation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineKind {
    AesCtr128,
    AesCtr192,
    AesCtr256,
    AesGcm128,
    AesGcm256,
}

impl EngineKind {
    /// Stable name used in persisted state
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AesCtr128 => "aes-ctr-128",
            Self::AesCtr192 => "aes-ctr-192",
            Self::AesCtr256 => "aes-ctr-256",
            Self::AesGcm128 => "aes-gcm-128",
            Self::AesGcm256 => "aes-gcm-256",
        }
    }

    /// Parse a persisted engine name
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "aes-ctr-128" => Ok(Self::AesCtr128),
            "aes-ctr-192" => Ok(Self::AesCtr192),
            "aes-ctr-256" => Ok(Self::AesCtr256),
            "aes-gcm-128" => Ok(Self::AesGcm128),
            "aes-gcm-256" => Ok(Self::AesGcm256),
            other => Err(CryptoError::InvalidState(format!(
                "unknown engine: {}",
                other
            ))),
        }
    }

    /// Whether engines of this kind can export their state
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::AesCtr128 | Self::AesCtr192 | Self::AesCtr256)
    }

    /// Build a fresh engine positioned at the start of the stream
    pub fn create(
        &self,
        key: &[u8],
        iv: &[u8],
        direction: Direction,
    ) -> Result<Box<dyn CipherEngine>> {
        match self {
            Self::AesCtr128 | Self::AesCtr192 | Self::AesCtr256 => {
                Ok(Box::new(CtrEngine::new(*self, key, iv)?))
            }
            Self::AesGcm128 | Self::AesGcm256 => {
                Ok(Box::new(GcmEngine::new(*self, key, iv, direction)?))
            }
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine identity plus its encoded internal state
#[derive(Clone, PartialEq, Eq)]
pub struct EngineState {
    /// Which engine produced the state
    pub kind: EngineKind,
    /// Engine-specific encoding
    pub encoded: Vec<u8>,
}

impl EngineState {
    /// IV the state belongs to, for engines that encode it
    pub fn iv(&self) -> Option<&[u8]> {
        match self.kind {
            EngineKind::AesCtr128 | EngineKind::AesCtr192 | EngineKind::AesCtr256 => {
                self.encoded.get(..self::ctr::IV_LEN)
            }
            EngineKind::AesGcm128 | EngineKind::AesGcm256 => None,
        }
    }

    /// Rebuild a live engine from this state
    pub fn import(&self, key: &[u8]) -> Result<Box<dyn CipherEngine>> {
        match self.kind {
            EngineKind::AesCtr128 | EngineKind::AesCtr192 | EngineKind::AesCtr256 => {
                Ok(Box::new(CtrEngine::import(self.kind, key, &self.encoded)?))
            }
            EngineKind::AesGcm128 | EngineKind::AesGcm256 => Err(CryptoError::Unsupported(
                format!("{} engines cannot be restored from state", self.kind),
            )),
        }
    }
}

impl fmt::Debug for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineState")
            .field("kind", &self.kind)
            .field("encoded", &hex::encode(&self.encoded))
            .finish()
    }
}

/// A stateful stream cipher the pipeline drives across part boundaries
pub trait CipherEngine: Send {
    /// Engine identity
    fn kind(&self) -> EngineKind;

    /// Transform `buf` in place and advance the stream position
    fn apply_keystream(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Number of bytes processed since the start of the stream
    fn position(&self) -> u64;

    /// Encode the current position without mutating the engine
    fn export_state(&self) -> Result<EngineState>;

    /// Close the stream and return its authentication tag, if the mode has one
    fn finish(&mut self) -> Result<Vec<u8>>;
}
