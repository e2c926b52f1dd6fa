//! AES in counter mode with a 128-bit big-endian counter
//!
//! State encoding: `IV (16 bytes) ‖ byte position (u64, big-endian)`. The
//! key is never part of the encoding.

use super::{CipherEngine, EngineKind, EngineState};
use crate::{CryptoError, Result};
use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr128BE;

pub(crate) const IV_LEN: usize = 16;
const STATE_LEN: usize = IV_LEN + 8;

enum Keystream {
    Aes128(Ctr128BE<Aes128>),
    Aes192(Ctr128BE<Aes192>),
    Aes256(Ctr128BE<Aes256>),
}

impl Keystream {
    fn new(kind: EngineKind, key: &[u8], iv: &[u8]) -> Result<Self> {
        let invalid = |e: ctr::cipher::InvalidLength| {
            CryptoError::InvalidKey(format!("{} key/IV rejected: {}", kind, e))
        };
        match kind {
            EngineKind::AesCtr128 => Ctr128BE::<Aes128>::new_from_slices(key, iv)
                .map(Self::Aes128)
                .map_err(invalid),
            EngineKind::AesCtr192 => Ctr128BE::<Aes192>::new_from_slices(key, iv)
                .map(Self::Aes192)
                .map_err(invalid),
            EngineKind::AesCtr256 => Ctr128BE::<Aes256>::new_from_slices(key, iv)
                .map(Self::Aes256)
                .map_err(invalid),
            other => Err(CryptoError::Config(format!(
                "{} is not a counter-mode engine",
                other
            ))),
        }
    }

    fn apply(&mut self, buf: &mut [u8]) -> Result<()> {
        let result = match self {
            Self::Aes128(c) => c.try_apply_keystream(buf),
            Self::Aes192(c) => c.try_apply_keystream(buf),
            Self::Aes256(c) => c.try_apply_keystream(buf),
        };
        result.map_err(|_| CryptoError::Encryption("counter space exhausted".to_string()))
    }

    fn position(&self) -> u64 {
        match self {
            Self::Aes128(c) => c.current_pos(),
            Self::Aes192(c) => c.current_pos(),
            Self::Aes256(c) => c.current_pos(),
        }
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        let result = match self {
            Self::Aes128(c) => c.try_seek(position),
            Self::Aes192(c) => c.try_seek(position),
            Self::Aes256(c) => c.try_seek(position),
        };
        result.map_err(|_| {
            CryptoError::InvalidState(format!("cannot seek counter to byte {}", position))
        })
    }
}

/// Resumable AES-CTR engine
pub struct CtrEngine {
    kind: EngineKind,
    iv: [u8; IV_LEN],
    keystream: Keystream,
}

impl CtrEngine {
    /// Create an engine at stream position 0
    pub fn new(kind: EngineKind, key: &[u8], iv: &[u8]) -> Result<Self> {
        if iv.len() != IV_LEN {
            return Err(CryptoError::InvalidArgument(format!(
                "CTR IV must be {} bytes, got {}",
                IV_LEN,
                iv.len()
            )));
        }
        let keystream = Keystream::new(kind, key, iv)?;
        let mut arr = [0u8; IV_LEN];
        arr.copy_from_slice(iv);
        Ok(Self {
            kind,
            iv: arr,
            keystream,
        })
    }

    /// Rebuild an engine from its encoded state
    pub fn import(kind: EngineKind, key: &[u8], encoded: &[u8]) -> Result<Self> {
        if encoded.len() != STATE_LEN {
            return Err(CryptoError::InvalidState(format!(
                "CTR state must be {} bytes, got {}",
                STATE_LEN,
                encoded.len()
            )));
        }
        let (iv, position) = encoded.split_at(IV_LEN);
        let mut pos = [0u8; 8];
        pos.copy_from_slice(position);

        let mut engine = Self::new(kind, key, iv)?;
        engine.keystream.seek(u64::from_be_bytes(pos))?;
        Ok(engine)
    }

    /// The initial counter block
    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }
}

impl CipherEngine for CtrEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn apply_keystream(&mut self, buf: &mut [u8]) -> Result<()> {
        self.keystream.apply(buf)
    }

    fn position(&self) -> u64 {
        self.keystream.position()
    }

    fn export_state(&self) -> Result<EngineState> {
        let mut encoded = Vec::with_capacity(STATE_LEN);
        encoded.extend_from_slice(&self.iv);
        encoded.extend_from_slice(&self.position().to_be_bytes());
        Ok(EngineState {
            kind: self.kind,
            encoded,
        })
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}
