//! Streaming AES-GCM with a 96-bit IV
//!
//! Keystream is CTR32 starting at `inc32(J0)`; the tag is
//! `GHASH_H(C ‖ len) ⊕ E_K(J0)` with no associated data. GHASH exposes no
//! serializable state, so this engine cannot be snapshotted.

use super::{CipherEngine, Direction, EngineKind, EngineState};
use crate::{CryptoError, Result};
use aes::cipher::consts::U16;
use aes::cipher::{BlockEncrypt, BlockSizeUser, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes256};
use ctr::Ctr32BE;
use ghash::universal_hash::{KeyInit as UhfKeyInit, UniversalHash};
use ghash::GHash;

const IV_LEN: usize = 12;
const BLOCK_LEN: usize = 16;

enum Keystream {
    Aes128(Ctr32BE<Aes128>),
    Aes256(Ctr32BE<Aes256>),
}

impl Keystream {
    fn apply(&mut self, buf: &mut [u8]) -> Result<()> {
        let result = match self {
            Self::Aes128(c) => c.try_apply_keystream(buf),
            Self::Aes256(c) => c.try_apply_keystream(buf),
        };
        result.map_err(|_| CryptoError::Encryption("GCM counter space exhausted".to_string()))
    }
}

/// Hash subkey `H = E_K(0)` and tag mask `E_K(J0)`
fn derive_constants<C>(cipher: &C, iv: &[u8]) -> ([u8; BLOCK_LEN], [u8; BLOCK_LEN])
where
    C: BlockEncrypt + BlockSizeUser<BlockSize = U16>,
{
    let mut h = aes::Block::default();
    cipher.encrypt_block(&mut h);

    let mut j0 = aes::Block::default();
    j0[..IV_LEN].copy_from_slice(iv);
    j0[BLOCK_LEN - 1] = 1;
    cipher.encrypt_block(&mut j0);

    let mut hash_key = [0u8; BLOCK_LEN];
    hash_key.copy_from_slice(&h);
    let mut mask = [0u8; BLOCK_LEN];
    mask.copy_from_slice(&j0);
    (hash_key, mask)
}

/// Streaming AES-GCM engine
pub struct GcmEngine {
    kind: EngineKind,
    direction: Direction,
    keystream: Keystream,
    ghash: Option<GHash>,
    pending: Vec<u8>,
    tag_mask: [u8; BLOCK_LEN],
    position: u64,
}

impl GcmEngine {
    /// Create an engine for `kind` with a 12-byte IV
    pub fn new(kind: EngineKind, key: &[u8], iv: &[u8], direction: Direction) -> Result<Self> {
        if iv.len() != IV_LEN {
            return Err(CryptoError::InvalidArgument(format!(
                "GCM IV must be {} bytes, got {}",
                IV_LEN,
                iv.len()
            )));
        }
        let invalid =
            |e: aes::cipher::InvalidLength| CryptoError::InvalidKey(format!("{}: {}", kind, e));

        // First keystream block is inc32(J0)
        let mut counter = [0u8; BLOCK_LEN];
        counter[..IV_LEN].copy_from_slice(iv);
        counter[BLOCK_LEN - 1] = 2;

        let ((hash_key, tag_mask), keystream) = match kind {
            EngineKind::AesGcm128 => {
                let block = Aes128::new_from_slice(key).map_err(invalid)?;
                let stream = Ctr32BE::<Aes128>::new_from_slices(key, &counter).map_err(invalid)?;
                (derive_constants(&block, iv), Keystream::Aes128(stream))
            }
            EngineKind::AesGcm256 => {
                let block = Aes256::new_from_slice(key).map_err(invalid)?;
                let stream = Ctr32BE::<Aes256>::new_from_slices(key, &counter).map_err(invalid)?;
                (derive_constants(&block, iv), Keystream::Aes256(stream))
            }
            other => {
                return Err(CryptoError::Config(format!("{} is not a GCM engine", other)));
            }
        };

        let ghash = <GHash as UhfKeyInit>::new_from_slice(&hash_key).map_err(invalid)?;

        Ok(Self {
            kind,
            direction,
            keystream,
            ghash: Some(ghash),
            pending: Vec::with_capacity(BLOCK_LEN),
            tag_mask,
            position: 0,
        })
    }

    fn absorb(&mut self, mut data: &[u8]) -> Result<()> {
        let ghash = self
            .ghash
            .as_mut()
            .ok_or_else(|| CryptoError::IllegalState("GCM stream already finished".to_string()))?;

        if !self.pending.is_empty() {
            let take = (BLOCK_LEN - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == BLOCK_LEN {
                ghash.update(&[ghash::Block::clone_from_slice(&self.pending)]);
                self.pending.clear();
            }
        }

        let mut blocks = data.chunks_exact(BLOCK_LEN);
        for block in &mut blocks {
            ghash.update(&[ghash::Block::clone_from_slice(block)]);
        }
        self.pending.extend_from_slice(blocks.remainder());
        Ok(())
    }
}

impl CipherEngine for GcmEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn apply_keystream(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.direction {
            Direction::Encrypt => {
                self.keystream.apply(buf)?;
                self.absorb(buf)?;
            }
            Direction::Decrypt => {
                self.absorb(buf)?;
                self.keystream.apply(buf)?;
            }
        }
        self.position += buf.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn export_state(&self) -> Result<EngineState> {
        Err(CryptoError::Unsupported(format!(
            "{} has no encodable state and cannot be resumed",
            self.kind
        )))
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        let mut ghash = self
            .ghash
            .take()
            .ok_or_else(|| CryptoError::IllegalState("GCM stream already finished".to_string()))?;

        if !self.pending.is_empty() {
            ghash.update_padded(&self.pending);
            self.pending.clear();
        }

        // len(A) = 0, len(C) in bits
        let mut lengths = [0u8; BLOCK_LEN];
        lengths[8..].copy_from_slice(&(self.position * 8).to_be_bytes());
        ghash.update(&[ghash::Block::clone_from_slice(&lengths)]);

        let digest = ghash.finalize();
        Ok(digest
            .iter()
            .zip(self.tag_mask.iter())
            .map(|(a, b)| a ^ b)
            .collect())
    }
}
