//! HMAC-SHA256 / HMAC-SHA512 with exportable inner and outer digest state
//!
//! Built directly on the SHA-2 compression functions so the chaining values,
//! buffered tail and message length of both pads can be written out and read
//! back. Output is bit-for-bit standard HMAC.

use crate::{registry::MacAlgorithm, CryptoError, Result};
use sha2::digest::generic_array::GenericArray;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Bytes used to encode the message length in a digest state
const LENGTH_FIELD: usize = 16;

trait Compression: Clone + Send {
    const BLOCK_LEN: usize;
    /// Width of the length suffix in the final padding block
    const LENGTH_SUFFIX: usize;
    const OUTPUT_LEN: usize;
    const WORDS_LEN: usize;

    fn initial() -> Self;
    fn compress(&mut self, block: &[u8]);
    fn write_words(&self, out: &mut Vec<u8>);
    fn read_words(bytes: &[u8]) -> Self;
}

#[derive(Clone)]
struct Sha256Words([u32; 8]);

impl Compression for Sha256Words {
    const BLOCK_LEN: usize = 64;
    const LENGTH_SUFFIX: usize = 8;
    const OUTPUT_LEN: usize = 32;
    const WORDS_LEN: usize = 32;

    fn initial() -> Self {
        Self([
            0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab,
            0x5be0cd19,
        ])
    }

    fn compress(&mut self, block: &[u8]) {
        sha2::compress256(&mut self.0, std::slice::from_ref(GenericArray::from_slice(block)));
    }

    fn write_words(&self, out: &mut Vec<u8>) {
        for word in &self.0 {
            out.extend_from_slice(&word.to_be_bytes());
        }
    }

    fn read_words(bytes: &[u8]) -> Self {
        let mut words = [0u32; 8];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self(words)
    }
}

#[derive(Clone)]
struct Sha512Words([u64; 8]);

impl Compression for Sha512Words {
    const BLOCK_LEN: usize = 128;
    const LENGTH_SUFFIX: usize = 16;
    const OUTPUT_LEN: usize = 64;
    const WORDS_LEN: usize = 64;

    fn initial() -> Self {
        Self([
            0x6a09e667f3bcc908,
            0xbb67ae8584caa73b,
            0x3c6ef372fe94f82b,
            0xa54ff53a5f1d36f1,
            0x510e527fade682d1,
            0x9b05688c2b3e6c1f,
            0x1f83d9abfb41bd6b,
            0x5be0cd19137e2179,
        ])
    }

    fn compress(&mut self, block: &[u8]) {
        sha2::compress512(&mut self.0, std::slice::from_ref(GenericArray::from_slice(block)));
    }

    fn write_words(&self, out: &mut Vec<u8>) {
        for word in &self.0 {
            out.extend_from_slice(&word.to_be_bytes());
        }
    }

    fn read_words(bytes: &[u8]) -> Self {
        let mut words = [0u64; 8];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(chunk);
            *word = u64::from_be_bytes(arr);
        }
        Self(words)
    }
}

/// A running SHA-2 computation: chaining value, unprocessed tail, length
#[derive(Clone)]
struct DigestState<C: Compression> {
    words: C,
    buffer: Vec<u8>,
    length: u128,
}

impl<C: Compression> DigestState<C> {
    fn new() -> Self {
        Self {
            words: C::initial(),
            buffer: Vec::with_capacity(C::BLOCK_LEN),
            length: 0,
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        self.length = self.length.wrapping_add(data.len() as u128);

        if !self.buffer.is_empty() {
            let take = (C::BLOCK_LEN - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == C::BLOCK_LEN {
                self.words.compress(&self.buffer);
                self.buffer.clear();
            }
        }

        let mut blocks = data.chunks_exact(C::BLOCK_LEN);
        for block in &mut blocks {
            self.words.compress(block);
        }
        self.buffer.extend_from_slice(blocks.remainder());
    }

    fn finalize(mut self) -> Vec<u8> {
        let bit_len = self.length.wrapping_mul(8).to_be_bytes();
        let mut tail = std::mem::take(&mut self.buffer);
        tail.push(0x80);
        while tail.len() % C::BLOCK_LEN != C::BLOCK_LEN - C::LENGTH_SUFFIX {
            tail.push(0);
        }
        tail.extend_from_slice(&bit_len[bit_len.len() - C::LENGTH_SUFFIX..]);
        for block in tail.chunks_exact(C::BLOCK_LEN) {
            self.words.compress(block);
        }
        tail.zeroize();

        let mut out = Vec::with_capacity(C::OUTPUT_LEN);
        self.words.write_words(&mut out);
        out.truncate(C::OUTPUT_LEN);
        out
    }

    /// `words ‖ length (u128 BE) ‖ buffered tail`
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(C::WORDS_LEN + LENGTH_FIELD + self.buffer.len());
        self.words.write_words(&mut out);
        out.extend_from_slice(&self.length.to_be_bytes());
        out.extend_from_slice(&self.buffer);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let header = C::WORDS_LEN + LENGTH_FIELD;
        if bytes.len() < header || bytes.len() - header >= C::BLOCK_LEN {
            return Err(CryptoError::InvalidState(format!(
                "digest state has invalid length {}",
                bytes.len()
            )));
        }
        let words = C::read_words(&bytes[..C::WORDS_LEN]);
        let mut length = [0u8; LENGTH_FIELD];
        length.copy_from_slice(&bytes[C::WORDS_LEN..header]);
        let length = u128::from_be_bytes(length);
        let buffer = bytes[header..].to_vec();

        if length % C::BLOCK_LEN as u128 != buffer.len() as u128 {
            return Err(CryptoError::InvalidState(
                "digest length does not match buffered bytes".to_string(),
            ));
        }
        Ok(Self {
            words,
            buffer,
            length,
        })
    }
}

impl<C: Compression> Drop for DigestState<C> {
    fn drop(&mut self) {
        self.buffer.zeroize();
    }
}

#[derive(Clone)]
struct HmacPads<C: Compression> {
    inner: DigestState<C>,
    outer: DigestState<C>,
}

impl<C: Compression> HmacPads<C> {
    fn new(key: &[u8]) -> Self {
        let mut block_key = if key.len() > C::BLOCK_LEN {
            let mut digest = DigestState::<C>::new();
            digest.update(key);
            digest.finalize()
        } else {
            key.to_vec()
        };
        block_key.resize(C::BLOCK_LEN, 0);

        let mut ipad: Vec<u8> = block_key.iter().map(|b| b ^ 0x36).collect();
        let mut opad: Vec<u8> = block_key.iter().map(|b| b ^ 0x5c).collect();

        let mut inner = DigestState::new();
        inner.update(&ipad);
        let mut outer = DigestState::new();
        outer.update(&opad);

        block_key.zeroize();
        ipad.zeroize();
        opad.zeroize();
        Self { inner, outer }
    }

    fn finalize(&self) -> Vec<u8> {
        let inner_hash = self.inner.clone().finalize();
        let mut outer = self.outer.clone();
        outer.update(&inner_hash);
        outer.finalize()
    }

    fn import(inner: &[u8], outer: &[u8]) -> Result<Self> {
        Ok(Self {
            inner: DigestState::decode(inner)?,
            outer: DigestState::decode(outer)?,
        })
    }
}

#[derive(Clone)]
enum Pads {
    Sha256(HmacPads<Sha256Words>),
    Sha512(HmacPads<Sha512Words>),
}

/// Encoded inner-pad and outer-pad digest states of a running HMAC
#[derive(Clone, PartialEq, Eq)]
pub struct MacState {
    /// Algorithm that produced the state
    pub algorithm: MacAlgorithm,
    /// Inner (ipad) digest state
    pub inner: Vec<u8>,
    /// Outer (opad) digest state
    pub outer: Vec<u8>,
}

impl fmt::Debug for MacState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacState")
            .field("algorithm", &self.algorithm)
            .field("inner", &format_args!("[{} bytes]", self.inner.len()))
            .field("outer", &format_args!("[{} bytes]", self.outer.len()))
            .finish()
    }
}

impl Drop for MacState {
    fn drop(&mut self) {
        self.inner.zeroize();
        self.outer.zeroize();
    }
}

/// HMAC whose running state can be exported and restored
#[derive(Clone)]
pub struct ResumableHmac {
    algorithm: MacAlgorithm,
    pads: Pads,
}

impl ResumableHmac {
    /// Key a new HMAC
    pub fn new(algorithm: MacAlgorithm, key: &[u8]) -> Self {
        let pads = match algorithm {
            MacAlgorithm::HmacSha256 => Pads::Sha256(HmacPads::new(key)),
            MacAlgorithm::HmacSha512 => Pads::Sha512(HmacPads::new(key)),
        };
        Self { algorithm, pads }
    }

    /// Rebuild an HMAC from exported state
    pub fn import(state: &MacState) -> Result<Self> {
        let pads = match state.algorithm {
            MacAlgorithm::HmacSha256 => Pads::Sha256(HmacPads::import(&state.inner, &state.outer)?),
            MacAlgorithm::HmacSha512 => Pads::Sha512(HmacPads::import(&state.inner, &state.outer)?),
        };
        Ok(Self {
            algorithm: state.algorithm,
            pads,
        })
    }

    /// Algorithm in use
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }

    /// Absorb more data
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.pads {
            Pads::Sha256(p) => p.inner.update(data),
            Pads::Sha512(p) => p.inner.update(data),
        }
    }

    /// Compute the MAC over everything absorbed so far, leaving the state untouched
    pub fn finalize(&self) -> Vec<u8> {
        match &self.pads {
            Pads::Sha256(p) => p.finalize(),
            Pads::Sha512(p) => p.finalize(),
        }
    }

    /// Constant-time comparison of the current MAC against `expected`
    pub fn verify(&self, expected: &[u8]) -> bool {
        let actual = self.finalize();
        actual.len() == expected.len() && bool::from(actual.ct_eq(expected))
    }

    /// Encode both pad states
    pub fn export_state(&self) -> MacState {
        let (inner, outer) = match &self.pads {
            Pads::Sha256(p) => (p.inner.encode(), p.outer.encode()),
            Pads::Sha512(p) => (p.inner.encode(), p.outer.encode()),
        };
        MacState {
            algorithm: self.algorithm,
            inner,
            outer,
        }
    }
}

impl fmt::Debug for ResumableHmac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumableHmac")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}
