//! Decryption of completed objects
//!
//! An object written by [`EncryptionPipeline`](crate::pipeline::EncryptionPipeline)
//! is `ciphertext ‖ trailer`. The decryptor holds back the last `trailer_len`
//! bytes it has seen, since they might be the trailer, and checks them in
//! constant time once the input ends.

use crate::{
    engine::{CipherEngine, Direction, ResumableHmac},
    keys::SecretKey,
    pipeline::authenticator,
    registry::{CipherDescriptor, CryptoRegistry},
    stream::{SpliceReader, DEFAULT_RELAY_BUFFER_SIZE},
    CryptoError, Result,
};
use std::io::{Read, Write};
use subtle::ConstantTimeEq;
use tracing::debug;

/// Incremental decryptor for one object
pub struct ObjectDecryptor {
    descriptor: CipherDescriptor,
    engine: Box<dyn CipherEngine>,
    mac: Option<ResumableHmac>,
    trailer_len: usize,
    held: Vec<u8>,
}

impl ObjectDecryptor {
    /// Prepare to decrypt an object encrypted under `key` with `iv`
    pub fn new(registry: &CryptoRegistry, key: &SecretKey, cipher_id: &str, iv: &[u8]) -> Result<Self> {
        let descriptor = *registry.cipher(cipher_id)?;
        if iv.len() != descriptor.iv_len {
            return Err(CryptoError::InvalidArgument(format!(
                "{} needs a {}-byte IV, got {}",
                descriptor.id,
                descriptor.iv_len,
                iv.len()
            )));
        }
        let keys = key.derive(&descriptor)?;
        let engine = descriptor
            .engine
            .create(keys.cipher_key(), iv, Direction::Decrypt)?;
        let mac = authenticator(registry, &descriptor, &keys, iv);
        let trailer_len = descriptor.tag_len + mac.as_ref().map_or(0, |m| m.algorithm().output_len());
        Ok(Self {
            descriptor,
            engine,
            mac,
            trailer_len,
            held: Vec::with_capacity(trailer_len),
        })
    }

    /// Feed the next slice of the object, appending released plaintext to `out`.
    ///
    /// Plaintext is unauthenticated until [`finish`](Self::finish) succeeds.
    pub fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.held.extend_from_slice(input);
        if self.held.len() <= self.trailer_len {
            return Ok(());
        }
        let release = self.held.len() - self.trailer_len;
        let start = out.len();
        out.extend_from_slice(&self.held[..release]);
        self.held.drain(..release);

        let block = &mut out[start..];
        if let Some(mac) = self.mac.as_mut() {
            mac.update(block);
        }
        self.engine.apply_keystream(block)
    }

    /// Verify the trailer. Consumes the decryptor.
    pub fn finish(mut self) -> Result<()> {
        if self.held.len() < self.trailer_len {
            return Err(CryptoError::InvalidArgument(format!(
                "object is shorter than its {}-byte trailer",
                self.trailer_len
            )));
        }
        let mut expected = self.engine.finish()?;
        if let Some(mac) = &self.mac {
            expected.extend_from_slice(&mac.finalize());
        }
        if !bool::from(expected.as_slice().ct_eq(&self.held)) {
            return Err(CryptoError::Authentication(format!(
                "{} object trailer does not match",
                self.descriptor.id
            )));
        }
        debug!(
            cipher = self.descriptor.id,
            bytes = self.engine.position(),
            "object authenticated"
        );
        Ok(())
    }
}

/// Decrypt and verify a whole object held in memory
pub fn decrypt_object(
    registry: &CryptoRegistry,
    key: &SecretKey,
    cipher_id: &str,
    iv: &[u8],
    object: &[u8],
) -> Result<Vec<u8>> {
    let mut decryptor = ObjectDecryptor::new(registry, key, cipher_id, iv)?;
    let mut plaintext = Vec::with_capacity(object.len());
    decryptor.update(object, &mut plaintext)?;
    decryptor.finish()?;
    Ok(plaintext)
}

/// Decrypt an object delivered as separate part streams, in part order.
///
/// Plaintext is written to `out` as it is produced; discard it if this
/// returns an error. Returns the number of plaintext bytes written.
pub fn decrypt_parts<I, R, W>(
    registry: &CryptoRegistry,
    key: &SecretKey,
    cipher_id: &str,
    iv: &[u8],
    parts: I,
    mut out: W,
) -> Result<u64>
where
    I: IntoIterator<Item = R>,
    R: Read,
    W: Write,
{
    let mut decryptor = ObjectDecryptor::new(registry, key, cipher_id, iv)?;
    let mut reader = SpliceReader::new(DEFAULT_RELAY_BUFFER_SIZE)?;
    let mut chunk = vec![0u8; DEFAULT_RELAY_BUFFER_SIZE];
    let mut plaintext = Vec::with_capacity(DEFAULT_RELAY_BUFFER_SIZE);
    let mut written = 0u64;

    for part in parts {
        reader.set_next(part);
        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            plaintext.clear();
            decryptor.update(&chunk[..n], &mut plaintext)?;
            out.write_all(&plaintext)?;
            written += plaintext.len() as u64;
        }
    }
    decryptor.finish()?;
    out.flush()?;
    Ok(written)
}
