//! Encryption pipeline for one multipart upload
//!
//! A single cipher engine (and, for non-AEAD ciphers, a single HMAC) runs
//! across every part of the upload, so the uploaded parts concatenate into one
//! continuous ciphertext followed by an authentication trailer:
//!
//! ```text
//! part 1 | part 2 | ... | part N ‖ trailer
//! ```
//!
//! The trailer is the HMAC over `IV ‖ ciphertext` for CTR ciphers, or the GCM
//! tag for AEAD ciphers. Part numbers must advance by exactly one; a part that
//! fails leaves the pipeline in [`UploadPhase::Failed`] until it is rewound
//! with [`StateSnapshotter::rewind`](crate::snapshot::StateSnapshotter::rewind).

use crate::{
    engine::{CipherEngine, Direction, ResumableHmac},
    keys::{random_iv, DerivedKeys, SecretKey},
    registry::{CipherDescriptor, CryptoRegistry},
    stream::{SpliceWriter, DEFAULT_RELAY_BUFFER_SIZE},
    CryptoError, Result,
};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Plaintext is pulled from the source in chunks of this size
const PUMP_CHUNK_SIZE: usize = 16 * 1024;

/// Lifecycle of an upload's encryption state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadPhase {
    /// Initiated, no part encrypted yet
    Created,
    /// The given part was the last one encrypted successfully
    Encrypting { part_number: u32 },
    /// Encrypting the given part failed; rewind before retrying
    Failed { part_number: u32 },
    /// Final part encrypted and trailer emitted
    Completed,
    /// Upload abandoned
    Aborted,
}

/// Live cipher and MAC state for one upload
pub struct EncryptionPipeline {
    descriptor: CipherDescriptor,
    keys: DerivedKeys,
    iv: Vec<u8>,
    pub(crate) engine: Box<dyn CipherEngine>,
    pub(crate) mac: Option<ResumableHmac>,
    relay: SpliceWriter<Vec<u8>>,
    pub(crate) last_part_number: u32,
    pub(crate) phase: UploadPhase,
    pub(crate) bytes_encrypted: u64,
}

impl EncryptionPipeline {
    /// Start encrypting a new upload with a fresh random IV
    pub fn initiate(registry: &CryptoRegistry, key: &SecretKey, cipher_id: &str) -> Result<Self> {
        let descriptor = registry.cipher(cipher_id)?;
        let iv = random_iv(descriptor.iv_len);
        let pipeline = Self::with_iv(registry, key, cipher_id, iv)?;
        info!(cipher = cipher_id, "initiated encrypted upload");
        Ok(pipeline)
    }

    /// Start encrypting a new upload with a caller-chosen IV.
    ///
    /// Reusing an IV with the same key reuses the keystream; only restore
    /// paths and tests should call this directly.
    pub fn with_iv(
        registry: &CryptoRegistry,
        key: &SecretKey,
        cipher_id: &str,
        iv: Vec<u8>,
    ) -> Result<Self> {
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
            .create(keys.cipher_key(), &iv, Direction::Encrypt)?;
        let mac = authenticator(registry, &descriptor, &keys, &iv);

        let relay = SpliceWriter::new(DEFAULT_RELAY_BUFFER_SIZE)?;

        Ok(Self {
            descriptor,
            keys,
            iv,
            engine,
            mac,
            relay,
            last_part_number: 0,
            phase: UploadPhase::Created,
            bytes_encrypted: 0,
        })
    }

    /// Use a relay buffer of `size` bytes between the cipher and part sinks
    pub fn with_relay_buffer_size(mut self, size: usize) -> Result<Self> {
        self.relay = SpliceWriter::new(size)?;
        Ok(self)
    }

    /// Encrypt the next part. `part_number` must be `last_part_number + 1`.
    pub fn encrypt_part<R: Read>(&mut self, part_number: u32, plaintext: R) -> Result<Bytes> {
        self.run_part(part_number, plaintext, false)
    }

    /// Encrypt the last part and append the authentication trailer
    pub fn encrypt_final_part<R: Read>(&mut self, part_number: u32, plaintext: R) -> Result<Bytes> {
        self.run_part(part_number, plaintext, true)
    }

    /// Abandon the upload
    pub fn abort(&mut self) {
        if self.phase != UploadPhase::Aborted {
            info!(last_part = self.last_part_number, "aborting encrypted upload");
        }
        self.relay.discard();
        self.phase = UploadPhase::Aborted;
    }

    /// Mark `part_number` as lost after it was encrypted but never stored.
    ///
    /// The pipeline refuses further parts until it is rewound to a snapshot
    /// taken before that part.
    pub fn mark_failed(&mut self, part_number: u32) {
        if self.phase == UploadPhase::Aborted {
            return;
        }
        self.relay.discard();
        self.phase = UploadPhase::Failed { part_number };
        warn!(part_number, "part marked as failed");
    }

    fn run_part<R: Read>(&mut self, part_number: u32, plaintext: R, last: bool) -> Result<Bytes> {
        self.check_next_part(part_number)?;

        // The previous part always detaches its sink, so nothing comes back here
        self.relay.set_next(Vec::new())?;

        let result = self.pump(part_number, plaintext).and_then(|()| {
            if last {
                self.write_trailer()
            } else {
                Ok(())
            }
        });

        if let Err(e) = result {
            self.relay.discard();
            self.phase = UploadPhase::Failed { part_number };
            warn!(part_number, offset = self.bytes_encrypted, error = %e, "part encryption failed");
            return Err(e);
        }

        let ciphertext = self.relay.detach()?.unwrap_or_default();
        self.last_part_number = part_number;
        self.phase = if last {
            UploadPhase::Completed
        } else {
            UploadPhase::Encrypting { part_number }
        };
        debug!(
            part_number,
            ciphertext_len = ciphertext.len(),
            total = self.bytes_encrypted,
            "encrypted part"
        );
        Ok(Bytes::from(ciphertext))
    }

    fn check_next_part(&self, part_number: u32) -> Result<()> {
        match self.phase {
            UploadPhase::Failed { part_number: failed } => {
                return Err(CryptoError::IllegalState(format!(
                    "part {} failed; rewind to a snapshot before retrying",
                    failed
                )));
            }
            UploadPhase::Completed => {
                return Err(CryptoError::IllegalState(
                    "upload already completed".to_string(),
                ));
            }
            UploadPhase::Aborted => {
                return Err(CryptoError::IllegalState("upload was aborted".to_string()));
            }
            UploadPhase::Created | UploadPhase::Encrypting { .. } => {}
        }

        let expected = self.last_part_number.checked_add(1).ok_or_else(|| {
            CryptoError::InvalidArgument("part number space exhausted".to_string())
        })?;
        if part_number != expected {
            return Err(CryptoError::PartOutOfOrder {
                expected,
                actual: part_number,
            });
        }
        Ok(())
    }

    fn pump<R: Read>(&mut self, part_number: u32, mut plaintext: R) -> Result<()> {
        let mut chunk = vec![0u8; PUMP_CHUNK_SIZE];
        loop {
            let n = plaintext
                .read(&mut chunk)
                .map_err(|source| CryptoError::PlaintextRead {
                    part_number,
                    offset: self.bytes_encrypted,
                    source,
                })?;
            if n == 0 {
                return Ok(());
            }
            let block = &mut chunk[..n];
            self.engine.apply_keystream(block)?;
            if let Some(mac) = self.mac.as_mut() {
                mac.update(block);
            }
            self.relay.write_all(block)?;
            self.bytes_encrypted += n as u64;
        }
    }

    fn write_trailer(&mut self) -> Result<()> {
        let mut trailer = self.engine.finish()?;
        if let Some(mac) = &self.mac {
            trailer.extend_from_slice(&mac.finalize());
        }
        self.relay.write_all(&trailer)?;
        Ok(())
    }

    /// Cipher in use
    pub fn descriptor(&self) -> &CipherDescriptor {
        &self.descriptor
    }

    /// Initialization vector; store it with the object so it can be decrypted
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Last part encrypted successfully (0 before the first part)
    pub fn last_part_number(&self) -> u32 {
        self.last_part_number
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> UploadPhase {
        self.phase
    }

    /// Plaintext bytes encrypted so far
    pub fn bytes_encrypted(&self) -> u64 {
        self.bytes_encrypted
    }

    /// Length of the trailer appended to the final part
    pub fn trailer_len(&self) -> usize {
        self.descriptor.tag_len + self.mac.as_ref().map_or(0, |m| m.algorithm().output_len())
    }

    pub(crate) fn cipher_key(&self) -> &[u8] {
        self.keys.cipher_key()
    }
}

impl fmt::Debug for EncryptionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionPipeline")
            .field("cipher", &self.descriptor.id)
            .field("iv", &hex::encode(&self.iv))
            .field("last_part_number", &self.last_part_number)
            .field("phase", &self.phase)
            .field("bytes_encrypted", &self.bytes_encrypted)
            .finish_non_exhaustive()
    }
}

/// HMAC for non-AEAD ciphers, already bound to the IV
pub(crate) fn authenticator(
    registry: &CryptoRegistry,
    descriptor: &CipherDescriptor,
    keys: &DerivedKeys,
    iv: &[u8],
) -> Option<ResumableHmac> {
    if descriptor.is_aead() {
        return None;
    }
    let mut mac = ResumableHmac::new(registry.default_mac(), keys.mac_key());
    mac.update(iv);
    Some(mac)
}

/// A pipeline behind the upload-scoped lock.
///
/// Cipher state cannot be shared between concurrent part encryptions, so a
/// second caller gets [`CryptoError::ConcurrentAccess`] instead of waiting.
#[derive(Clone)]
pub struct SharedPipeline {
    inner: Arc<Mutex<EncryptionPipeline>>,
}

impl SharedPipeline {
    /// Put `pipeline` behind the lock
    pub fn new(pipeline: EncryptionPipeline) -> Self {
        Self {
            inner: Arc::new(Mutex::new(pipeline)),
        }
    }

    /// Take exclusive access, failing if another caller holds it
    pub fn lock(&self) -> Result<MutexGuard<'_, EncryptionPipeline>> {
        self.inner.try_lock().ok_or(CryptoError::ConcurrentAccess)
    }

    /// Recover the pipeline once no other handle remains
    pub fn into_inner(self) -> Result<EncryptionPipeline> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|_| CryptoError::IllegalState("pipeline is still shared".to_string()))
    }
}

impl fmt::Debug for SharedPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPipeline").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    const CTR: &str = "AES128/CTR/NoPadding";

    fn pipeline(cipher: &str) -> EncryptionPipeline {
        let registry = CryptoRegistry::standard();
        let key = SecretKey::from_bytes(&[0x11; 32]).unwrap();
        EncryptionPipeline::initiate(&registry, &key, cipher).unwrap()
    }

    struct BrokenReader;

    impl Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "gone"))
        }
    }

    #[test]
    fn test_unsupported_cipher() {
        let registry = CryptoRegistry::standard();
        let key = SecretKey::generate();
        let err = EncryptionPipeline::initiate(&registry, &key, "AES/CBC/PKCS5Padding").unwrap_err();
        assert!(matches!(err, CryptoError::Config(_)));
    }

    #[test]
    fn test_fresh_iv_per_upload() {
        let a = pipeline(CTR);
        let b = pipeline(CTR);
        assert_eq!(a.iv().len(), 16);
        assert_ne!(a.iv(), b.iv());
        assert_eq!(a.phase(), UploadPhase::Created);
        assert_eq!(a.last_part_number(), 0);
    }

    #[test]
    fn test_parts_must_be_sequential() {
        let mut p = pipeline(CTR);
        let err = p.encrypt_part(2, Cursor::new(vec![0u8; 4])).unwrap_err();
        assert!(matches!(err, CryptoError::PartOutOfOrder { expected: 1, actual: 2 }));

        p.encrypt_part(1, Cursor::new(vec![0u8; 4])).unwrap();
        let err = p.encrypt_part(1, Cursor::new(vec![0u8; 4])).unwrap_err();
        assert!(matches!(err, CryptoError::PartOutOfOrder { expected: 2, actual: 1 }));
        assert_eq!(p.phase(), UploadPhase::Encrypting { part_number: 1 });
    }

    #[test]
    fn test_parts_form_one_keystream() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        let mut split = pipeline(CTR);
        let iv = split.iv().to_vec();
        let mut whole = EncryptionPipeline::with_iv(
            &CryptoRegistry::standard(),
            &SecretKey::from_bytes(&[0x11; 32]).unwrap(),
            CTR,
            iv,
        )
        .unwrap();

        let mut joined = Vec::new();
        joined.extend_from_slice(&split.encrypt_part(1, Cursor::new(&data[..1234])).unwrap());
        joined.extend_from_slice(&split.encrypt_part(2, Cursor::new(&data[1234..4000])).unwrap());
        joined.extend_from_slice(&split.encrypt_final_part(3, Cursor::new(&data[4000..])).unwrap());

        let single = whole.encrypt_final_part(1, Cursor::new(&data)).unwrap();
        assert_eq!(joined, single.to_vec());
        assert_eq!(joined.len(), data.len() + split.trailer_len());
        assert_eq!(split.phase(), UploadPhase::Completed);
    }

    #[test]
    fn test_gcm_trailer_is_tag() {
        let mut p = pipeline("AES256/GCM/NoPadding");
        let out = p.encrypt_final_part(1, Cursor::new(b"abc".to_vec())).unwrap();
        assert_eq!(p.trailer_len(), 16);
        assert_eq!(out.len(), 3 + 16);
    }

    #[test]
    fn test_read_failure_marks_failed() {
        let mut p = pipeline(CTR);
        let err = p.encrypt_part(1, BrokenReader).unwrap_err();
        assert!(matches!(err, CryptoError::PlaintextRead { part_number: 1, offset: 0, .. }));
        assert_eq!(p.phase(), UploadPhase::Failed { part_number: 1 });
        assert!(matches!(
            p.encrypt_part(1, Cursor::new(vec![1u8])),
            Err(CryptoError::IllegalState(_))
        ));
    }

    #[test]
    fn test_completed_and_aborted_reject_parts() {
        let mut p = pipeline(CTR);
        p.encrypt_final_part(1, Cursor::new(vec![1u8; 3])).unwrap();
        assert!(matches!(
            p.encrypt_part(2, Cursor::new(vec![1u8])),
            Err(CryptoError::IllegalState(_))
        ));

        let mut p = pipeline(CTR);
        p.abort();
        assert_eq!(p.phase(), UploadPhase::Aborted);
        assert!(p.encrypt_part(1, Cursor::new(vec![1u8])).is_err());
    }

    #[test]
    fn test_shared_pipeline_rejects_concurrent_access() {
        let shared = SharedPipeline::new(pipeline(CTR));
        let other = shared.clone();
        let guard = shared.lock().unwrap();
        assert!(matches!(other.lock(), Err(CryptoError::ConcurrentAccess)));
        drop(guard);
        other
            .lock()
            .unwrap()
            .encrypt_part(1, Cursor::new(vec![0u8; 8]))
            .unwrap();
        drop(other);
        assert_eq!(shared.into_inner().unwrap().last_part_number(), 1);
    }

    #[test]
    fn test_small_relay_buffer() {
        let data = vec![7u8; 1000];
        let mut small = pipeline(CTR).with_relay_buffer_size(3).unwrap();
        let out = small.encrypt_part(1, Cursor::new(&data)).unwrap();
        assert_eq!(out.len(), 1000);
        assert!(pipeline(CTR).with_relay_buffer_size(0).is_err());
    }
}
