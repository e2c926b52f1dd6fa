//! Integration tests for resumable encrypted uploads
//!
//! These tests drive the crypto and client crates together end to end.

use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tessera_client::{
    ClientError, EncryptedMultipartUpload, FileSource, MemorySource, MemoryTransport,
    PartTransport, RangeSource, UploadConfig,
};
use tessera_crypto::{
    decrypt_object, ContinuableByteSource, CryptoRegistry, EncryptionPipeline, EnvelopeCodec,
    ResumableUploadState, SecretKey, SpliceWriter, StateSnapshotter, UploadMetadata,
};

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut data);
    data
}

/// Serves `data[start..]`, copies bytes and then fails once the absolute
/// offset would pass `fail_at`
struct FailingStream {
    data: Arc<Vec<u8>>,
    pos: usize,
    fail_at: Option<usize>,
}

impl Read for FailingStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (self.data.len() - self.pos).min(buf.len());
        if let Some(fail_at) = self.fail_at {
            if self.pos + n > fail_at {
                buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
                self.fail_at = None;
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"));
            }
        }
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// 10,000 bytes read through a 256-byte buffer, failing at offset 6,000
#[test_log::test]
fn test_continuable_source_scenario() {
    let data = Arc::new(random_bytes(10_000));
    let mut source = ContinuableByteSource::with_source(FailingStream {
        data: Arc::clone(&data),
        pos: 0,
        fail_at: Some(6_000),
    });

    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    let mut failures = 0;
    loop {
        match source.read_range(&mut buf, 0, 256) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) => {
                failures += 1;
                assert_eq!(e.io_error().map(|e| e.kind()), Some(io::ErrorKind::ConnectionReset));
                let offset = source.confirmed_bytes_read() as usize;
                assert_eq!(offset, 5_888);
                source
                    .continue_with(FailingStream {
                        data: Arc::clone(&data),
                        pos: offset,
                        fail_at: None,
                    })
                    .unwrap();
            }
        }
    }

    assert_eq!(failures, 1);
    assert_eq!(source.confirmed_bytes_read(), 10_000);
    assert_eq!(out, *data);
    source.close();
    source.close();
}

/// The splice writer hands every part sink back with exactly its bytes
#[test]
fn test_splice_writer_parts_concatenate() {
    let data = random_bytes(5_000);
    let mut writer = SpliceWriter::new(64).unwrap();
    writer.set_next(Vec::new()).unwrap();

    let mut parts = Vec::new();
    for (i, chunk) in data.chunks(100).enumerate() {
        io::Write::write_all(&mut writer, chunk).unwrap();
        if i % 7 == 6 {
            parts.push(writer.set_next(Vec::new()).unwrap().unwrap());
        }
    }
    parts.push(writer.detach().unwrap().unwrap());
    assert_eq!(parts.concat(), data);
}

/// Part-by-part encryption with a rewind equals one-shot encryption
#[test]
fn test_pipeline_rewind_matches_single_pass() {
    let registry = CryptoRegistry::standard();
    let key = SecretKey::generate();
    let plaintext = random_bytes(30_000);
    for cipher in ["AES128/CTR/NoPadding", "AES192/CTR/NoPadding", "AES256/CTR/NoPadding"] {
        let mut parts = EncryptionPipeline::initiate(&registry, &key, cipher).unwrap();
        let mut whole =
            EncryptionPipeline::with_iv(&registry, &key, cipher, parts.iv().to_vec()).unwrap();

        let mut ciphertext = parts.encrypt_part(1, Cursor::new(&plaintext[..12_000])).unwrap().to_vec();
        let snapshot = StateSnapshotter::record(&parts).unwrap();
        parts.encrypt_part(2, Cursor::new(random_bytes(5_000))).unwrap();
        StateSnapshotter::rewind(&mut parts, &snapshot).unwrap();
        ciphertext.extend_from_slice(&parts.encrypt_final_part(2, Cursor::new(&plaintext[12_000..])).unwrap());

        let expected = whole.encrypt_final_part(1, Cursor::new(&plaintext)).unwrap();
        assert_eq!(ciphertext, expected.to_vec(), "{}", cipher);
        assert_eq!(decrypt_object(&registry, &key, cipher, parts.iv(), &ciphertext).unwrap(), plaintext);
    }
}

/// State saved to disk in one "process" continues in another
#[test_log::test]
fn test_cross_process_resume_through_file() {
    let key_bytes = random_bytes(32);
    let plaintext = random_bytes(50_000);
    let dir = tempfile::tempdir().unwrap();
    let data_path = dir.path().join("payload.bin");
    let state_path = dir.path().join("upload.state");
    std::fs::write(&data_path, &plaintext).unwrap();

    let config = UploadConfig::default().with_part_size(16_384);
    let mut transport = MemoryTransport::new();

    // First process: two parts, then save and exit
    {
        let key = SecretKey::from_bytes(&key_bytes).unwrap();
        let mut upload = EncryptedMultipartUpload::start(
            config.clone(),
            &key,
            "/backups/payload.bin",
            &mut transport,
            FileSource::new(&data_path),
        )
        .unwrap();
        upload.upload_next_part().unwrap();
        upload.upload_next_part().unwrap();
        std::fs::write(&state_path, upload.save_state(&key).unwrap()).unwrap();
    }

    // Second process: same key material, state read back from disk
    let key = SecretKey::from_bytes(&key_bytes).unwrap();
    let envelope = std::fs::read(&state_path).unwrap();
    let iv = {
        let registry = config.registry().unwrap();
        let state = EnvelopeCodec::new(&registry)
            .decode(&envelope, &key, &config.state_cipher_id)
            .unwrap();
        assert_eq!(state.metadata.completed_parts.len(), 2);
        assert_eq!(state.snapshot.bytes_encrypted, 32_768);
        state.iv
    };

    let mut upload = EncryptedMultipartUpload::resume(
        config.clone(),
        &key,
        &envelope,
        &mut transport,
        FileSource::new(&data_path),
    )
    .unwrap();
    upload.upload_all().unwrap();
    assert_eq!(upload.progress().current_part, 4);
    drop(upload);

    let registry = config.registry().unwrap();
    let object = transport.object();
    assert_eq!(
        decrypt_object(&registry, &key, &config.cipher_id, &iv, &object).unwrap(),
        plaintext
    );
}

/// A different key cannot open saved state
#[test]
fn test_resume_with_wrong_key_fails() {
    let key = SecretKey::generate();
    let config = UploadConfig::default().with_part_size(1_000);
    let mut upload = EncryptedMultipartUpload::start(
        config.clone(),
        &key,
        "obj",
        MemoryTransport::new(),
        MemorySource::new(random_bytes(3_000)),
    )
    .unwrap();
    upload.upload_next_part().unwrap();
    let envelope = upload.save_state(&key).unwrap();

    let err = EncryptedMultipartUpload::resume(
        config,
        &SecretKey::generate(),
        &envelope,
        MemoryTransport::new(),
        MemorySource::new(random_bytes(3_000)),
    )
    .err()
    .unwrap();
    assert!(matches!(
        err,
        ClientError::Crypto(tessera_crypto::CryptoError::Authentication(_))
    ));
    assert!(err.is_fatal());
}

/// Transport that fails every `every`-th call with a resumable error
struct UnreliableTransport {
    inner: MemoryTransport,
    calls: usize,
    every: usize,
}

impl PartTransport for UnreliableTransport {
    fn upload_part(&mut self, part_number: u32, ciphertext: &[u8]) -> io::Result<String> {
        self.calls += 1;
        if self.calls % self.every == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "gateway timeout"));
        }
        self.inner.upload_part(part_number, ciphertext)
    }

    fn complete(&mut self, parts: &[tessera_client::CompletedPart]) -> io::Result<()> {
        self.inner.complete(parts)
    }
}

/// Plaintext source that drops the connection on every open after some bytes
struct DroppingSource {
    data: Arc<Vec<u8>>,
    opens: AtomicUsize,
}

impl RangeSource for DroppingSource {
    fn len(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn open_at(&self, offset: u64) -> io::Result<Box<dyn Read + Send>> {
        let n = self.opens.fetch_add(1, Ordering::SeqCst);
        let pos = offset as usize;
        // Every other open dies 3,000 bytes in
        let fail_at = (n % 2 == 0).then_some(pos + 3_000);
        Ok(Box::new(FailingStream {
            data: Arc::clone(&self.data),
            pos,
            fail_at,
        }))
    }
}

/// Flaky plaintext and flaky transport together still yield a valid object
#[test_log::test]
fn test_unreliable_source_and_transport() {
    let key = SecretKey::generate();
    let data = Arc::new(random_bytes(40_000));
    let config = UploadConfig::default()
        .with_part_size(8_000)
        .with_max_part_retries(2)
        .with_max_source_reopens(4);

    let mut upload = EncryptedMultipartUpload::start(
        config.clone(),
        &key,
        "obj",
        UnreliableTransport {
            inner: MemoryTransport::new(),
            calls: 0,
            every: 3,
        },
        DroppingSource {
            data: Arc::clone(&data),
            opens: AtomicUsize::new(0),
        },
    )
    .unwrap();
    upload.upload_all().unwrap();

    let iv = upload.pipeline().lock().unwrap().iv().to_vec();
    let transport = upload.into_transport();
    assert!(transport.calls > 5);
    let object = transport.inner.object();
    let registry = config.registry().unwrap();
    assert_eq!(decrypt_object(&registry, &key, &config.cipher_id, &iv, &object).unwrap(), *data);
}

/// Captured state round-trips through the envelope and continues identically
#[test]
fn test_envelope_roundtrip_continues_ciphertext() {
    let registry = CryptoRegistry::standard();
    let key = SecretKey::generate();
    let plaintext = random_bytes(20_000);
    let cipher = "AES256/CTR/NoPadding";

    let mut original = EncryptionPipeline::initiate(&registry, &key, cipher).unwrap();
    let first = original.encrypt_part(1, Cursor::new(&plaintext[..7_000])).unwrap();
    let state = ResumableUploadState::capture(&original, UploadMetadata::new("u-1", "/o", 7_000)).unwrap();

    let codec = EnvelopeCodec::new(&registry);
    let envelope = codec.encode(&state, &key, "AES128/GCM/NoPadding").unwrap();
    let mut restored = codec
        .decode(&envelope, &key, "AES128/GCM/NoPadding")
        .unwrap()
        .restore(&registry, &key)
        .unwrap();

    let a = original.encrypt_final_part(2, Cursor::new(&plaintext[7_000..])).unwrap();
    let b = restored.encrypt_final_part(2, Cursor::new(&plaintext[7_000..])).unwrap();
    assert_eq!(a, b);

    let mut object = first.to_vec();
    object.extend_from_slice(&b);
    assert_eq!(decrypt_object(&registry, &key, cipher, original.iv(), &object).unwrap(), plaintext);
}
