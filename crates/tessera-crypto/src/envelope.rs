//! Authenticated, encrypted envelope for persisted upload state
//!
//! ## Layout
//!
//! ```text
//! [format version: LEB128 varint]
//! [IV: iv_len bytes]
//! [ciphertext]
//! [ GCM tag (16 bytes)  |  MAC (mac_len bytes) ‖ MAC id (16 bytes, ASCII, space padded) ]
//! ```
//!
//! The ciphertext is a DAG-CBOR document with short field tags (see
//! [`WireState`]). The raw secret key is never part of it; the caller supplies
//! the same key to [`EnvelopeCodec::decode`] that it gave to
//! [`EnvelopeCodec::encode`].

use crate::{
    engine::{Direction, EngineKind, EngineState, MacState, ResumableHmac},
    keys::{random_iv, SecretKey},
    pipeline::EncryptionPipeline,
    registry::{parse_mac_id_field, CipherDescriptor, CryptoRegistry, MAC_ID_WIDTH},
    snapshot::{EncryptionStateSnapshot, StateSnapshotter},
    CryptoError, Result,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Version written in front of every envelope
pub const ENVELOPE_FORMAT_VERSION: u64 = 1;

/// Version of the [`WireState`] schema inside the ciphertext
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// A part the storage service has acknowledged
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Upload bookkeeping persisted alongside the cipher state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadMetadata {
    /// Service-assigned multipart upload id
    pub upload_id: String,
    /// Destination object path
    pub object_path: String,
    /// Plaintext bytes per part
    pub part_size: u64,
    /// Content type of the final object
    pub content_type: Option<String>,
    /// Parts already acknowledged by the service
    pub completed_parts: Vec<CompletedPart>,
}

impl UploadMetadata {
    /// Metadata for an upload with no completed parts
    pub fn new(upload_id: impl Into<String>, object_path: impl Into<String>, part_size: u64) -> Self {
        Self {
            upload_id: upload_id.into(),
            object_path: object_path.into(),
            part_size,
            content_type: None,
            completed_parts: Vec::new(),
        }
    }

    /// Set the content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Everything needed to continue an upload, minus the secret key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumableUploadState {
    /// Schema version the state was read with
    pub schema_version: u32,
    /// Upload bookkeeping
    pub metadata: UploadMetadata,
    /// Cipher the upload is encrypted with
    pub cipher_id: String,
    /// IV of the upload's cipher stream
    pub iv: Vec<u8>,
    /// Cipher and MAC position
    pub snapshot: EncryptionStateSnapshot,
}

impl ResumableUploadState {
    /// Capture the pipeline's state together with the upload metadata
    pub fn capture(pipeline: &EncryptionPipeline, metadata: UploadMetadata) -> Result<Self> {
        Ok(Self {
            schema_version: STATE_SCHEMA_VERSION,
            metadata,
            cipher_id: pipeline.descriptor().id.to_string(),
            iv: pipeline.iv().to_vec(),
            snapshot: StateSnapshotter::record(pipeline)?,
        })
    }

    /// Rebuild a live pipeline positioned where the state was captured
    pub fn restore(&self, registry: &CryptoRegistry, key: &SecretKey) -> Result<EncryptionPipeline> {
        let mut pipeline =
            EncryptionPipeline::with_iv(registry, key, &self.cipher_id, self.iv.clone())?;
        StateSnapshotter::rewind(&mut pipeline, &self.snapshot)?;
        Ok(pipeline)
    }
}

/// Persisted schema. Field tags are part of the format; never reuse one.
#[derive(Serialize, Deserialize)]
struct WireState {
    #[serde(rename = "v")]
    version: u32,
    #[serde(rename = "u")]
    upload_id: String,
    #[serde(rename = "p")]
    object_path: String,
    #[serde(rename = "ps")]
    part_size: u64,
    #[serde(rename = "ct", default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    #[serde(rename = "cp", default)]
    completed_parts: Vec<WirePart>,
    #[serde(rename = "c")]
    cipher_id: String,
    #[serde(rename = "iv", with = "serde_bytes")]
    iv: Vec<u8>,
    #[serde(rename = "ek")]
    engine: String,
    #[serde(rename = "es", with = "serde_bytes")]
    engine_state: Vec<u8>,
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    mac: Option<WireMac>,
    #[serde(rename = "n")]
    last_part_number: u32,
    #[serde(rename = "b")]
    bytes_encrypted: u64,
    #[serde(rename = "f", default, skip_serializing_if = "is_false")]
    completed: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Serialize, Deserialize)]
struct WirePart {
    #[serde(rename = "n")]
    part_number: u32,
    #[serde(rename = "e")]
    etag: String,
}

#[derive(Serialize, Deserialize)]
struct WireMac {
    #[serde(rename = "a")]
    algorithm: String,
    #[serde(rename = "i", with = "serde_bytes")]
    inner: Vec<u8>,
    #[serde(rename = "o", with = "serde_bytes")]
    outer: Vec<u8>,
}

impl WireState {
    fn from_state(state: &ResumableUploadState) -> Self {
        Self {
            version: STATE_SCHEMA_VERSION,
            upload_id: state.metadata.upload_id.clone(),
            object_path: state.metadata.object_path.clone(),
            part_size: state.metadata.part_size,
            content_type: state.metadata.content_type.clone(),
            completed_parts: state
                .metadata
                .completed_parts
                .iter()
                .map(|p| WirePart {
                    part_number: p.part_number,
                    etag: p.etag.clone(),
                })
                .collect(),
            cipher_id: state.cipher_id.clone(),
            iv: state.iv.clone(),
            engine: state.snapshot.engine.kind.as_str().to_string(),
            engine_state: state.snapshot.engine.encoded.clone(),
            mac: state.snapshot.mac.as_ref().map(|m| WireMac {
                algorithm: m.algorithm.id().to_string(),
                inner: m.inner.clone(),
                outer: m.outer.clone(),
            }),
            last_part_number: state.snapshot.last_part_number,
            bytes_encrypted: state.snapshot.bytes_encrypted,
            completed: state.snapshot.completed,
        }
    }

    fn into_state(self, registry: &CryptoRegistry) -> Result<ResumableUploadState> {
        let mac = match &self.mac {
            Some(m) => Some(MacState {
                algorithm: registry.mac(&m.algorithm)?,
                inner: m.inner.clone(),
                outer: m.outer.clone(),
            }),
            None => None,
        };
        Ok(ResumableUploadState {
            schema_version: self.version,
            metadata: UploadMetadata {
                upload_id: self.upload_id,
                object_path: self.object_path,
                part_size: self.part_size,
                content_type: self.content_type,
                completed_parts: self
                    .completed_parts
                    .into_iter()
                    .map(|p| CompletedPart {
                        part_number: p.part_number,
                        etag: p.etag,
                    })
                    .collect(),
            },
            cipher_id: self.cipher_id,
            iv: self.iv,
            snapshot: EncryptionStateSnapshot {
                engine: EngineState {
                    kind: EngineKind::parse(&self.engine)?,
                    encoded: self.engine_state,
                },
                mac,
                last_part_number: self.last_part_number,
                bytes_encrypted: self.bytes_encrypted,
                completed: self.completed,
            },
        })
    }
}

fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Returns the value and the number of bytes consumed
fn read_varint(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in bytes.iter().enumerate().take(10) {
        let bits = u64::from(byte & 0x7f);
        if i == 9 && bits > 1 {
            break;
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(CryptoError::InvalidEnvelope(
        "truncated or oversized version varint".to_string(),
    ))
}

/// Encrypts and authenticates [`ResumableUploadState`]
#[derive(Clone, Copy, Debug)]
pub struct EnvelopeCodec<'a> {
    registry: &'a CryptoRegistry,
}

impl<'a> EnvelopeCodec<'a> {
    /// Create a codec backed by `registry`
    pub fn new(registry: &'a CryptoRegistry) -> Self {
        Self { registry }
    }

    /// Serialize and seal `state` under `key` with the cipher `cipher_id`
    pub fn encode(&self, state: &ResumableUploadState, key: &SecretKey, cipher_id: &str) -> Result<Vec<u8>> {
        let descriptor = self.registry.cipher(cipher_id)?;
        let keys = key.derive(descriptor)?;

        let mut payload = Zeroizing::new(
            serde_ipld_dagcbor::to_vec(&WireState::from_state(state))
                .map_err(|e| CryptoError::Serialization(e.to_string()))?,
        );

        let iv = random_iv(descriptor.iv_len);
        let mut engine = descriptor
            .engine
            .create(keys.cipher_key(), &iv, Direction::Encrypt)?;
        engine.apply_keystream(&mut payload)?;

        let mut envelope = Vec::with_capacity(10 + iv.len() + payload.len() + 96);
        write_varint(ENVELOPE_FORMAT_VERSION, &mut envelope);
        envelope.extend_from_slice(&iv);
        envelope.extend_from_slice(&payload);

        if descriptor.is_aead() {
            envelope.extend_from_slice(&engine.finish()?);
        } else {
            let algorithm = self.registry.default_mac();
            let mut mac = ResumableHmac::new(algorithm, keys.mac_key());
            mac.update(&iv);
            mac.update(&payload);
            envelope.extend_from_slice(&mac.finalize());
            envelope.extend_from_slice(&algorithm.id_field());
        }

        debug!(
            cipher = cipher_id,
            upload_id = %state.metadata.upload_id,
            len = envelope.len(),
            "encoded upload state envelope"
        );
        Ok(envelope)
    }

    /// Verify, decrypt and parse an envelope produced by [`encode`](Self::encode)
    pub fn decode(&self, envelope: &[u8], key: &SecretKey, cipher_id: &str) -> Result<ResumableUploadState> {
        let descriptor = self.registry.cipher(cipher_id)?;
        let keys = key.derive(descriptor)?;

        let (version, consumed) = read_varint(envelope)?;
        if version != ENVELOPE_FORMAT_VERSION {
            warn!(
                found = version,
                expected = ENVELOPE_FORMAT_VERSION,
                "envelope format version mismatch; decoding anyway"
            );
        }
        let body = &envelope[consumed..];
        if body.len() < descriptor.iv_len {
            return Err(CryptoError::InvalidEnvelope("envelope shorter than its IV".to_string()));
        }
        let (iv, rest) = body.split_at(descriptor.iv_len);

        let payload = if descriptor.is_aead() {
            open_aead(descriptor, keys.cipher_key(), iv, rest)?
        } else {
            let ciphertext = self.verify_mac(keys.mac_key(), iv, rest)?;
            let mut payload = Zeroizing::new(ciphertext.to_vec());
            descriptor
                .engine
                .create(keys.cipher_key(), iv, Direction::Decrypt)?
                .apply_keystream(&mut payload)?;
            payload
        };

        let wire: WireState = serde_ipld_dagcbor::from_slice(&payload)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;
        if wire.version != STATE_SCHEMA_VERSION {
            warn!(
                found = wire.version,
                expected = STATE_SCHEMA_VERSION,
                "upload state schema version mismatch; decoding best-effort"
            );
        }
        wire.into_state(self.registry)
    }

    /// Check the trailing MAC and return the ciphertext it covers
    fn verify_mac<'e>(&self, mac_key: &[u8], iv: &[u8], rest: &'e [u8]) -> Result<&'e [u8]> {
        if rest.len() < MAC_ID_WIDTH {
            return Err(CryptoError::InvalidEnvelope("missing MAC identifier".to_string()));
        }
        let (authenticated, id_field) = rest.split_at(rest.len() - MAC_ID_WIDTH);
        let algorithm = parse_mac_id_field(id_field)
            .and_then(|id| self.registry.mac(id))
            .map_err(|e| CryptoError::InvalidEnvelope(e.to_string()))?;

        let mac_len = algorithm.output_len();
        if authenticated.len() < mac_len {
            return Err(CryptoError::InvalidEnvelope("envelope shorter than its MAC".to_string()));
        }
        let (ciphertext, expected) = authenticated.split_at(authenticated.len() - mac_len);

        let mut mac = ResumableHmac::new(algorithm, mac_key);
        mac.update(iv);
        mac.update(ciphertext);
        if !mac.verify(expected) {
            return Err(CryptoError::Authentication(format!(
                "{} over envelope does not match",
                algorithm.id()
            )));
        }
        Ok(ciphertext)
    }
}

fn open_aead(
    descriptor: &CipherDescriptor,
    key: &[u8],
    iv: &[u8],
    sealed: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < descriptor.tag_len {
        return Err(CryptoError::InvalidEnvelope("envelope shorter than its tag".to_string()));
    }
    let (ciphertext, tag) = sealed.split_at(sealed.len() - descriptor.tag_len);
    let mut engine = descriptor.engine.create(key, iv, Direction::Decrypt)?;
    let mut payload = Zeroizing::new(ciphertext.to_vec());
    engine.apply_keystream(&mut payload)?;
    let computed = engine.finish()?;
    if !bool::from(computed.as_slice().ct_eq(tag)) {
        return Err(CryptoError::Authentication(format!(
            "{} tag over envelope does not match",
            descriptor.id
        )));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::UploadPhase;
    use proptest::prelude::*;
    use std::io::Cursor;

    const CTR: &str = "AES256/CTR/NoPadding";
    const GCM: &str = "AES128/GCM/NoPadding";

    fn metadata() -> UploadMetadata {
        let mut metadata = UploadMetadata::new("upload-123", "/bucket/videos/big.mp4", 5 * 1024 * 1024)
            .with_content_type("video/mp4");
        metadata.completed_parts.push(CompletedPart {
            part_number: 1,
            etag: "\"abc\"".to_string(),
        });
        metadata
    }

    fn captured(registry: &CryptoRegistry, key: &SecretKey) -> (EncryptionPipeline, ResumableUploadState) {
        let mut pipeline = EncryptionPipeline::initiate(registry, key, "AES128/CTR/NoPadding").unwrap();
        pipeline.encrypt_part(1, Cursor::new(vec![9u8; 1_000])).unwrap();
        let state = ResumableUploadState::capture(&pipeline, metadata()).unwrap();
        (pipeline, state)
    }

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(value, &mut buf);
            assert_eq!(read_varint(&buf).unwrap(), (value, buf.len()));
        }
        assert!(read_varint(&[0x80, 0x80]).is_err());
        assert!(read_varint(&[]).is_err());
    }

    #[test]
    fn test_roundtrip_continues_same_ciphertext() {
        let registry = CryptoRegistry::standard();
        let key = SecretKey::generate();
        let (mut original, state) = captured(&registry, &key);

        for envelope_cipher in [CTR, GCM] {
            let codec = EnvelopeCodec::new(&registry);
            let envelope = codec.encode(&state, &key, envelope_cipher).unwrap();
            let decoded = codec.decode(&envelope, &key, envelope_cipher).unwrap();
            assert_eq!(decoded, state);

            let mut restored = decoded.restore(&registry, &key).unwrap();
            assert_eq!(restored.last_part_number(), 1);
            let a = restored.encrypt_final_part(2, Cursor::new(vec![3u8; 500])).unwrap();
            let b = {
                let snapshot = StateSnapshotter::record(&original).unwrap();
                let out = original.encrypt_final_part(2, Cursor::new(vec![3u8; 500])).unwrap();
                StateSnapshotter::rewind(&mut original, &snapshot).unwrap();
                out
            };
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_completed_upload_restores_as_completed() {
        let registry = CryptoRegistry::standard();
        let key = SecretKey::generate();
        let (mut pipeline, _) = captured(&registry, &key);
        pipeline.encrypt_final_part(2, Cursor::new(vec![4u8; 10])).unwrap();
        let state = ResumableUploadState::capture(&pipeline, metadata()).unwrap();
        assert!(state.snapshot.completed);

        let codec = EnvelopeCodec::new(&registry);
        let envelope = codec.encode(&state, &key, GCM).unwrap();
        let decoded = codec.decode(&envelope, &key, GCM).unwrap();
        assert!(decoded.snapshot.completed);

        let restored = decoded.restore(&registry, &key).unwrap();
        assert_eq!(restored.phase(), UploadPhase::Completed);
        assert_eq!(restored.bytes_encrypted(), 1_010);
    }

    #[test]
    fn test_envelope_layout() {
        let registry = CryptoRegistry::standard();
        let key = SecretKey::generate();
        let (_, state) = captured(&registry, &key);
        let envelope = EnvelopeCodec::new(&registry).encode(&state, &key, CTR).unwrap();

        assert_eq!(envelope[0], ENVELOPE_FORMAT_VERSION as u8);
        let id = &envelope[envelope.len() - MAC_ID_WIDTH..];
        assert_eq!(parse_mac_id_field(id).unwrap(), "HmacSHA256");
    }

    #[test]
    fn test_fresh_iv_per_encode() {
        let registry = CryptoRegistry::standard();
        let key = SecretKey::generate();
        let (_, state) = captured(&registry, &key);
        let codec = EnvelopeCodec::new(&registry);
        let a = codec.encode(&state, &key, CTR).unwrap();
        let b = codec.encode(&state, &key, CTR).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let registry = CryptoRegistry::standard();
        let key = SecretKey::generate();
        let (_, state) = captured(&registry, &key);
        let codec = EnvelopeCodec::new(&registry);
        for cipher in [CTR, GCM] {
            let envelope = codec.encode(&state, &key, cipher).unwrap();
            let err = codec.decode(&envelope, &SecretKey::generate(), cipher).unwrap_err();
            assert!(matches!(err, CryptoError::Authentication(_)), "{}: {:?}", cipher, err);
        }
    }

    #[test]
    fn test_truncated_envelope_is_invalid() {
        let registry = CryptoRegistry::standard();
        let key = SecretKey::generate();
        let codec = EnvelopeCodec::new(&registry);
        assert!(matches!(
            codec.decode(&[1, 2, 3], &key, CTR),
            Err(CryptoError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            codec.decode(&[1u8; 20], &key, GCM),
            Err(CryptoError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_unknown_mac_id_is_invalid() {
        let registry = CryptoRegistry::standard();
        let key = SecretKey::generate();
        let (_, state) = captured(&registry, &key);
        let codec = EnvelopeCodec::new(&registry);
        let mut envelope = codec.encode(&state, &key, CTR).unwrap();
        let len = envelope.len();
        envelope[len - MAC_ID_WIDTH..].copy_from_slice(b"HmacMD5         ");
        assert!(matches!(
            codec.decode(&envelope, &key, CTR),
            Err(CryptoError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_sha512_envelope_mac() {
        let registry = CryptoRegistry::with_default_mac(crate::registry::MacAlgorithm::HmacSha512);
        let key = SecretKey::generate();
        let (_, state) = captured(&registry, &key);
        let codec = EnvelopeCodec::new(&registry);
        let envelope = codec.encode(&state, &key, CTR).unwrap();
        let id = &envelope[envelope.len() - MAC_ID_WIDTH..];
        assert_eq!(parse_mac_id_field(id).unwrap(), "HmacSHA512");
        assert_eq!(codec.decode(&envelope, &key, CTR).unwrap(), state);
    }

    #[test_log::test]
    fn test_version_mismatch_is_not_fatal() {
        let registry = CryptoRegistry::standard();
        let key = SecretKey::generate();
        let (_, state) = captured(&registry, &key);
        let codec = EnvelopeCodec::new(&registry);

        // A GCM envelope does not authenticate the version prefix
        let mut envelope = codec.encode(&state, &key, GCM).unwrap();
        envelope[0] = 2;
        let decoded = codec.decode(&envelope, &key, GCM).unwrap();
        assert_eq!(decoded.metadata, state.metadata);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_single_byte_flip_is_rejected(position in any::<prop::sample::Index>(), flip in 1u8..=255) {
            let registry = CryptoRegistry::standard();
            let key = SecretKey::from_bytes(&[0x5c; 32]).unwrap();
            let (_, state) = captured(&registry, &key);
            let codec = EnvelopeCodec::new(&registry);
            let mut envelope = codec.encode(&state, &key, CTR).unwrap();

            // Everything between the version prefix and the MAC id field
            let start = 1;
            let end = envelope.len() - MAC_ID_WIDTH;
            let at = start + position.index(end - start);
            envelope[at] ^= flip;

            let result = codec.decode(&envelope, &key, CTR);
            prop_assert!(matches!(result, Err(CryptoError::Authentication(_))));
        }
    }
}
