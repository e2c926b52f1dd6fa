//! Registry of the supported cipher and MAC algorithms
//!
//! The set is closed: three AES-CTR variants authenticated with an HMAC, and
//! two AES-GCM variants that carry their own tag. A [`CryptoRegistry`] is
//! built once and passed by reference to everything that needs a lookup.

use crate::{engine::EngineKind, CryptoError, Result};
use std::collections::HashMap;

/// Width of the MAC identifier field in an envelope trailer
pub const MAC_ID_WIDTH: usize = 16;

/// Supported cipher families
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CipherFamily {
    /// AES in counter mode, authenticated by a separate HMAC
    AesCtr,
    /// AES-GCM, authenticated by its own tag
    AesGcm,
}

/// Static description of a cipher/mode pair
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CipherDescriptor {
    /// Stable identifier, e.g. `AES256/CTR/NoPadding`
    pub id: &'static str,
    /// Cipher family
    pub family: CipherFamily,
    /// Engine implementation backing this cipher
    pub engine: EngineKind,
    /// Cipher key length in bytes
    pub key_len: usize,
    /// Block size in bytes
    pub block_size: usize,
    /// IV length in bytes
    pub iv_len: usize,
    /// Authentication tag length for AEAD modes, 0 otherwise
    pub tag_len: usize,
}

impl CipherDescriptor {
    /// Whether the mode authenticates itself
    pub fn is_aead(&self) -> bool {
        self.tag_len > 0
    }
}

const AES128_CTR: CipherDescriptor = CipherDescriptor {
    id: "AES128/CTR/NoPadding",
    family: CipherFamily::AesCtr,
    engine: EngineKind::AesCtr128,
    key_len: 16,
    block_size: 16,
    iv_len: 16,
    tag_len: 0,
};

const AES192_CTR: CipherDescriptor = CipherDescriptor {
    id: "AES192/CTR/NoPadding",
    family: CipherFamily::AesCtr,
    engine: EngineKind::AesCtr192,
    key_len: 24,
    block_size: 16,
    iv_len: 16,
    tag_len: 0,
};

const AES256_CTR: CipherDescriptor = CipherDescriptor {
    id: "AES256/CTR/NoPadding",
    family: CipherFamily::AesCtr,
    engine: EngineKind::AesCtr256,
    key_len: 32,
    block_size: 16,
    iv_len: 16,
    tag_len: 0,
};

const AES128_GCM: CipherDescriptor = CipherDescriptor {
    id: "AES128/GCM/NoPadding",
    family: CipherFamily::AesGcm,
    engine: EngineKind::AesGcm128,
    key_len: 16,
    block_size: 16,
    iv_len: 12,
    tag_len: 16,
};

const AES256_GCM: CipherDescriptor = CipherDescriptor {
    id: "AES256/GCM/NoPadding",
    family: CipherFamily::AesGcm,
    engine: EngineKind::AesGcm256,
    key_len: 32,
    block_size: 16,
    iv_len: 12,
    tag_len: 16,
};

/// Supported MAC algorithms
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MacAlgorithm {
    /// HMAC with SHA-256
    HmacSha256,
    /// HMAC with SHA-512
    HmacSha512,
}

impl MacAlgorithm {
    /// Wire identifier (ASCII, at most [`MAC_ID_WIDTH`] bytes)
    pub fn id(&self) -> &'static str {
        match self {
            Self::HmacSha256 => "HmacSHA256",
            Self::HmacSha512 => "HmacSHA512",
        }
    }

    /// Output length in bytes
    pub fn output_len(&self) -> usize {
        match self {
            Self::HmacSha256 => 32,
            Self::HmacSha512 => 64,
        }
    }

    /// Fixed-width, space-padded identifier field
    pub fn id_field(&self) -> [u8; MAC_ID_WIDTH] {
        let mut field = [b' '; MAC_ID_WIDTH];
        let id = self.id().as_bytes();
        let len = id.len().min(MAC_ID_WIDTH);
        field[..len].copy_from_slice(&id[..len]);
        field
    }
}

/// Parse a fixed-width MAC identifier field, trimming NUL and space padding
pub fn parse_mac_id_field(field: &[u8]) -> Result<&str> {
    let end = field
        .iter()
        .rposition(|b| *b != b' ' && *b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    let id = &field[..end];
    if !id.is_ascii() {
        return Err(CryptoError::InvalidEnvelope(
            "MAC identifier is not ASCII".to_string(),
        ));
    }
    std::str::from_utf8(id).map_err(|e| CryptoError::InvalidEnvelope(e.to_string()))
}

/// Immutable lookup tables for ciphers and MACs
#[derive(Clone, Debug)]
pub struct CryptoRegistry {
    ciphers: HashMap<&'static str, CipherDescriptor>,
    macs: HashMap<&'static str, MacAlgorithm>,
    default_mac: MacAlgorithm,
}

impl CryptoRegistry {
    /// Registry with every supported algorithm, HMAC-SHA256 as default MAC
    pub fn standard() -> Self {
        Self::with_default_mac(MacAlgorithm::HmacSha256)
    }

    /// Registry with every supported algorithm and a chosen default MAC
    pub fn with_default_mac(default_mac: MacAlgorithm) -> Self {
        let ciphers = [AES128_CTR, AES192_CTR, AES256_CTR, AES128_GCM, AES256_GCM]
            .into_iter()
            .map(|d| (d.id, d))
            .collect();
        let macs = [MacAlgorithm::HmacSha256, MacAlgorithm::HmacSha512]
            .into_iter()
            .map(|m| (m.id(), m))
            .collect();
        Self {
            ciphers,
            macs,
            default_mac,
        }
    }

    /// Look up a cipher by id
    pub fn cipher(&self, id: &str) -> Result<&CipherDescriptor> {
        self.ciphers
            .get(id)
            .ok_or_else(|| CryptoError::Config(format!("unsupported cipher: {}", id)))
    }

    /// Look up a MAC by wire id
    pub fn mac(&self, id: &str) -> Result<MacAlgorithm> {
        self.macs
            .get(id)
            .copied()
            .ok_or_else(|| CryptoError::Config(format!("unsupported MAC algorithm: {}", id)))
    }

    /// MAC used to authenticate non-AEAD ciphers
    pub fn default_mac(&self) -> MacAlgorithm {
        self.default_mac
    }

    /// All registered cipher ids
    pub fn cipher_ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.ciphers.keys().copied()
    }
}

impl Default for CryptoRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_ciphers() {
        let registry = CryptoRegistry::standard();
        let ctr = registry.cipher("AES256/CTR/NoPadding").unwrap();
        assert_eq!(ctr.key_len, 32);
        assert!(!ctr.is_aead());

        let gcm = registry.cipher("AES128/GCM/NoPadding").unwrap();
        assert_eq!(gcm.iv_len, 12);
        assert!(gcm.is_aead());
        assert_eq!(registry.cipher_ids().count(), 5);
    }

    #[test]
    fn test_unknown_cipher_is_config_error() {
        let registry = CryptoRegistry::standard();
        let err = registry.cipher("DES/ECB/PKCS5Padding").unwrap_err();
        assert!(matches!(err, CryptoError::Config(_)));
        assert!(matches!(registry.mac("HmacMD5"), Err(CryptoError::Config(_))));
    }

    #[test]
    fn test_mac_id_field_roundtrip() {
        for mac in [MacAlgorithm::HmacSha256, MacAlgorithm::HmacSha512] {
            let field = mac.id_field();
            assert_eq!(field.len(), MAC_ID_WIDTH);
            let parsed = parse_mac_id_field(&field).unwrap();
            assert_eq!(CryptoRegistry::standard().mac(parsed).unwrap(), mac);
        }
    }

    #[test]
    fn test_mac_id_field_accepts_nul_padding() {
        let mut field = [0u8; MAC_ID_WIDTH];
        field[..10].copy_from_slice(b"HmacSHA256");
        assert_eq!(parse_mac_id_field(&field).unwrap(), "HmacSHA256");
    }

    #[test]
    fn test_default_mac() {
        assert_eq!(
            CryptoRegistry::standard().default_mac(),
            MacAlgorithm::HmacSha256
        );
        let registry = CryptoRegistry::with_default_mac(MacAlgorithm::HmacSha512);
        assert_eq!(registry.default_mac().output_len(), 64);
    }
}
