//! Upload secret keys and derived subkeys
//!
//! The caller supplies one secret key per upload. It is expanded with
//! HKDF-SHA256 into a cipher key sized for the chosen cipher and a separate
//! MAC key, so the raw secret never keys both primitives directly.

use crate::{registry::CipherDescriptor, CryptoError, Result};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Minimum accepted secret length in bytes (128 bits)
pub const MIN_KEY_SIZE: usize = 16;

/// Maximum accepted secret length in bytes
pub const MAX_KEY_SIZE: usize = 64;

/// Length of the derived MAC key in bytes
pub const MAC_KEY_SIZE: usize = 32;

const CIPHER_KEY_INFO: &[u8] = b"tessera-cipher-key-v1";
const MAC_KEY_INFO: &[u8] = b"tessera-mac-key-v1";

/// A secret key for one upload. Never serialized.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    key: Vec<u8>,
}

impl SecretKey {
    /// Generate a new random 256-bit key
    pub fn generate() -> Self {
        let mut key = vec![0u8; 32];
        rand::RngCore::fill_bytes(&mut OsRng, &mut key);
        Self { key }
    }

    /// Create a key from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_KEY_SIZE || bytes.len() > MAX_KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "secret key must be {} to {} bytes, got {}",
                MIN_KEY_SIZE,
                MAX_KEY_SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            key: bytes.to_vec(),
        })
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    /// Derive the cipher and MAC keys for `descriptor`
    pub fn derive(&self, descriptor: &CipherDescriptor) -> Result<DerivedKeys> {
        let hk = Hkdf::<Sha256>::new(Some(descriptor.id.as_bytes()), &self.key);

        let mut cipher_key = Zeroizing::new(vec![0u8; descriptor.key_len]);
        hk.expand(CIPHER_KEY_INFO, &mut cipher_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let mut mac_key = Zeroizing::new(vec![0u8; MAC_KEY_SIZE]);
        hk.expand(MAC_KEY_INFO, &mut mac_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        Ok(DerivedKeys {
            cipher_key,
            mac_key,
        })
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey([REDACTED; {}])", self.key.len())
    }
}

/// Subkeys derived from a [`SecretKey`] for a specific cipher
pub struct DerivedKeys {
    cipher_key: Zeroizing<Vec<u8>>,
    mac_key: Zeroizing<Vec<u8>>,
}

impl DerivedKeys {
    /// Key for the block cipher
    pub fn cipher_key(&self) -> &[u8] {
        &self.cipher_key
    }

    /// Key for the HMAC
    pub fn mac_key(&self) -> &[u8] {
        &self.mac_key
    }
}

/// Generate `len` random bytes for an IV
pub fn random_iv(len: usize) -> Vec<u8> {
    let mut iv = vec![0u8; len];
    rand::RngCore::fill_bytes(&mut OsRng, &mut iv);
    iv
}
