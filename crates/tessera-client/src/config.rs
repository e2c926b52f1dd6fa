//! Upload configuration

use crate::{ClientError, Result};
use serde::{Deserialize, Serialize};
use tessera_crypto::{stream::DEFAULT_RELAY_BUFFER_SIZE, CryptoRegistry, DEFAULT_CIPHER, DEFAULT_PART_SIZE};

/// Largest part a single request may carry (5 GB)
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Upload configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Plaintext bytes per part
    pub part_size: u64,
    /// Relay buffer between the cipher and the part sink
    pub relay_buffer_size: usize,
    /// Cipher for object data
    pub cipher_id: String,
    /// MAC used with non-AEAD ciphers
    pub mac_id: String,
    /// Cipher for saved upload state
    pub state_cipher_id: String,
    /// Retries per part after resumable transport failures
    pub max_part_retries: u32,
    /// Times the plaintext source may be reopened within one part
    pub max_source_reopens: u32,
    /// Content type of the final object
    pub content_type: Option<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            relay_buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
            cipher_id: DEFAULT_CIPHER.to_string(),
            mac_id: "HmacSHA256".to_string(),
            state_cipher_id: DEFAULT_CIPHER.to_string(),
            max_part_retries: 3,
            max_source_reopens: 3,
            content_type: None,
        }
    }
}

impl UploadConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the part size
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    /// Set the relay buffer size
    pub fn with_relay_buffer_size(mut self, size: usize) -> Self {
        self.relay_buffer_size = size;
        self
    }

    /// Set the data cipher
    pub fn with_cipher(mut self, cipher_id: impl Into<String>) -> Self {
        self.cipher_id = cipher_id.into();
        self
    }

    /// Set the MAC algorithm
    pub fn with_mac(mut self, mac_id: impl Into<String>) -> Self {
        self.mac_id = mac_id.into();
        self
    }

    /// Set the cipher for saved state
    pub fn with_state_cipher(mut self, cipher_id: impl Into<String>) -> Self {
        self.state_cipher_id = cipher_id.into();
        self
    }

    /// Set the per-part retry budget
    pub fn with_max_part_retries(mut self, retries: u32) -> Self {
        self.max_part_retries = retries;
        self
    }

    /// Set the per-part source reopen budget
    pub fn with_max_source_reopens(mut self, reopens: u32) -> Self {
        self.max_source_reopens = reopens;
        self
    }

    /// Set the content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Check sizes and identifiers
    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 || self.part_size > MAX_PART_SIZE {
            return Err(ClientError::Config(format!(
                "part_size must be between 1 and {} bytes, got {}",
                MAX_PART_SIZE, self.part_size
            )));
        }
        if self.relay_buffer_size == 0 {
            return Err(ClientError::Config(
                "relay_buffer_size must be greater than zero".to_string(),
            ));
        }
        self.registry()?;
        Ok(())
    }

    /// Registry with the configured MAC as default.
    ///
    /// Fails if either cipher or the MAC is unknown.
    pub fn registry(&self) -> Result<CryptoRegistry> {
        let standard = CryptoRegistry::standard();
        let mac = standard
            .mac(&self.mac_id)
            .map_err(|e| ClientError::Config(e.to_string()))?;
        let registry = CryptoRegistry::with_default_mac(mac);
        for id in [&self.cipher_id, &self.state_cipher_id] {
            registry
                .cipher(id)
                .map_err(|e| ClientError::Config(e.to_string()))?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = UploadConfig::default();
        config.validate().unwrap();
        assert_eq!(config.part_size, 8 * 1024 * 1024);
        assert_eq!(config.cipher_id, "AES256/CTR/NoPadding");
    }

    #[test]
    fn test_builder() {
        let config = UploadConfig::default()
            .with_part_size(1024)
            .with_cipher("AES128/GCM/NoPadding")
            .with_mac("HmacSHA512")
            .with_max_part_retries(5)
            .with_content_type("text/plain");
        config.validate().unwrap();
        assert_eq!(config.part_size, 1024);
        assert_eq!(config.max_part_retries, 5);
        assert_eq!(config.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(UploadConfig::default().with_part_size(0).validate().is_err());
        assert!(UploadConfig::default().with_relay_buffer_size(0).validate().is_err());
        assert!(UploadConfig::default().with_cipher("DES/ECB").validate().is_err());
        assert!(UploadConfig::default().with_mac("HmacMD5").validate().is_err());
        assert!(UploadConfig::default()
            .with_state_cipher("AES/CBC/PKCS5Padding")
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = UploadConfig::from_json(r#"{"part_size": 65536, "max_part_retries": 1}"#).unwrap();
        assert_eq!(config.part_size, 65_536);
        assert_eq!(config.max_part_retries, 1);
        assert_eq!(config.mac_id, "HmacSHA256");

        assert!(matches!(
            UploadConfig::from_json(r#"{"part_size": 0}"#),
            Err(ClientError::Config(_))
        ));
        assert!(UploadConfig::from_json("not json").is_err());
    }
}
