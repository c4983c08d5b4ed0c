use crate::error::EncryptionError;
use crate::logic::key_proxy::SoftwareKey;

use super::{Ciphertext, aes_gcm_open, aes_gcm_seal, generate_nonce, nonce_from_slice};

/// Software AES-GCM with keys derived from configured passwords.
#[derive(Debug, Clone)]
pub struct InternalEncryptionProvider {
    name: String,
    key_creation_enabled: bool,
}

impl InternalEncryptionProvider {
    pub fn new(name: impl Into<String>, key_creation_enabled: bool) -> Self {
        Self {
            name: name.into(),
            key_creation_enabled,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_creation_enabled(&self) -> bool {
        self.key_creation_enabled
    }

    pub fn encrypt(&self, key: &SoftwareKey, plaintext: &[u8]) -> Result<Ciphertext, EncryptionError> {
        let nonce = generate_nonce();
        let encrypted_value = aes_gcm_seal(key, &nonce, plaintext).map_err(|e| EncryptionError::Fatal {
            msg: "AES-GCM encryption failed".to_string(),
            source: Some(anyhow::anyhow!("{e}")),
        })?;

        Ok(Ciphertext {
            encrypted_value,
            nonce: nonce.to_vec(),
        })
    }

    pub fn decrypt(
        &self,
        key: &SoftwareKey,
        encrypted_value: &[u8],
        nonce: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        let nonce = nonce_from_slice(nonce)?;
        aes_gcm_open(key, &nonce, encrypted_value)
            .map_err(|_| EncryptionError::auth_failure("AES-GCM authentication tag mismatch"))
    }
}
