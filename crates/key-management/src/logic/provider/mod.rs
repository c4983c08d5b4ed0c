// Encryption providers
// Raw AEAD encrypt/decrypt against a key handle, plus construction of the key proxy
// matching each provider's kind of key

pub mod factory;
pub mod hsm;
pub mod internal;
pub mod kms;

pub use factory::EncryptionProviderFactory;
pub use hsm::{HsmClient, HsmConnection, HsmEncryptionProvider, HsmError, SoftwareHsmClient};
pub use internal::InternalEncryptionProvider;
pub use kms::{AwsKmsClient, KmsClient, KmsEncryptionProvider, KmsError};

use std::sync::Arc;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng},
};
use rand::RngCore;

use crate::config::{KeyDefinition, ProviderType};
use crate::error::EncryptionError;
use crate::logic::key_proxy::{KeyHandle, KeyProxy, SoftwareKey};

/// AES-GCM nonce size in bytes (96 bits).
pub const NONCE_LENGTH: usize = 12;

/// Ciphertext produced by a provider. `nonce` is empty for providers that manage
/// their own IVs (KMS).
#[derive(Clone, PartialEq, Eq)]
pub struct Ciphertext {
    pub encrypted_value: Vec<u8>,
    pub nonce: Vec<u8>,
}

impl std::fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ciphertext")
            .field("encrypted_value_len", &self.encrypted_value.len())
            .field("nonce_len", &self.nonce.len())
            .finish()
    }
}

pub enum EncryptionProvider {
    Internal(InternalEncryptionProvider),
    Hsm(HsmEncryptionProvider),
    Kms(KmsEncryptionProvider),
}

impl std::fmt::Debug for EncryptionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionProvider")
            .field("name", &self.name())
            .field("type", &self.provider_type())
            .finish()
    }
}

impl EncryptionProvider {
    pub fn name(&self) -> &str {
        match self {
            EncryptionProvider::Internal(p) => p.name(),
            EncryptionProvider::Hsm(p) => p.name(),
            EncryptionProvider::Kms(p) => p.name(),
        }
    }

    pub fn provider_type(&self) -> ProviderType {
        match self {
            EncryptionProvider::Internal(_) => ProviderType::Internal,
            EncryptionProvider::Hsm(_) => ProviderType::Hsm,
            EncryptionProvider::Kms(_) => ProviderType::Kms,
        }
    }

    pub fn key_creation_enabled(&self) -> bool {
        match self {
            EncryptionProvider::Internal(p) => p.key_creation_enabled(),
            EncryptionProvider::Hsm(p) => p.key_creation_enabled(),
            EncryptionProvider::Kms(p) => p.key_creation_enabled(),
        }
    }

    pub async fn encrypt(
        &self,
        key: &KeyHandle,
        plaintext: &[u8],
    ) -> Result<Ciphertext, EncryptionError> {
        match (self, key) {
            (EncryptionProvider::Internal(p), KeyHandle::Software(key)) => p.encrypt(key, plaintext),
            (EncryptionProvider::Hsm(p), KeyHandle::Hsm(key)) => p.encrypt(key, plaintext).await,
            (EncryptionProvider::Kms(p), KeyHandle::Remote { key_id }) => {
                p.encrypt(key_id, plaintext).await
            }
            _ => Err(self.mismatched_key(key)),
        }
    }

    pub async fn decrypt(
        &self,
        key: &KeyHandle,
        encrypted_value: &[u8],
        nonce: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        match (self, key) {
            (EncryptionProvider::Internal(p), KeyHandle::Software(key)) => {
                p.decrypt(key, encrypted_value, nonce)
            }
            (EncryptionProvider::Hsm(p), KeyHandle::Hsm(key)) => {
                p.decrypt(key, encrypted_value, nonce).await
            }
            (EncryptionProvider::Kms(p), KeyHandle::Remote { key_id }) => {
                p.decrypt(key_id, encrypted_value).await
            }
            _ => Err(self.mismatched_key(key)),
        }
    }

    /// Build the proxy for a configured key. HSM providers may create or wait for
    /// the hardware key here.
    pub async fn create_key_proxy(
        self: &Arc<Self>,
        key: &KeyDefinition,
    ) -> Result<KeyProxy, EncryptionError> {
        match self.as_ref() {
            EncryptionProvider::Internal(_) => {
                let password = key.password.as_deref().ok_or_else(|| {
                    EncryptionError::invalid_configuration(format!(
                        "internal key '{}' has no password",
                        key.name
                    ))
                })?;
                Ok(KeyProxy::password_based(self.clone(), &key.name, password))
            }
            EncryptionProvider::Hsm(p) => {
                let handle = p.find_or_create_key(key).await?;
                Ok(KeyProxy::hsm(self.clone(), &key.name, handle))
            }
            EncryptionProvider::Kms(_) => Ok(KeyProxy::remote(self.clone(), &key.name)),
        }
    }

    /// Recover from `cause`. Providers without a session to restore hand the cause
    /// back unchanged.
    pub async fn reconnect(&self, cause: EncryptionError) -> Result<(), EncryptionError> {
        match self {
            EncryptionProvider::Hsm(p) => p.reconnect(cause).await,
            EncryptionProvider::Internal(_) | EncryptionProvider::Kms(_) => Err(cause),
        }
    }

    /// Whether a value stored with `nonce` could have come from this provider.
    /// AES-GCM providers always store a 12 byte nonce, KMS never stores one.
    pub fn accepts_nonce(&self, nonce: &[u8]) -> bool {
        match self {
            EncryptionProvider::Internal(_) | EncryptionProvider::Hsm(_) => {
                nonce.len() == NONCE_LENGTH
            }
            EncryptionProvider::Kms(_) => nonce.is_empty(),
        }
    }

    pub fn fill_random(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }

    fn mismatched_key(&self, key: &KeyHandle) -> EncryptionError {
        EncryptionError::fatal(format!(
            "{} key handle cannot be used with {} provider '{}'",
            key.kind(),
            self.provider_type(),
            self.name()
        ))
    }
}

pub(crate) fn generate_nonce() -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub(crate) fn nonce_from_slice(nonce: &[u8]) -> Result<[u8; NONCE_LENGTH], EncryptionError> {
    <[u8; NONCE_LENGTH]>::try_from(nonce).map_err(|_| {
        EncryptionError::fatal(format!(
            "invalid nonce length: expected {NONCE_LENGTH} bytes, got {}",
            nonce.len()
        ))
    })
}

/// AES-256-GCM with a 128-bit tag.
pub(crate) fn aes_gcm_seal(
    key: &SoftwareKey,
    nonce: &[u8; NONCE_LENGTH],
    plaintext: &[u8],
) -> Result<Vec<u8>, aes_gcm::Error> {
    let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher.encrypt(Nonce::from_slice(nonce), plaintext)
}

/// Fails when the tag does not verify, which is what a wrong key looks like.
pub(crate) fn aes_gcm_open(
    key: &SoftwareKey,
    nonce: &[u8; NONCE_LENGTH],
    ciphertext: &[u8],
) -> Result<Vec<u8>, aes_gcm::Error> {
    let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher.decrypt(Nonce::from_slice(nonce), ciphertext)
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::logic::canary::{CANARY_VALUE, DEPRECATED_CANARY_VALUE};

    #[tokio::test]
    async fn test_canary_round_trip_for_both_sentinels() {
        shared::setup_test!();

        let provider = Arc::new(EncryptionProvider::Internal(InternalEncryptionProvider::new(
            "internal", false,
        )));
        let key = KeyHandle::Software(SoftwareKey::generate());

        for sentinel in [CANARY_VALUE.as_slice(), DEPRECATED_CANARY_VALUE.as_slice()] {
            let ciphertext = provider.encrypt(&key, sentinel).await.unwrap();
            assert_eq!(ciphertext.nonce.len(), NONCE_LENGTH);
            assert_ne!(ciphertext.encrypted_value.as_slice(), sentinel);

            let plaintext = provider
                .decrypt(&key, &ciphertext.encrypted_value, &ciphertext.nonce)
                .await
                .unwrap();
            assert_eq!(plaintext.as_slice(), sentinel);
        }
    }

    #[tokio::test]
    async fn test_mismatched_key_handle_is_fatal() {
        shared::setup_test!();

        let provider = EncryptionProvider::Internal(InternalEncryptionProvider::new("internal", false));
        let key = KeyHandle::Remote {
            key_id: "alias/credhub".to_string(),
        };

        let err = provider.encrypt(&key, b"hello").await.unwrap_err();
        assert!(matches!(err, EncryptionError::Fatal { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_internal_reconnect_rethrows_cause() {
        shared::setup_test!();

        let provider = EncryptionProvider::Internal(InternalEncryptionProvider::new("internal", false));
        let err = provider
            .reconnect(EncryptionError::transient("boom", None))
            .await
            .unwrap_err();
        match err {
            EncryptionError::Transient { msg, .. } => assert_eq!(msg, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_accepts_nonce_by_provider_kind() {
        let internal = EncryptionProvider::Internal(InternalEncryptionProvider::new("internal", false));
        assert!(internal.accepts_nonce(&[0u8; NONCE_LENGTH]));
        assert!(!internal.accepts_nonce(&[]));

        let kms = EncryptionProvider::Kms(KmsEncryptionProvider::new(
            "aws",
            false,
            Arc::new(kms::MockKmsClient::new()),
        ));
        assert!(kms.accepts_nonce(&[]));
        assert!(!kms.accepts_nonce(&[0u8; NONCE_LENGTH]));
    }

    #[test]
    fn test_nonce_from_slice_validates_length() {
        assert!(nonce_from_slice(&[0u8; NONCE_LENGTH]).is_ok());
        assert!(nonce_from_slice(&[0u8; 8]).is_err());
        assert!(nonce_from_slice(&[]).is_err());
    }
}
