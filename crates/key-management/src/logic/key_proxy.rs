// Key proxies
// Wrap one configured key and test it against persisted canaries without storing the key

use std::sync::Arc;

use aes_gcm::aead::OsRng;
use rand::RngCore;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::EncryptionError;
use crate::logic::canary::{EncryptionKeyCanary, is_canary_sentinel};
use crate::logic::provider::EncryptionProvider;

pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const KEY_LENGTH_BYTES: usize = 32;
pub const SALT_LENGTH_BYTES: usize = 64;

/// 256-bit AES key held in memory. Zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SoftwareKey([u8; KEY_LENGTH_BYTES]);

impl SoftwareKey {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LENGTH_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let key = Self(bytes);
        bytes.zeroize();
        key
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH_BYTES] {
        &self.0
    }
}

impl std::fmt::Debug for SoftwareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SoftwareKey(************)")
    }
}

/// Reference to a key living inside an HSM partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsmKeyHandle {
    pub alias: String,
    pub handle: u64,
}

#[derive(Debug, Clone)]
pub enum KeyHandle {
    Software(SoftwareKey),
    Hsm(HsmKeyHandle),
    Remote { key_id: String },
}

impl KeyHandle {
    pub fn kind(&self) -> &'static str {
        match self {
            KeyHandle::Software(_) => "software",
            KeyHandle::Hsm(_) => "hsm",
            KeyHandle::Remote { .. } => "remote",
        }
    }
}

/// PBKDF2-HMAC-SHA384 of `password` and `salt`. Runs on the blocking pool.
pub async fn derive_key(password: &str, salt: &[u8]) -> Result<SoftwareKey, EncryptionError> {
    let password = Zeroizing::new(password.as_bytes().to_vec());
    let salt = salt.to_vec();

    tokio::task::spawn_blocking(move || {
        let mut bytes = [0u8; KEY_LENGTH_BYTES];
        pbkdf2::pbkdf2_hmac::<sha2::Sha384>(&password, &salt, PBKDF2_ITERATIONS, &mut bytes);
        let key = SoftwareKey(bytes);
        bytes.zeroize();
        key
    })
    .await
    .map_err(|e| EncryptionError::Fatal {
        msg: "key derivation task failed".to_string(),
        source: Some(e.into()),
    })
}

enum KeyProxyKind {
    PasswordBased {
        password: Zeroizing<String>,
        key: Option<SoftwareKey>,
        salt: Option<Vec<u8>>,
    },
    Hsm {
        key: Option<HsmKeyHandle>,
    },
    Remote {
        key_id: String,
    },
}

/// One configured key, able to produce its key handle and to decide whether a
/// canary was encrypted under it.
pub struct KeyProxy {
    provider: Arc<EncryptionProvider>,
    key_name: String,
    kind: KeyProxyKind,
}

impl std::fmt::Debug for KeyProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            KeyProxyKind::PasswordBased { .. } => "password_based",
            KeyProxyKind::Hsm { .. } => "hsm",
            KeyProxyKind::Remote { .. } => "remote",
        };
        f.debug_struct("KeyProxy")
            .field("provider", &self.provider.name())
            .field("key_name", &self.key_name)
            .field("kind", &kind)
            .finish()
    }
}

impl KeyProxy {
    pub fn password_based(provider: Arc<EncryptionProvider>, key_name: &str, password: &str) -> Self {
        Self {
            provider,
            key_name: key_name.to_string(),
            kind: KeyProxyKind::PasswordBased {
                password: Zeroizing::new(password.to_string()),
                key: None,
                salt: None,
            },
        }
    }

    pub fn hsm(provider: Arc<EncryptionProvider>, key_name: &str, key: Option<HsmKeyHandle>) -> Self {
        Self {
            provider,
            key_name: key_name.to_string(),
            kind: KeyProxyKind::Hsm { key },
        }
    }

    /// Remote keys are referenced by name; no key material is ever local.
    pub fn remote(provider: Arc<EncryptionProvider>, key_name: &str) -> Self {
        Self {
            provider,
            key_name: key_name.to_string(),
            kind: KeyProxyKind::Remote {
                key_id: key_name.to_string(),
            },
        }
    }

    pub fn provider(&self) -> &Arc<EncryptionProvider> {
        &self.provider
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// The key handle, deriving a password-based key from a fresh salt on first use.
    /// `None` for an HSM key whose alias does not exist.
    pub async fn get_key(&mut self) -> Result<Option<KeyHandle>, EncryptionError> {
        match &mut self.kind {
            KeyProxyKind::PasswordBased {
                password,
                key,
                salt,
            } => {
                if key.is_none() {
                    let new_salt = match salt {
                        Some(existing) => existing.clone(),
                        None => generate_salt(&self.provider),
                    };
                    *key = Some(derive_key(password, &new_salt).await?);
                    *salt = Some(new_salt);
                }
                Ok(key.clone().map(KeyHandle::Software))
            }
            KeyProxyKind::Hsm { key } => Ok(key.clone().map(KeyHandle::Hsm)),
            KeyProxyKind::Remote { key_id } => Ok(Some(KeyHandle::Remote {
                key_id: key_id.clone(),
            })),
        }
    }

    /// Salt the current key was derived with. Empty for non-password keys and
    /// before a password-based key has been derived or matched.
    pub fn salt(&self) -> &[u8] {
        match &self.kind {
            KeyProxyKind::PasswordBased {
                salt: Some(salt), ..
            } => salt.as_slice(),
            _ => &[],
        }
    }

    /// Whether `canary` decrypts to a sentinel under this key. A password-based
    /// proxy adopts the canary's salt and the derived key on success.
    pub async fn matches_canary(
        &mut self,
        canary: &EncryptionKeyCanary,
    ) -> Result<bool, EncryptionError> {
        match &mut self.kind {
            KeyProxyKind::PasswordBased {
                password,
                key,
                salt,
            } => {
                let candidate = derive_key(password, &canary.salt).await?;
                let matched =
                    check_canary(&self.provider, &KeyHandle::Software(candidate.clone()), canary)
                        .await?;
                if matched {
                    *key = Some(candidate);
                    *salt = Some(canary.salt.clone());
                }
                Ok(matched)
            }
            KeyProxyKind::Hsm { key: None } => Ok(false),
            KeyProxyKind::Hsm { key: Some(key) } => {
                check_canary(&self.provider, &KeyHandle::Hsm(key.clone()), canary).await
            }
            KeyProxyKind::Remote { key_id } => {
                let handle = KeyHandle::Remote {
                    key_id: key_id.clone(),
                };
                check_canary(&self.provider, &handle, canary).await
            }
        }
    }
}

/// Fixed-size salt from two rounds of the provider's CSPRNG.
fn generate_salt(provider: &EncryptionProvider) -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LENGTH_BYTES];
    provider.fill_random(&mut salt);
    provider.fill_random(&mut salt);
    salt
}

async fn check_canary(
    provider: &EncryptionProvider,
    key: &KeyHandle,
    canary: &EncryptionKeyCanary,
) -> Result<bool, EncryptionError> {
    // written by a different kind of provider, so not under this key
    if !provider.accepts_nonce(&canary.nonce) {
        debug!(
            "canary {} was not written by a {} provider, skipping",
            canary.uuid,
            provider.provider_type()
        );
        return Ok(false);
    }

    match provider
        .decrypt(key, &canary.encrypted_canary_value, &canary.nonce)
        .await
    {
        Ok(plaintext) => Ok(is_canary_sentinel(&plaintext)),
        Err(e) if e.indicates_wrong_key() => Ok(false),
        Err(e) => Err(EncryptionError::IncorrectKey {
            msg: format!(
                "could not test key against canary {} with provider '{}'",
                canary.uuid,
                provider.name()
            ),
            source: Some(e.into()),
        }),
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::logic::canary::{CANARY_VALUE, DEPRECATED_CANARY_VALUE};
    use crate::logic::provider::InternalEncryptionProvider;
    use shared::primitives::WrappedChronoDateTime;
    use uuid::Uuid;

    fn internal_provider() -> Arc<EncryptionProvider> {
        Arc::new(EncryptionProvider::Internal(InternalEncryptionProvider::new(
            "internal", true,
        )))
    }

    async fn canary_for(proxy: &mut KeyProxy, sentinel: &[u8]) -> EncryptionKeyCanary {
        let key = proxy.get_key().await.unwrap().unwrap();
        let ciphertext = proxy.provider().encrypt(&key, sentinel).await.unwrap();
        EncryptionKeyCanary {
            uuid: Uuid::new_v4(),
            encrypted_canary_value: ciphertext.encrypted_value,
            nonce: ciphertext.nonce,
            salt: proxy.salt().to_vec(),
            created_at: WrappedChronoDateTime::now(),
        }
    }

    #[tokio::test]
    async fn test_derive_key_is_deterministic_per_salt() {
        shared::setup_test!();

        let salt = [7u8; SALT_LENGTH_BYTES];
        let a = derive_key("correct-horse", &salt).await.unwrap();
        let b = derive_key("correct-horse", &salt).await.unwrap();
        let c = derive_key("correct-horse", &[8u8; SALT_LENGTH_BYTES]).await.unwrap();
        let d = derive_key("battery-staple", &salt).await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[tokio::test]
    async fn test_password_proxy_generates_salt_lazily() {
        shared::setup_test!();

        let mut proxy = KeyProxy::password_based(internal_provider(), "k1", "correct-horse");
        assert!(proxy.salt().is_empty());

        let first = proxy.get_key().await.unwrap().unwrap();
        assert_eq!(proxy.salt().len(), SALT_LENGTH_BYTES);

        // cached after the first derivation
        let second = proxy.get_key().await.unwrap().unwrap();
        match (first, second) {
            (KeyHandle::Software(a), KeyHandle::Software(b)) => assert_eq!(a, b),
            other => panic!("unexpected key handles: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_matches_own_canary_for_both_sentinels() {
        shared::setup_test!();

        for sentinel in [CANARY_VALUE.as_slice(), DEPRECATED_CANARY_VALUE.as_slice()] {
            let mut creator = KeyProxy::password_based(internal_provider(), "k1", "correct-horse");
            let canary = canary_for(&mut creator, sentinel).await;

            // a fresh proxy for the same password recovers the key from the canary's salt
            let mut proxy = KeyProxy::password_based(internal_provider(), "k1", "correct-horse");
            assert!(proxy.matches_canary(&canary).await.unwrap());
            assert_eq!(proxy.salt(), canary.salt.as_slice());

            let recovered = proxy.get_key().await.unwrap().unwrap();
            let plaintext = proxy
                .provider()
                .decrypt(&recovered, &canary.encrypted_canary_value, &canary.nonce)
                .await
                .unwrap();
            assert_eq!(plaintext.as_slice(), sentinel);
        }
    }

    #[tokio::test]
    async fn test_matching_is_key_specific() {
        shared::setup_test!();

        let mut k1 = KeyProxy::password_based(internal_provider(), "k1", "correct-horse");
        let canary = canary_for(&mut k1, &CANARY_VALUE).await;

        let mut k2 = KeyProxy::password_based(internal_provider(), "k2", "battery-staple");
        assert!(!k2.matches_canary(&canary).await.unwrap());
        // a failed match does not bind a key or salt
        assert!(k2.salt().is_empty());
    }

    #[tokio::test]
    async fn test_non_sentinel_plaintext_does_not_match() {
        shared::setup_test!();

        let mut proxy = KeyProxy::password_based(internal_provider(), "k1", "correct-horse");
        let canary = canary_for(&mut proxy, b"not a canary").await;

        let mut fresh = KeyProxy::password_based(internal_provider(), "k1", "correct-horse");
        assert!(!fresh.matches_canary(&canary).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_canary_is_incorrect_key() {
        shared::setup_test!();

        let mut proxy = KeyProxy::password_based(internal_provider(), "k1", "correct-horse");
        let mut canary = canary_for(&mut proxy, &CANARY_VALUE).await;
        canary.nonce.truncate(3);

        let mut fresh = KeyProxy::password_based(internal_provider(), "k1", "correct-horse");
        let err = fresh.matches_canary(&canary).await.unwrap_err();
        assert!(matches!(err, EncryptionError::IncorrectKey { .. }));
    }

    #[tokio::test]
    async fn test_hsm_proxy_without_key_never_matches() {
        shared::setup_test!();

        let mut creator = KeyProxy::password_based(internal_provider(), "k1", "correct-horse");
        let canary = canary_for(&mut creator, &CANARY_VALUE).await;

        let mut proxy = KeyProxy::hsm(internal_provider(), "missing", None);
        assert!(proxy.get_key().await.unwrap().is_none());
        assert!(!proxy.matches_canary(&canary).await.unwrap());
        assert!(proxy.salt().is_empty());
    }

    #[test]
    fn test_software_key_debug_is_redacted() {
        let key = SoftwareKey::from_bytes([42u8; KEY_LENGTH_BYTES]);
        assert_eq!(format!("{key:?}"), "SoftwareKey(************)");
    }
}
