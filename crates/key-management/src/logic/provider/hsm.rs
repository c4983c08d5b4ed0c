// HSM-backed encryption provider
// Keys live in a hardware partition behind a login session; the session can drop and
// is restored through reconnect()

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BootstrapConfig, KeyDefinition};
use crate::error::EncryptionError;
use crate::logic::key_proxy::{HsmKeyHandle, SoftwareKey};

use super::{Ciphertext, NONCE_LENGTH, aes_gcm_open, aes_gcm_seal, generate_nonce, nonce_from_slice};

/// PKCS#11 CKR_ENCRYPTED_DATA_INVALID. Raised when data is decrypted with the wrong key.
pub const CKR_ENCRYPTED_DATA_INVALID: u32 = 0x40;
/// PKCS#11 CKR_KEY_HANDLE_INVALID.
pub const CKR_KEY_HANDLE_INVALID: u32 = 0x60;

#[derive(Error, Debug)]
pub enum HsmError {
    #[error("hsm session is not logged in")]
    SessionClosed,
    #[error("hsm authentication tag mismatch")]
    AuthenticationTagMismatch,
    #[error("hsm login failed: {0}")]
    LoginFailed(String),
    #[error("hsm returns 0x{code:x}: {msg}")]
    Vendor { code: u32, msg: String },
}

impl HsmError {
    /// Vendor specific: which hardware errors mean "wrong key" rather than
    /// "the device or session failed".
    pub fn into_encryption_error(self, context: &str) -> EncryptionError {
        match self {
            HsmError::AuthenticationTagMismatch
            | HsmError::Vendor {
                code: CKR_ENCRYPTED_DATA_INVALID,
                ..
            } => EncryptionError::AuthFailure {
                msg: context.to_string(),
                source: Some(self.into()),
            },
            _ => EncryptionError::transient(context, Some(self.into())),
        }
    }
}

/// Where and as whom a session logs in, taken from the provider configuration.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HsmConnection {
    pub partition: Option<String>,
    pub partition_password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl std::fmt::Debug for HsmConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmConnection")
            .field("partition", &self.partition)
            .field(
                "partition_password",
                &self.partition_password.as_ref().map(|_| "************"),
            )
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

/// Login session to an HSM partition.
#[async_trait::async_trait]
pub trait HsmClient: Send + Sync {
    async fn login(&self, connection: &HsmConnection) -> Result<(), HsmError>;
    async fn is_logged_in(&self) -> bool;
    async fn get_key(&self, alias: &str) -> Result<Option<HsmKeyHandle>, HsmError>;
    async fn generate_key(&self, alias: &str) -> Result<HsmKeyHandle, HsmError>;
    async fn encrypt(
        &self,
        key: &HsmKeyHandle,
        nonce: &[u8; NONCE_LENGTH],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, HsmError>;
    async fn decrypt(
        &self,
        key: &HsmKeyHandle,
        nonce: &[u8; NONCE_LENGTH],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, HsmError>;
}

pub struct HsmEncryptionProvider {
    name: String,
    key_creation_enabled: bool,
    client: Arc<dyn HsmClient>,
    connection: HsmConnection,
    bootstrap: BootstrapConfig,
}

impl std::fmt::Debug for HsmEncryptionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmEncryptionProvider")
            .field("name", &self.name)
            .field("key_creation_enabled", &self.key_creation_enabled)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl HsmEncryptionProvider {
    /// Logs in to the partition before returning.
    pub async fn connect(
        name: impl Into<String>,
        key_creation_enabled: bool,
        client: Arc<dyn HsmClient>,
        connection: HsmConnection,
        bootstrap: BootstrapConfig,
    ) -> Result<Self, EncryptionError> {
        let name = name.into();
        if !client.is_logged_in().await {
            client
                .login(&connection)
                .await
                .map_err(|e| e.into_encryption_error(&format!("hsm '{name}' login failed")))?;
        }
        info!(
            "connected to hsm provider '{}' (partition {:?})",
            name, connection.partition
        );

        Ok(Self {
            name,
            key_creation_enabled,
            client,
            connection,
            bootstrap,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_creation_enabled(&self) -> bool {
        self.key_creation_enabled
    }

    pub async fn encrypt(
        &self,
        key: &HsmKeyHandle,
        plaintext: &[u8],
    ) -> Result<Ciphertext, EncryptionError> {
        let nonce = generate_nonce();
        let encrypted_value = self
            .client
            .encrypt(key, &nonce, plaintext)
            .await
            .map_err(|e| e.into_encryption_error("hsm encrypt failed"))?;

        Ok(Ciphertext {
            encrypted_value,
            nonce: nonce.to_vec(),
        })
    }

    pub async fn decrypt(
        &self,
        key: &HsmKeyHandle,
        encrypted_value: &[u8],
        nonce: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        let nonce = nonce_from_slice(nonce)?;
        self.client
            .decrypt(key, &nonce, encrypted_value)
            .await
            .map_err(|e| e.into_encryption_error("hsm decrypt failed"))
    }

    /// Look up the key for `key` by alias. A missing alias is generated when key
    /// creation is enabled. Otherwise an active key waits for a peer to create it,
    /// and an inactive key resolves to `None`.
    pub async fn find_or_create_key(
        &self,
        key: &KeyDefinition,
    ) -> Result<Option<HsmKeyHandle>, EncryptionError> {
        if let Some(handle) = self.lookup(&key.name).await? {
            return Ok(Some(handle));
        }

        if self.key_creation_enabled {
            info!("creating hsm key '{}' in provider '{}'", key.name, self.name);
            let handle = self
                .client
                .generate_key(&key.name)
                .await
                .map_err(|e| e.into_encryption_error("hsm key generation failed"))?;
            return Ok(Some(handle));
        }

        if !key.active {
            debug!(
                "hsm key '{}' does not exist in provider '{}', skipping",
                key.name, self.name
            );
            return Ok(None);
        }

        info!(
            "waiting for hsm key '{}' to be created in provider '{}'",
            key.name, self.name
        );
        let started = Instant::now();
        let deadline = started + self.bootstrap.timeout;
        loop {
            tokio::time::sleep(self.bootstrap.poll_interval).await;
            if let Some(handle) = self.lookup(&key.name).await? {
                info!("hsm key '{}' is now available", key.name);
                return Ok(Some(handle));
            }
            debug!("hsm key '{}' still missing", key.name);
            if Instant::now() >= deadline {
                return Err(EncryptionError::BootstrapTimeout {
                    what: format!("hsm key '{}' in provider '{}'", key.name, self.name),
                    waited: started.elapsed(),
                });
            }
        }
    }

    /// Log back in if the session dropped. Safe to call repeatedly.
    pub async fn reconnect(&self, cause: EncryptionError) -> Result<(), EncryptionError> {
        if self.client.is_logged_in().await {
            debug!("hsm provider '{}' session still open", self.name);
            return Ok(());
        }

        warn!("reconnecting hsm provider '{}' after: {}", self.name, cause);
        self.client.login(&self.connection).await.map_err(|e| {
            warn!("hsm provider '{}' login failed: {}", self.name, e);
            e.into_encryption_error(&format!("hsm '{}' reconnect failed", self.name))
        })
    }

    async fn lookup(&self, alias: &str) -> Result<Option<HsmKeyHandle>, EncryptionError> {
        self.client
            .get_key(alias)
            .await
            .map_err(|e| e.into_encryption_error("hsm key lookup failed"))
    }
}

/// In-process HSM: AES-256-GCM keys held in memory by alias, behind an explicit
/// login session. Keys do not survive the process.
#[derive(Default)]
pub struct SoftwareHsmClient {
    credentials: Option<(String, String)>,
    logged_in: AtomicBool,
    login_count: AtomicUsize,
    next_handle: AtomicU64,
    aliases: DashMap<String, HsmKeyHandle>,
    keys: DashMap<u64, SoftwareKey>,
}

impl SoftwareHsmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept logins to `partition` with `password`. Without this any login succeeds.
    pub fn with_partition(partition: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Some((partition.into(), password.into())),
            ..Self::default()
        }
    }

    /// Number of successful logins so far.
    pub fn login_count(&self) -> usize {
        self.login_count.load(Ordering::SeqCst)
    }

    /// Drop the session, as a device restart or network partition would.
    pub fn drop_session(&self) {
        self.logged_in.store(false, Ordering::SeqCst);
    }

    fn ensure_session(&self) -> Result<(), HsmError> {
        if self.logged_in.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HsmError::SessionClosed)
        }
    }

    fn key_for(&self, key: &HsmKeyHandle) -> Result<SoftwareKey, HsmError> {
        self.keys
            .get(&key.handle)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| HsmError::Vendor {
                code: CKR_KEY_HANDLE_INVALID,
                msg: format!("no key with handle {} ({})", key.handle, key.alias),
            })
    }
}

#[async_trait::async_trait]
impl HsmClient for SoftwareHsmClient {
    async fn login(&self, connection: &HsmConnection) -> Result<(), HsmError> {
        if let Some((partition, password)) = &self.credentials {
            if connection.partition.as_ref() != Some(partition) {
                return Err(HsmError::LoginFailed(format!(
                    "unknown partition {:?}",
                    connection.partition
                )));
            }
            if connection.partition_password.as_ref() != Some(password) {
                return Err(HsmError::LoginFailed(format!(
                    "wrong password for partition {partition}"
                )));
            }
        }
        self.logged_in.store(true, Ordering::SeqCst);
        self.login_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn get_key(&self, alias: &str) -> Result<Option<HsmKeyHandle>, HsmError> {
        self.ensure_session()?;
        Ok(self.aliases.get(alias).map(|entry| entry.value().clone()))
    }

    async fn generate_key(&self, alias: &str) -> Result<HsmKeyHandle, HsmError> {
        self.ensure_session()?;
        let handle = self
            .aliases
            .entry(alias.to_string())
            .or_insert_with(|| {
                let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
                self.keys.insert(handle, SoftwareKey::generate());
                HsmKeyHandle {
                    alias: alias.to_string(),
                    handle,
                }
            })
            .value()
            .clone();
        Ok(handle)
    }

    async fn encrypt(
        &self,
        key: &HsmKeyHandle,
        nonce: &[u8; NONCE_LENGTH],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, HsmError> {
        self.ensure_session()?;
        let software_key = self.key_for(key)?;
        aes_gcm_seal(&software_key, nonce, plaintext).map_err(|e| HsmError::Vendor {
            code: 0x5,
            msg: format!("encrypt failed: {e}"),
        })
    }

    async fn decrypt(
        &self,
        key: &HsmKeyHandle,
        nonce: &[u8; NONCE_LENGTH],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, HsmError> {
        self.ensure_session()?;
        let software_key = self.key_for(key)?;
        aes_gcm_open(&software_key, nonce, ciphertext).map_err(|_| HsmError::AuthenticationTagMismatch)
    }
}
