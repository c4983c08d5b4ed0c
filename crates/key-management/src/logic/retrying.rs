// Retrying encryption service
// Encrypt/decrypt under a read lock; on a provider failure, reconnect and reload under
// the write lock, then retry the operation exactly once

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EncryptionError;
use crate::logic::encrypted_value::EncryptedValue;
use crate::logic::key_set::{EncryptionKey, EncryptionKeySet};

pub struct RetryingEncryptionService {
    key_set: Arc<EncryptionKeySet>,
    lock: RwLock<()>,
    /// Set by a failed operation, cleared once reconnect and reload both succeed.
    /// Stays set after a failed recovery so the next writer attempts it again.
    needs_reconnect: AtomicBool,
}

impl RetryingEncryptionService {
    pub fn new(key_set: Arc<EncryptionKeySet>) -> Self {
        Self {
            key_set,
            lock: RwLock::new(()),
            needs_reconnect: AtomicBool::new(false),
        }
    }

    pub fn key_set(&self) -> &Arc<EncryptionKeySet> {
        &self.key_set
    }

    /// Encrypt under the active key.
    pub async fn encrypt(&self, plaintext: &str) -> Result<EncryptedValue, EncryptionError> {
        self.encrypt_bytes(plaintext.as_bytes()).await
    }

    pub async fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<EncryptedValue, EncryptionError> {
        self.with_retry(None, |key| async move { key.encrypt(plaintext).await })
            .await
    }

    /// Decrypt with the key the value was encrypted under. Fails with `KeyNotFound`
    /// when that key is not in the key set.
    pub async fn decrypt(&self, value: &EncryptedValue) -> Result<String, EncryptionError> {
        let plaintext = self.decrypt_bytes(value).await?;
        String::from_utf8(plaintext).map_err(|e| EncryptionError::Fatal {
            msg: format!(
                "value encrypted under key {} is not valid UTF-8",
                value.encryption_key_uuid
            ),
            source: Some(e.into()),
        })
    }

    pub async fn decrypt_bytes(&self, value: &EncryptedValue) -> Result<Vec<u8>, EncryptionError> {
        self.with_retry(Some(value.encryption_key_uuid), |key| async move {
            key.decrypt(value).await
        })
        .await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        key_uuid: Option<Uuid>,
        operation: F,
    ) -> Result<T, EncryptionError>
    where
        F: Fn(Arc<EncryptionKey>) -> Fut,
        Fut: Future<Output = Result<T, EncryptionError>>,
    {
        let (cause, provider) = {
            let _read = self.lock.read().await;
            let key = self.lookup(key_uuid)?;
            match operation(key.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => (e, key.provider.clone()),
                Err(e) => return Err(e),
            }
        };

        warn!(
            "operation on provider '{}' failed, reconnecting: {}",
            provider.name(),
            cause
        );
        self.needs_reconnect.store(true, Ordering::SeqCst);

        // not an atomic upgrade: other callers may fail and recover in between
        {
            let _write = self.lock.write().await;
            if self.needs_reconnect.load(Ordering::SeqCst) {
                provider.reconnect(cause).await?;
                self.key_set.reload().await?;
                self.needs_reconnect.store(false, Ordering::SeqCst);
                info!("provider '{}' recovered", provider.name());
            }
        }

        let _read = self.lock.read().await;
        let key = self.lookup(key_uuid)?;
        operation(key).await
    }

    fn lookup(&self, key_uuid: Option<Uuid>) -> Result<Arc<EncryptionKey>, EncryptionError> {
        match key_uuid {
            None => Ok(self.key_set.get_active()),
            Some(uuid) => self
                .key_set
                .get(&uuid)
                .ok_or(EncryptionError::KeyNotFound { key_uuid: uuid }),
        }
    }
}
