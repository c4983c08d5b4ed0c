// Encryption key set
// Registry of canary UUID -> live key, rebuilt as a whole and swapped in on reload

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ProviderType;
use crate::error::EncryptionError;
use crate::logic::canary_mapper::EncryptionKeyCanaryMapper;
use crate::logic::encrypted_value::EncryptedValue;
use crate::logic::key_proxy::KeyHandle;
use crate::logic::provider::EncryptionProvider;

/// A configured key bound to the canary that identifies it.
pub struct EncryptionKey {
    pub uuid: Uuid,
    pub provider: Arc<EncryptionProvider>,
    pub key: KeyHandle,
    pub key_name: String,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("uuid", &self.uuid)
            .field("provider", &self.provider.name())
            .field("key_name", &self.key_name)
            .finish()
    }
}

impl EncryptionKey {
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedValue, EncryptionError> {
        let ciphertext = self.provider.encrypt(&self.key, plaintext).await?;
        Ok(EncryptedValue {
            encryption_key_uuid: self.uuid,
            encrypted_value: ciphertext.encrypted_value,
            nonce: ciphertext.nonce,
        })
    }

    pub async fn decrypt(&self, value: &EncryptedValue) -> Result<Vec<u8>, EncryptionError> {
        self.provider
            .decrypt(&self.key, &value.encrypted_value, &value.nonce)
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyDescription {
    pub uuid: Uuid,
    pub provider_name: String,
    pub provider_type: ProviderType,
    pub key_name: String,
    pub active: bool,
}

/// Immutable snapshot of the bound keys. Always has exactly one active key.
pub struct KeyRegistry {
    keys: HashMap<Uuid, Arc<EncryptionKey>>,
    order: Vec<Uuid>,
    active: Arc<EncryptionKey>,
    generation: u64,
}

impl std::fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("keys", &self.order)
            .field("active", &self.active.uuid)
            .field("generation", &self.generation)
            .finish()
    }
}

impl KeyRegistry {
    /// Build from `(key, active)` pairs in configuration order. When two keys bind
    /// to the same canary the first wins, unless the later one is the active key.
    pub fn new(bound: Vec<(EncryptionKey, bool)>) -> Result<Self, EncryptionError> {
        let mut keys: HashMap<Uuid, Arc<EncryptionKey>> = HashMap::new();
        let mut order = Vec::new();
        let mut active: Option<Arc<EncryptionKey>> = None;

        for (key, is_active) in bound {
            let key = Arc::new(key);

            if is_active {
                if let Some(existing) = &active {
                    return Err(EncryptionError::invalid_configuration(format!(
                        "keys '{}' and '{}' are both marked active",
                        existing.key_name, key.key_name
                    )));
                }
                active = Some(key.clone());
            }

            match keys.get(&key.uuid) {
                Some(existing) if !is_active => {
                    warn!(
                        "key '{}' matches the same canary {} as key '{}'",
                        key.key_name, key.uuid, existing.key_name
                    );
                }
                Some(_) => {
                    keys.insert(key.uuid, key);
                }
                None => {
                    order.push(key.uuid);
                    keys.insert(key.uuid, key);
                }
            }
        }

        let active = active.ok_or(EncryptionError::NoActiveKey)?;
        Ok(Self {
            keys,
            order,
            active,
            generation: 0,
        })
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Arc<EncryptionKey>> {
        self.keys.get(uuid).cloned()
    }

    pub fn active(&self) -> Arc<EncryptionKey> {
        self.active.clone()
    }

    pub fn uuids(&self) -> Vec<Uuid> {
        self.order.clone()
    }

    /// Incremented on every reload.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// The set of usable keys. Reads never block; `reload` rebuilds the registry from
/// configuration and persisted canaries and swaps it in whole.
pub struct EncryptionKeySet {
    registry: ArcSwap<KeyRegistry>,
    mapper: Arc<EncryptionKeyCanaryMapper>,
}

impl EncryptionKeySet {
    pub async fn initialize(mapper: Arc<EncryptionKeyCanaryMapper>) -> Result<Self, EncryptionError> {
        let registry = mapper.map_uuids_to_keys().await?;
        info!(
            "initialized encryption key set with {} key(s), active key {}",
            registry.len(),
            registry.active.uuid
        );

        Ok(Self {
            registry: ArcSwap::from_pointee(registry),
            mapper,
        })
    }

    /// Rebuild the registry. Readers keep the previous snapshot until the new one
    /// is complete; a failed rebuild leaves it in place.
    pub async fn reload(&self) -> Result<(), EncryptionError> {
        let mut registry = self.mapper.map_uuids_to_keys().await?;
        registry.generation = self.registry.load().generation + 1;
        info!(
            "reloaded encryption key set (generation {}), active key {}",
            registry.generation, registry.active.uuid
        );
        self.registry.store(Arc::new(registry));
        Ok(())
    }

    pub fn mapper(&self) -> &Arc<EncryptionKeyCanaryMapper> {
        &self.mapper
    }

    pub fn snapshot(&self) -> Arc<KeyRegistry> {
        self.registry.load_full()
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Arc<EncryptionKey>> {
        self.registry.load().get(uuid)
    }

    pub fn get_active(&self) -> Arc<EncryptionKey> {
        self.registry.load().active()
    }

    pub fn get_active_uuid(&self) -> Uuid {
        self.registry.load().active.uuid
    }

    pub fn get_uuids(&self) -> Vec<Uuid> {
        self.registry.load().uuids()
    }

    pub fn get_inactive_uuids(&self) -> Vec<Uuid> {
        let registry = self.registry.load();
        registry
            .order
            .iter()
            .filter(|uuid| **uuid != registry.active.uuid)
            .copied()
            .collect()
    }

    pub fn generation(&self) -> u64 {
        self.registry.load().generation
    }

    pub fn describe(&self) -> Vec<KeyDescription> {
        let registry = self.registry.load();
        registry
            .order
            .iter()
            .filter_map(|uuid| registry.keys.get(uuid))
            .map(|key| KeyDescription {
                uuid: key.uuid,
                provider_name: key.provider.name().to_string(),
                provider_type: key.provider.provider_type(),
                key_name: key.key_name.clone(),
                active: key.uuid == registry.active.uuid,
            })
            .collect()
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::config::{EncryptionConfiguration, ProviderConfig};
    use crate::logic::canary::EncryptionKeyCanary;
    use crate::logic::key_proxy::SoftwareKey;
    use crate::logic::provider::InternalEncryptionProvider;
    use crate::repository::{EncryptionKeyCanaryRepositoryLike, Repository};
    use crate::test_support::{internal_key, mapper_for, repository};
    use shared::error::CommonError;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Canary storage that can be switched into failing every lookup.
    struct UnreliableCanaryRepository {
        inner: Arc<Repository>,
        failing: AtomicBool,
    }

    #[async_trait::async_trait]
    impl EncryptionKeyCanaryRepositoryLike for UnreliableCanaryRepository {
        async fn find_all_canaries(&self) -> Result<Vec<EncryptionKeyCanary>, CommonError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(CommonError::Repository {
                    msg: "database is locked".to_string(),
                    source: None,
                });
            }
            self.inner.find_all_canaries().await
        }

        async fn save_canary(
            &self,
            canary: &EncryptionKeyCanary,
        ) -> Result<EncryptionKeyCanary, CommonError> {
            self.inner.save_canary(canary).await
        }

        async fn delete_canaries(&self, uuids: &[Uuid]) -> Result<u64, CommonError> {
            self.inner.delete_canaries(uuids).await
        }
    }

    fn key(provider: &Arc<EncryptionProvider>, uuid: Uuid, name: &str) -> EncryptionKey {
        EncryptionKey {
            uuid,
            provider: provider.clone(),
            key: KeyHandle::Software(SoftwareKey::generate()),
            key_name: name.to_string(),
        }
    }

    fn provider() -> Arc<EncryptionProvider> {
        Arc::new(EncryptionProvider::Internal(InternalEncryptionProvider::new(
            "internal", true,
        )))
    }

    #[test]
    fn test_registry_requires_one_active_key() {
        let provider = provider();

        let none = KeyRegistry::new(vec![(key(&provider, Uuid::new_v4(), "k1"), false)]);
        assert!(matches!(none, Err(EncryptionError::NoActiveKey)));

        let empty = KeyRegistry::new(vec![]);
        assert!(matches!(empty, Err(EncryptionError::NoActiveKey)));

        let two = KeyRegistry::new(vec![
            (key(&provider, Uuid::new_v4(), "k1"), true),
            (key(&provider, Uuid::new_v4(), "k2"), true),
        ]);
        assert!(matches!(
            two,
            Err(EncryptionError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_registry_lookup() {
        let provider = provider();
        let active = Uuid::new_v4();
        let inactive = Uuid::new_v4();

        let registry = KeyRegistry::new(vec![
            (key(&provider, inactive, "old"), false),
            (key(&provider, active, "new"), true),
        ])
        .unwrap();

        assert_eq!(registry.active().uuid, active);
        assert_eq!(registry.uuids(), vec![inactive, active]);
        assert_eq!(registry.get(&inactive).unwrap().key_name, "old");
        assert!(registry.get(&Uuid::new_v4()).is_none());
        assert_eq!(registry.generation(), 0);
    }

    #[test]
    fn test_duplicate_canary_prefers_active_key() {
        let provider = provider();
        let shared_uuid = Uuid::new_v4();

        let registry = KeyRegistry::new(vec![
            (key(&provider, shared_uuid, "inactive-alias"), false),
            (key(&provider, shared_uuid, "active"), true),
        ])
        .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&shared_uuid).unwrap().key_name, "active");
    }

    #[tokio::test]
    async fn test_key_encrypt_tags_value_with_uuid() {
        shared::setup_test!();

        let provider = provider();
        let uuid = Uuid::new_v4();
        let key = key(&provider, uuid, "k1");

        let value = key.encrypt(b"hello world").await.unwrap();
        assert_eq!(value.encryption_key_uuid, uuid);
        assert_eq!(key.decrypt(&value).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_registry() {
        shared::setup_test!();

        let (_db, repo) = repository().await;
        let canaries = Arc::new(UnreliableCanaryRepository {
            inner: repo,
            failing: AtomicBool::new(false),
        });
        let config = EncryptionConfiguration::new(vec![
            ProviderConfig::internal("internal", vec![internal_key("k1", "correct-horse", true)])
                .with_key_creation(true),
        ]);
        let key_set = EncryptionKeySet::initialize(Arc::new(mapper_for(config, canaries.clone())))
            .await
            .unwrap();
        let active = key_set.get_active_uuid();
        let value = key_set.get_active().encrypt(b"hello world").await.unwrap();

        canaries.failing.store(true, Ordering::SeqCst);
        let err = key_set.reload().await.unwrap_err();
        assert!(matches!(err, EncryptionError::Repository(_)));

        // still serving from the previous snapshot
        assert_eq!(key_set.generation(), 0);
        assert_eq!(key_set.get_active_uuid(), active);
        assert_eq!(key_set.get_uuids(), vec![active]);
        let key = key_set.get(&active).unwrap();
        assert_eq!(key.decrypt(&value).await.unwrap(), b"hello world");

        canaries.failing.store(false, Ordering::SeqCst);
        key_set.reload().await.unwrap();
        assert_eq!(key_set.generation(), 1);
        assert_eq!(key_set.get_active_uuid(), active);
    }
}
