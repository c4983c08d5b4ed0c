// Canary mapper
// Reconciles configured keys with persisted canaries and produces the key registry

use std::sync::Arc;

use shared::primitives::WrappedChronoDateTime;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{EncryptionConfiguration, KeyDefinition, ProviderConfig};
use crate::error::EncryptionError;
use crate::logic::canary::{CANARY_VALUE, EncryptionKeyCanary};
use crate::logic::key_proxy::KeyProxy;
use crate::logic::key_set::{EncryptionKey, KeyRegistry};
use crate::logic::provider::EncryptionProviderFactory;
use crate::repository::EncryptionKeyCanaryRepositoryLike;

pub struct EncryptionKeyCanaryMapper {
    config: EncryptionConfiguration,
    factory: Arc<EncryptionProviderFactory>,
    repository: Arc<dyn EncryptionKeyCanaryRepositoryLike>,
}

impl EncryptionKeyCanaryMapper {
    pub fn new(
        config: EncryptionConfiguration,
        factory: Arc<EncryptionProviderFactory>,
        repository: Arc<dyn EncryptionKeyCanaryRepositoryLike>,
    ) -> Self {
        Self {
            config,
            factory,
            repository,
        }
    }

    pub fn config(&self) -> &EncryptionConfiguration {
        &self.config
    }

    pub fn factory(&self) -> &Arc<EncryptionProviderFactory> {
        &self.factory
    }

    /// Bind every configured key to the canary it decrypts, creating or waiting for
    /// a canary for the active key when none matches. Inactive keys without a
    /// canary are left out.
    pub async fn map_uuids_to_keys(&self) -> Result<KeyRegistry, EncryptionError> {
        let mut canaries = self.repository.find_all_canaries().await?;
        debug!("found {} existing canaries", canaries.len());

        let mut bound = Vec::new();
        for provider_config in &self.config.providers {
            let provider = self.factory.get_encryption_provider(provider_config).await?;

            for definition in &provider_config.keys {
                let mut proxy = provider.create_key_proxy(definition).await?;

                let uuid = match find_matching_canary(&mut proxy, &canaries).await? {
                    Some(uuid) => uuid,
                    None if !definition.active => {
                        debug!(
                            "inactive key '{}' of provider '{}' has no canary, skipping",
                            definition.name, provider_config.name
                        );
                        continue;
                    }
                    None if provider.key_creation_enabled() => {
                        let canary = self.create_canary(&mut proxy).await?;
                        let uuid = canary.uuid;
                        canaries.push(canary);
                        uuid
                    }
                    None => {
                        let (uuid, refreshed) = self
                            .wait_for_peer_canary(&mut proxy, provider_config, definition)
                            .await?;
                        canaries = refreshed;
                        uuid
                    }
                };

                let key = proxy.get_key().await?.ok_or_else(|| {
                    EncryptionError::fatal(format!(
                        "key '{}' of provider '{}' matched canary {} but has no key material",
                        definition.name, provider_config.name, uuid
                    ))
                })?;

                debug!(
                    "bound key '{}' of provider '{}' to canary {}",
                    definition.name, provider_config.name, uuid
                );
                bound.push((
                    EncryptionKey {
                        uuid,
                        provider: provider.clone(),
                        key,
                        key_name: definition.name.clone(),
                    },
                    definition.active,
                ));
            }
        }

        KeyRegistry::new(bound)
    }

    /// Remove canaries, typically once rotation has moved every value off their keys.
    pub async fn delete(&self, uuids: &[Uuid]) -> Result<u64, EncryptionError> {
        if uuids.is_empty() {
            return Ok(0);
        }

        let deleted = self.repository.delete_canaries(uuids).await?;
        info!("deleted {} encryption key canaries", deleted);
        Ok(deleted)
    }

    async fn create_canary(
        &self,
        proxy: &mut KeyProxy,
    ) -> Result<EncryptionKeyCanary, EncryptionError> {
        let key = proxy.get_key().await?.ok_or_else(|| {
            EncryptionError::fatal(format!(
                "cannot create a canary for key '{}' without key material",
                proxy.key_name()
            ))
        })?;
        let ciphertext = proxy.provider().encrypt(&key, &CANARY_VALUE).await?;

        let canary = EncryptionKeyCanary {
            uuid: Uuid::new_v4(),
            encrypted_canary_value: ciphertext.encrypted_value,
            nonce: ciphertext.nonce,
            salt: proxy.salt().to_vec(),
            created_at: WrappedChronoDateTime::now(),
        };
        let canary = self.repository.save_canary(&canary).await?;

        info!(
            "created canary {} for key '{}' of provider '{}'",
            canary.uuid,
            proxy.key_name(),
            proxy.provider().name()
        );
        Ok(canary)
    }

    /// Another process owns key creation; poll until its canary shows up.
    async fn wait_for_peer_canary(
        &self,
        proxy: &mut KeyProxy,
        provider_config: &ProviderConfig,
        definition: &KeyDefinition,
    ) -> Result<(Uuid, Vec<EncryptionKeyCanary>), EncryptionError> {
        let bootstrap = &self.config.bootstrap;
        info!(
            "waiting for a canary for active key '{}' of provider '{}'",
            definition.name, provider_config.name
        );

        let started = Instant::now();
        let deadline = started + bootstrap.timeout;
        loop {
            tokio::time::sleep(bootstrap.poll_interval).await;

            let canaries = self.repository.find_all_canaries().await?;
            if let Some(uuid) = find_matching_canary(proxy, &canaries).await? {
                info!("found canary {} for key '{}'", uuid, definition.name);
                return Ok((uuid, canaries));
            }

            if Instant::now() >= deadline {
                return Err(EncryptionError::BootstrapTimeout {
                    what: format!(
                        "a canary for key '{}' of provider '{}'",
                        definition.name, provider_config.name
                    ),
                    waited: started.elapsed(),
                });
            }
            debug!("no canary for key '{}' yet", definition.name);
        }
    }
}

/// First canary in list order that the proxy's key decrypts.
async fn find_matching_canary(
    proxy: &mut KeyProxy,
    canaries: &[EncryptionKeyCanary],
) -> Result<Option<Uuid>, EncryptionError> {
    for canary in canaries {
        if proxy.matches_canary(canary).await? {
            return Ok(Some(canary.uuid));
        }
    }
    Ok(None)
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::config::{BootstrapConfig, ProviderType};
    use crate::logic::provider::SoftwareHsmClient;
    use crate::logic::provider::kms::{KmsError, MockKmsClient};
    use crate::test_support::{internal_key, mapper_for, repository};
    use mockall::predicate::eq;
    use std::time::Duration;

    fn kms_key(active: bool) -> KeyDefinition {
        KeyDefinition {
            name: "alias/credhub".to_string(),
            password: None,
            active,
        }
    }

    #[tokio::test]
    async fn test_creates_canary_for_new_active_key() {
        shared::setup_test!();

        let (_db, repo) = repository().await;
        let config = EncryptionConfiguration::new(vec![
            ProviderConfig::internal("internal", vec![internal_key("k1", "correct-horse", true)])
                .with_key_creation(true),
        ]);
        let mapper = mapper_for(config, repo.clone());

        let registry = mapper.map_uuids_to_keys().await.unwrap();
        let canaries = repo.find_all_canaries().await.unwrap();
        assert_eq!(canaries.len(), 1);
        assert_eq!(registry.active().uuid, canaries[0].uuid);
        assert_eq!(registry.uuids(), vec![canaries[0].uuid]);

        // a second pass binds to the stored canary instead of creating another
        let again = mapper.map_uuids_to_keys().await.unwrap();
        assert_eq!(again.active().uuid, canaries[0].uuid);
        assert_eq!(repo.find_all_canaries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_inactive_key_without_canary_is_skipped() {
        shared::setup_test!();

        let (_db, repo) = repository().await;
        let config = EncryptionConfiguration::new(vec![
            ProviderConfig::internal(
                "internal",
                vec![
                    internal_key("old", "battery-staple", false),
                    internal_key("new", "correct-horse", true),
                ],
            )
            .with_key_creation(true),
        ]);
        let mapper = mapper_for(config, repo.clone());

        let registry = mapper.map_uuids_to_keys().await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.active().key_name, "new");
        assert_eq!(repo.find_all_canaries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rebinds_previous_key_after_activation_change() {
        shared::setup_test!();

        let (_db, repo) = repository().await;
        let first = mapper_for(
            EncryptionConfiguration::new(vec![
                ProviderConfig::internal("internal", vec![internal_key("k1", "correct-horse", true)])
                    .with_key_creation(true),
            ]),
            repo.clone(),
        );
        let k1_uuid = first.map_uuids_to_keys().await.unwrap().active().uuid;

        let second = mapper_for(
            EncryptionConfiguration::new(vec![
                ProviderConfig::internal(
                    "internal",
                    vec![
                        internal_key("k1", "correct-horse", false),
                        internal_key("k2", "battery-staple", true),
                    ],
                )
                .with_key_creation(true),
            ]),
            repo.clone(),
        );
        let registry = second.map_uuids_to_keys().await.unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(&k1_uuid).unwrap().key_name, "k1");
        assert_ne!(registry.active().uuid, k1_uuid);
        assert_eq!(registry.active().key_name, "k2");
    }

    #[tokio::test]
    async fn test_waits_for_peer_canary_when_creation_disabled() {
        shared::setup_test!();

        let (_db, repo) = repository().await;
        let mut config = EncryptionConfiguration::new(vec![ProviderConfig::internal(
            "internal",
            vec![internal_key("k1", "correct-horse", true)],
        )]);
        config.bootstrap = BootstrapConfig {
            poll_interval: Duration::from_millis(20),
            timeout: Duration::from_secs(30),
        };
        let waiting = mapper_for(config, repo.clone());

        let peer = mapper_for(
            EncryptionConfiguration::new(vec![
                ProviderConfig::internal("internal", vec![internal_key("k1", "correct-horse", true)])
                    .with_key_creation(true),
            ]),
            repo.clone(),
        );

        let waiter = tokio::spawn(async move { waiting.map_uuids_to_keys().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let created = peer.map_uuids_to_keys().await.unwrap().active().uuid;

        let registry = waiter.await.unwrap().unwrap();
        assert_eq!(registry.active().uuid, created);
        assert_eq!(repo.find_all_canaries().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_times_out_without_peer() {
        shared::setup_test!();

        let (_db, repo) = repository().await;
        let mut config = EncryptionConfiguration::new(vec![ProviderConfig::internal(
            "internal",
            vec![internal_key("k1", "correct-horse", true)],
        )]);
        config.bootstrap = BootstrapConfig {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        };
        let mapper = mapper_for(config, repo);

        let err = mapper.map_uuids_to_keys().await.unwrap_err();
        match err {
            EncryptionError::BootstrapTimeout { waited, .. } => {
                assert!(waited >= Duration::from_secs(10));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hsm_keys_bind_through_shared_session() {
        shared::setup_test!();

        let (_db, repo) = repository().await;
        let client = Arc::new(SoftwareHsmClient::new());
        let factory = Arc::new(
            EncryptionProviderFactory::new(BootstrapConfig::default())
                .with_hsm_client("luna", client.clone()),
        );
        let config = EncryptionConfiguration::new(vec![
            ProviderConfig::new(
                "luna",
                ProviderType::Hsm,
                vec![
                    KeyDefinition {
                        name: "hsm-old".to_string(),
                        password: None,
                        active: false,
                    },
                    KeyDefinition {
                        name: "hsm-new".to_string(),
                        password: None,
                        active: true,
                    },
                ],
            )
            .with_key_creation(true),
        ]);
        let mapper = EncryptionKeyCanaryMapper::new(config, factory, repo.clone());

        let registry = mapper.map_uuids_to_keys().await.unwrap();
        // the generated inactive key has no canary yet
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.active().key_name, "hsm-new");
        assert_eq!(client.login_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_canaries() {
        shared::setup_test!();

        let (_db, repo) = repository().await;
        let mapper = mapper_for(
            EncryptionConfiguration::new(vec![
                ProviderConfig::internal("internal", vec![internal_key("k1", "correct-horse", true)])
                    .with_key_creation(true),
            ]),
            repo.clone(),
        );
        let uuid = mapper.map_uuids_to_keys().await.unwrap().active().uuid;

        assert_eq!(mapper.delete(&[]).await.unwrap(), 0);
        assert_eq!(mapper.delete(&[uuid]).await.unwrap(), 1);
        assert!(repo.find_all_canaries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_internal_and_kms_keys_coexist() {
        shared::setup_test!();

        let (_db, repo) = repository().await;

        let mut creating = MockKmsClient::new();
        creating
            .expect_encrypt()
            .times(1)
            .returning(|_, _| Ok(b"kms-canary".to_vec()));
        creating.expect_decrypt().returning(|_, _| {
            Err(KmsError::InvalidArgument("InvalidCiphertextException".to_string()))
        });
        let first = EncryptionKeyCanaryMapper::new(
            EncryptionConfiguration::new(vec![
                ProviderConfig::new("aws", ProviderType::Kms, vec![kms_key(true)])
                    .with_key_creation(true),
            ]),
            Arc::new(
                EncryptionProviderFactory::new(BootstrapConfig::default())
                    .with_kms_client("aws", Arc::new(creating)),
            ),
            repo.clone(),
        );
        let kms_uuid = first.map_uuids_to_keys().await.unwrap().active().uuid;
        assert!(repo.find_all_canaries().await.unwrap()[0].nonce.is_empty());

        // the internal key now takes over; the kms canary must not trip it up
        let mut reading = MockKmsClient::new();
        reading.expect_encrypt().never();
        reading
            .expect_decrypt()
            .with(eq("alias/credhub"), eq(b"kms-canary".as_slice()))
            .returning(|_, _| Ok(CANARY_VALUE.to_vec()));
        let second = EncryptionKeyCanaryMapper::new(
            EncryptionConfiguration::new(vec![
                ProviderConfig::internal("internal", vec![internal_key("k1", "correct-horse", true)])
                    .with_key_creation(true),
                ProviderConfig::new("aws", ProviderType::Kms, vec![kms_key(false)]),
            ]),
            Arc::new(
                EncryptionProviderFactory::new(BootstrapConfig::default())
                    .with_kms_client("aws", Arc::new(reading)),
            ),
            repo.clone(),
        );

        let registry = second.map_uuids_to_keys().await.unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.active().key_name, "k1");
        assert_ne!(registry.active().uuid, kms_uuid);
        assert_eq!(registry.get(&kms_uuid).unwrap().key_name, "alias/credhub");
        assert_eq!(repo.find_all_canaries().await.unwrap().len(), 2);

        // and a restart binds both keys without creating anything new
        let again = second.map_uuids_to_keys().await.unwrap();
        assert_eq!(again.active().uuid, registry.active().uuid);
        assert_eq!(repo.find_all_canaries().await.unwrap().len(), 2);
    }
}
