use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::config::{BootstrapConfig, ProviderConfig, ProviderType};
use crate::error::EncryptionError;

use super::{
    AwsKmsClient, EncryptionProvider, HsmClient, HsmEncryptionProvider,
    InternalEncryptionProvider, KmsClient, KmsEncryptionProvider,
};

/// Builds providers from configuration, one instance per provider name, so every key
/// under a named provider shares its session or client.
pub struct EncryptionProviderFactory {
    bootstrap: BootstrapConfig,
    providers: DashMap<String, Arc<EncryptionProvider>>,
    hsm_clients: DashMap<String, Arc<dyn HsmClient>>,
    kms_clients: DashMap<String, Arc<dyn KmsClient>>,
}

impl EncryptionProviderFactory {
    pub fn new(bootstrap: BootstrapConfig) -> Self {
        Self {
            bootstrap,
            providers: DashMap::new(),
            hsm_clients: DashMap::new(),
            kms_clients: DashMap::new(),
        }
    }

    /// Session used by the HSM provider named `provider_name`.
    pub fn with_hsm_client(self, provider_name: impl Into<String>, client: Arc<dyn HsmClient>) -> Self {
        self.hsm_clients.insert(provider_name.into(), client);
        self
    }

    /// Client used by the KMS provider named `provider_name` instead of AWS KMS.
    pub fn with_kms_client(self, provider_name: impl Into<String>, client: Arc<dyn KmsClient>) -> Self {
        self.kms_clients.insert(provider_name.into(), client);
        self
    }

    pub fn get(&self, provider_name: &str) -> Option<Arc<EncryptionProvider>> {
        self.providers
            .get(provider_name)
            .map(|entry| entry.value().clone())
    }

    pub async fn get_encryption_provider(
        &self,
        config: &ProviderConfig,
    ) -> Result<Arc<EncryptionProvider>, EncryptionError> {
        if let Some(provider) = self.get(&config.name) {
            return Ok(provider);
        }

        let provider = Arc::new(self.build(config).await?);
        // another caller may have built the same provider meanwhile; the first one wins
        let provider = self
            .providers
            .entry(config.name.clone())
            .or_insert(provider)
            .value()
            .clone();
        Ok(provider)
    }

    async fn build(&self, config: &ProviderConfig) -> Result<EncryptionProvider, EncryptionError> {
        info!(
            "creating {} encryption provider '{}'",
            config.provider_type, config.name
        );

        match config.provider_type {
            ProviderType::Internal => Ok(EncryptionProvider::Internal(
                InternalEncryptionProvider::new(&config.name, config.key_creation_enabled),
            )),
            ProviderType::Hsm => {
                let client = self
                    .hsm_clients
                    .get(&config.name)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| {
                        EncryptionError::invalid_configuration(format!(
                            "no hsm client registered for provider '{}'",
                            config.name
                        ))
                    })?;
                let provider = HsmEncryptionProvider::connect(
                    &config.name,
                    config.key_creation_enabled,
                    client,
                    config.hsm_connection(),
                    self.bootstrap.clone(),
                )
                .await?;
                Ok(EncryptionProvider::Hsm(provider))
            }
            ProviderType::Kms => {
                let registered = self
                    .kms_clients
                    .get(&config.name)
                    .map(|entry| entry.value().clone());
                let client: Arc<dyn KmsClient> = match registered {
                    Some(client) => client,
                    None => Arc::new(
                        AwsKmsClient::connect(
                            config.region.as_deref(),
                            config.endpoint_url.as_deref(),
                        )
                        .await,
                    ),
                };
                Ok(EncryptionProvider::Kms(KmsEncryptionProvider::new(
                    &config.name,
                    config.key_creation_enabled,
                    client,
                )))
            }
        }
    }
}
