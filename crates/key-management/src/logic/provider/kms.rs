// Remote KMS encryption provider
// Encrypt/decrypt are delegated to an out-of-process key service; no key material is local

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::error::EncryptionError;

use super::Ciphertext;

#[derive(Error, Debug)]
pub enum KmsError {
    /// The service rejected the ciphertext or key, e.g. data encrypted under another key.
    #[error("kms rejected the request: {0}")]
    InvalidArgument(String),
    #[error("kms request failed: {msg}")]
    Unavailable {
        msg: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

impl From<KmsError> for EncryptionError {
    fn from(value: KmsError) -> Self {
        match value {
            KmsError::InvalidArgument(_) => EncryptionError::AuthFailure {
                msg: "kms rejected the ciphertext".to_string(),
                source: Some(value.into()),
            },
            KmsError::Unavailable { .. } => {
                EncryptionError::transient("kms request failed", Some(value.into()))
            }
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait KmsClient: Send + Sync {
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsError>;
    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError>;
}

/// [`KmsClient`] backed by AWS KMS.
pub struct AwsKmsClient {
    client: aws_sdk_kms::Client,
}

impl AwsKmsClient {
    /// Credentials and defaults come from the environment; `region` and
    /// `endpoint_url` override them when set.
    pub async fn connect(region: Option<&str>, endpoint_url: Option<&str>) -> Self {
        let config = aws_config::load_from_env().await;
        let mut builder = config.to_builder();
        if let Some(region) = region {
            builder = builder.region(aws_config::Region::new(region.to_string()));
        }
        if let Some(endpoint_url) = endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }
        let config = builder.build();

        Self {
            client: aws_sdk_kms::Client::new(&config),
        }
    }
}

#[async_trait::async_trait]
impl KmsClient for AwsKmsClient {
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        let output = self
            .client
            .encrypt()
            .key_id(key_id)
            .plaintext(aws_sdk_kms::primitives::Blob::new(plaintext))
            .send()
            .await
            .map_err(|e| KmsError::Unavailable {
                msg: format!("encrypt with key {key_id} failed"),
                source: Some(anyhow::anyhow!(
                    "{}",
                    aws_sdk_kms::error::DisplayErrorContext(&e)
                )),
            })?;

        let ciphertext_blob = output.ciphertext_blob().ok_or_else(|| KmsError::Unavailable {
            msg: "AWS KMS encrypt response did not contain ciphertext blob".to_string(),
            source: None,
        })?;

        Ok(ciphertext_blob.as_ref().to_vec())
    }

    async fn decrypt(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        let output = self
            .client
            .decrypt()
            .key_id(key_id)
            .ciphertext_blob(aws_sdk_kms::primitives::Blob::new(ciphertext))
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(service_error)
                    if service_error.is_invalid_ciphertext_exception()
                        || service_error.is_incorrect_key_exception() =>
                {
                    KmsError::InvalidArgument(service_error.to_string())
                }
                _ => KmsError::Unavailable {
                    msg: format!("decrypt with key {key_id} failed"),
                    source: Some(anyhow::anyhow!(
                        "{}",
                        aws_sdk_kms::error::DisplayErrorContext(&e)
                    )),
                },
            })?;

        let plaintext = output.plaintext().ok_or_else(|| KmsError::Unavailable {
            msg: "AWS KMS decrypt response did not contain plaintext".to_string(),
            source: None,
        })?;

        Ok(plaintext.as_ref().to_vec())
    }
}

pub struct KmsEncryptionProvider {
    name: String,
    key_creation_enabled: bool,
    client: Arc<dyn KmsClient>,
}

impl KmsEncryptionProvider {
    pub fn new(
        name: impl Into<String>,
        key_creation_enabled: bool,
        client: Arc<dyn KmsClient>,
    ) -> Self {
        let name = name.into();
        info!("using kms provider '{}'", name);
        Self {
            name,
            key_creation_enabled,
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_creation_enabled(&self) -> bool {
        self.key_creation_enabled
    }

    /// The service embeds its own IV in the ciphertext, so the nonce is empty.
    pub async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Ciphertext, EncryptionError> {
        let encrypted_value = self.client.encrypt(key_id, plaintext).await?;
        Ok(Ciphertext {
            encrypted_value,
            nonce: Vec::new(),
        })
    }

    pub async fn decrypt(&self, key_id: &str, encrypted_value: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        Ok(self.client.decrypt(key_id, encrypted_value).await?)
    }
}
