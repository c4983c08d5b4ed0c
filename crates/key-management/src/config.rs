// Encryption key configuration
// Providers, their connection settings and key definitions, loaded from YAML

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared::error::CommonError;

use crate::error::EncryptionError;
use crate::logic::provider::HsmConnection;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_ROTATION_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Internal,
    Hsm,
    Kms,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Internal => "internal",
            ProviderType::Hsm => "hsm",
            ProviderType::Kms => "kms",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured key under a provider.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyDefinition {
    pub name: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub active: bool,
}

impl std::fmt::Debug for KeyDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDefinition")
            .field("name", &self.name)
            .field("password", &self.password.as_ref().map(|_| "************"))
            .field("active", &self.active)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    #[serde(default)]
    pub key_creation_enabled: bool,

    // hsm
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default, skip_serializing)]
    pub partition_password: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,

    // kms
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,

    #[serde(default)]
    pub keys: Vec<KeyDefinition>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("provider_type", &self.provider_type)
            .field("key_creation_enabled", &self.key_creation_enabled)
            .field("partition", &self.partition)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("keys", &self.keys)
            .finish()
    }
}

impl ProviderConfig {
    pub fn internal(name: impl Into<String>, keys: Vec<KeyDefinition>) -> Self {
        Self::new(name, ProviderType::Internal, keys)
    }

    pub fn new(name: impl Into<String>, provider_type: ProviderType, keys: Vec<KeyDefinition>) -> Self {
        Self {
            name: name.into(),
            provider_type,
            key_creation_enabled: false,
            partition: None,
            partition_password: None,
            host: None,
            port: None,
            region: None,
            endpoint_url: None,
            keys,
        }
    }

    pub fn with_key_creation(mut self, enabled: bool) -> Self {
        self.key_creation_enabled = enabled;
        self
    }

    /// Session settings handed to the HSM client on login.
    pub fn hsm_connection(&self) -> HsmConnection {
        HsmConnection {
            partition: self.partition.clone(),
            partition_password: self.partition_password.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_bootstrap_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
        }
    }
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_bootstrap_timeout() -> Duration {
    DEFAULT_BOOTSTRAP_TIMEOUT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_ROTATION_PAGE_SIZE,
        }
    }
}

fn default_page_size() -> u32 {
    DEFAULT_ROTATION_PAGE_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfiguration {
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    pub providers: Vec<ProviderConfig>,
}

impl EncryptionConfiguration {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self {
            database_url: None,
            bootstrap: BootstrapConfig::default(),
            rotation: RotationConfig::default(),
            providers,
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, CommonError> {
        let config: EncryptionConfiguration = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, CommonError> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EncryptionError> {
        if self.providers.is_empty() {
            return Err(EncryptionError::invalid_configuration(
                "at least one encryption provider must be configured",
            ));
        }

        let mut names = HashSet::new();
        let mut active_keys = Vec::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(EncryptionError::invalid_configuration(
                    "provider names must not be empty",
                ));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(EncryptionError::invalid_configuration(format!(
                    "provider name '{}' is used more than once",
                    provider.name
                )));
            }

            if provider.provider_type == ProviderType::Hsm
                && provider.partition.as_deref().is_none_or(|p| p.trim().is_empty())
            {
                return Err(EncryptionError::invalid_configuration(format!(
                    "hsm provider '{}' requires a partition",
                    provider.name
                )));
            }

            for key in &provider.keys {
                if key.name.trim().is_empty() {
                    return Err(EncryptionError::invalid_configuration(format!(
                        "provider '{}' has a key with an empty name",
                        provider.name
                    )));
                }

                let has_password = key.password.as_ref().is_some_and(|p| !p.is_empty());
                match provider.provider_type {
                    ProviderType::Internal if !has_password => {
                        return Err(EncryptionError::invalid_configuration(format!(
                            "internal key '{}' requires a password",
                            key.name
                        )));
                    }
                    ProviderType::Hsm | ProviderType::Kms if key.password.is_some() => {
                        return Err(EncryptionError::invalid_configuration(format!(
                            "{} key '{}' must not carry a password",
                            provider.provider_type, key.name
                        )));
                    }
                    _ => {}
                }

                if key.active {
                    active_keys.push(format!("{}/{}", provider.name, key.name));
                }
            }
        }

        match active_keys.len() {
            0 => return Err(EncryptionError::NoActiveKey),
            1 => {}
            _ => {
                return Err(EncryptionError::invalid_configuration(format!(
                    "exactly one key may be active, found {}: {}",
                    active_keys.len(),
                    active_keys.join(", ")
                )));
            }
        }

        if self.rotation.page_size == 0 {
            return Err(EncryptionError::invalid_configuration(
                "rotation.page_size must be greater than zero",
            ));
        }

        if self.bootstrap.poll_interval.is_zero() {
            return Err(EncryptionError::invalid_configuration(
                "bootstrap.poll_interval must be greater than zero",
            ));
        }
        if self.bootstrap.poll_interval > self.bootstrap.timeout {
            return Err(EncryptionError::invalid_configuration(
                "bootstrap.poll_interval must not exceed bootstrap.timeout",
            ));
        }

        Ok(())
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(serde::de::Error::custom)
    }
}
