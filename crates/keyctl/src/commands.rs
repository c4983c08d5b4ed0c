use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::Args;
use key_management::config::EncryptionConfiguration;
use key_management::logic::canary_mapper::EncryptionKeyCanaryMapper;
use key_management::logic::detector::check_decryptable_data;
use key_management::logic::encrypted_value::EncryptedValue;
use key_management::logic::key_set::EncryptionKeySet;
use key_management::logic::provider::EncryptionProviderFactory;
use key_management::logic::retrying::RetryingEncryptionService;
use key_management::logic::rotator::EncryptionKeyRotator;
use key_management::repository::Repository;
use serde::Serialize;
use shared::error::CommonError;
use shared::libsql::establish_db_connection;
use shared::primitives::SqlMigrationLoader;
use tracing::info;
use url::Url;
use uuid::Uuid;

pub const DEFAULT_DATABASE_URL: &str = "libsql://./keyctl.db?mode=local";

#[derive(Args, Debug, Clone)]
pub struct DecryptParams {
    /// UUID of the key the value was encrypted under
    #[arg(long)]
    pub key_uuid: Uuid,
    /// Base64 ciphertext
    #[arg(long)]
    pub encrypted_value: String,
    /// Base64 nonce; empty for KMS values
    #[arg(long, default_value = "")]
    pub nonce: String,
}

#[derive(Debug, Serialize)]
struct EncryptedValueOutput {
    key_uuid: Uuid,
    encrypted_value: String,
    nonce: String,
}

/// Everything a command needs: the database, the key set built from the
/// configuration, and the services over it.
pub struct KeyManagementContext {
    _db: libsql::Database,
    config: EncryptionConfiguration,
    repository: Arc<Repository>,
    encryption_service: Arc<RetryingEncryptionService>,
}

impl KeyManagementContext {
    pub async fn load(config_path: &Path, database_url: Option<&str>) -> Result<Self, CommonError> {
        info!(
            "loading encryption configuration from {}",
            config_path.display()
        );
        let config = EncryptionConfiguration::from_file(config_path)?;

        let database_url = database_url
            .map(str::to_string)
            .or_else(|| config.database_url.clone())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let database_url = Url::parse(&database_url)?;
        let (db, conn) =
            establish_db_connection(&database_url, Some(Repository::load_sql_migrations())).await?;
        let repository = Arc::new(Repository::new(conn));

        let factory = Arc::new(EncryptionProviderFactory::new(config.bootstrap.clone()));
        let mapper = Arc::new(EncryptionKeyCanaryMapper::new(
            config.clone(),
            factory,
            repository.clone(),
        ));
        let key_set = Arc::new(EncryptionKeySet::initialize(mapper).await?);

        Ok(Self {
            _db: db,
            config,
            repository,
            encryption_service: Arc::new(RetryingEncryptionService::new(key_set)),
        })
    }

    fn key_set(&self) -> &Arc<EncryptionKeySet> {
        self.encryption_service.key_set()
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CommonError> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>, CommonError> {
    STANDARD
        .decode(value)
        .map_err(|e| CommonError::InvalidRequest {
            msg: format!("{field} is not valid base64"),
            source: Some(e.into()),
        })
}

pub fn cmd_keys(ctx: &KeyManagementContext) -> Result<(), CommonError> {
    for key in ctx.key_set().describe() {
        print_json(&key)?;
    }
    Ok(())
}

pub async fn cmd_check(ctx: &KeyManagementContext) -> Result<(), CommonError> {
    let report = check_decryptable_data(ctx.key_set(), ctx.repository.as_ref()).await?;
    print_json(&report)
}

pub async fn cmd_encrypt(ctx: &KeyManagementContext, plaintext: &str) -> Result<(), CommonError> {
    let value = ctx.encryption_service.encrypt(plaintext).await?;
    print_json(&EncryptedValueOutput {
        key_uuid: value.encryption_key_uuid,
        encrypted_value: STANDARD.encode(&value.encrypted_value),
        nonce: STANDARD.encode(&value.nonce),
    })
}

pub async fn cmd_decrypt(ctx: &KeyManagementContext, params: DecryptParams) -> Result<(), CommonError> {
    let value = EncryptedValue {
        encryption_key_uuid: params.key_uuid,
        encrypted_value: decode_base64("encrypted_value", &params.encrypted_value)?,
        nonce: decode_base64("nonce", &params.nonce)?,
    };
    let plaintext = ctx.encryption_service.decrypt(&value).await?;
    println!("{plaintext}");
    Ok(())
}

pub async fn cmd_rotate(ctx: &KeyManagementContext, page_size: Option<u32>) -> Result<(), CommonError> {
    let rotator = Arc::new(EncryptionKeyRotator::new(
        ctx.encryption_service.clone(),
        ctx.repository.clone(),
        page_size.unwrap_or(ctx.config.rotation.page_size),
    ));
    let summary = rotator.spawn().await??;
    print_json(&summary)
}
