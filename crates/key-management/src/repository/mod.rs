mod sqlite;

pub use sqlite::Repository;

use shared::error::CommonError;
use uuid::Uuid;

use crate::logic::canary::EncryptionKeyCanary;
use crate::logic::encrypted_value::EncryptedValueRecord;

// Repository trait for encryption key canaries
#[async_trait::async_trait]
pub trait EncryptionKeyCanaryRepositoryLike: Send + Sync {
    /// All canaries, oldest first. Ties are broken by UUID.
    async fn find_all_canaries(&self) -> Result<Vec<EncryptionKeyCanary>, CommonError>;

    async fn save_canary(
        &self,
        canary: &EncryptionKeyCanary,
    ) -> Result<EncryptionKeyCanary, CommonError>;

    /// Returns the number of canaries removed.
    async fn delete_canaries(&self, uuids: &[Uuid]) -> Result<u64, CommonError>;
}

// Repository trait for values encrypted under a canary's key
#[async_trait::async_trait]
pub trait EncryptedValueRepositoryLike: Send + Sync {
    async fn create_encrypted_value(&self, record: &EncryptedValueRecord)
    -> Result<(), CommonError>;

    async fn get_encrypted_value(
        &self,
        uuid: &Uuid,
    ) -> Result<Option<EncryptedValueRecord>, CommonError>;

    /// Values whose key is not one of `key_uuids`. An empty list counts everything.
    async fn count_by_key_not_in(&self, key_uuids: &[Uuid]) -> Result<i64, CommonError>;

    /// Values whose key is one of `key_uuids`. An empty list counts nothing.
    async fn count_by_key_in(&self, key_uuids: &[Uuid]) -> Result<i64, CommonError>;

    /// Up to `page_size` values whose key is not one of `key_uuids`, ordered by record
    /// UUID and starting after `after`.
    async fn find_page_by_key_not_in(
        &self,
        key_uuids: &[Uuid],
        after: Option<Uuid>,
        page_size: u32,
    ) -> Result<Vec<EncryptedValueRecord>, CommonError>;

    /// Insert or overwrite the record with the same UUID.
    async fn save_and_flush(&self, record: &EncryptedValueRecord) -> Result<(), CommonError>;
}
