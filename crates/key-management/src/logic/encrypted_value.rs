use serde::{Deserialize, Serialize};
use shared::primitives::WrappedChronoDateTime;
use uuid::Uuid;

/// Ciphertext tagged with the UUID of the canary whose key produced it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    pub encryption_key_uuid: Uuid,
    pub encrypted_value: Vec<u8>,
    pub nonce: Vec<u8>,
}

impl std::fmt::Debug for EncryptedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedValue")
            .field("encryption_key_uuid", &self.encryption_key_uuid)
            .field("encrypted_value", &"************")
            .field("nonce_len", &self.nonce.len())
            .finish()
    }
}

/// A persisted encrypted value. `uuid` is the record identity and survives rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedValueRecord {
    pub uuid: Uuid,
    pub value: EncryptedValue,
    pub created_at: WrappedChronoDateTime,
    pub updated_at: WrappedChronoDateTime,
}

impl EncryptedValueRecord {
    pub fn new(value: EncryptedValue) -> Self {
        let now = WrappedChronoDateTime::now();
        Self {
            uuid: Uuid::new_v4(),
            value,
            created_at: now,
            updated_at: now,
        }
    }
}
