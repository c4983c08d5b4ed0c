use shared::primitives::WrappedChronoDateTime;
use uuid::Uuid;

/// Sentinel plaintext stored in every canary created by this crate.
pub const CANARY_VALUE: [u8; 128] = [0u8; 128];

/// Shorter sentinel written by older deployments; still accepted when matching.
pub const DEPRECATED_CANARY_VALUE: [u8; 64] = [0u8; 64];

pub fn is_canary_sentinel(plaintext: &[u8]) -> bool {
    plaintext == CANARY_VALUE.as_slice() || plaintext == DEPRECATED_CANARY_VALUE.as_slice()
}

/// A sentinel value encrypted under one specific key. Identifies that key
/// without ever persisting it.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKeyCanary {
    pub uuid: Uuid,
    pub encrypted_canary_value: Vec<u8>,
    pub nonce: Vec<u8>,
    pub salt: Vec<u8>,
    pub created_at: WrappedChronoDateTime,
}

impl std::fmt::Debug for EncryptionKeyCanary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKeyCanary")
            .field("uuid", &self.uuid)
            .field("encrypted_canary_value_len", &self.encrypted_canary_value.len())
            .field("nonce_len", &self.nonce.len())
            .field("salt_len", &self.salt.len())
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;

    #[test]
    fn test_sentinel_detection() {
        assert!(is_canary_sentinel(&CANARY_VALUE));
        assert!(is_canary_sentinel(&DEPRECATED_CANARY_VALUE));
        assert!(is_canary_sentinel(&vec![0u8; 128]));

        assert!(!is_canary_sentinel(&[0u8; 32]));
        assert!(!is_canary_sentinel(&[1u8; 128]));
        assert!(!is_canary_sentinel(b""));
    }
}
