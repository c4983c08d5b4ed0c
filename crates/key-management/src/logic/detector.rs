use serde::Serialize;
use tracing::{info, warn};

use crate::error::EncryptionError;
use crate::logic::key_set::EncryptionKeySet;
use crate::repository::EncryptedValueRepositoryLike;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecryptableDataReport {
    pub total: i64,
    pub decryptable: i64,
}

/// Startup check: refuse to serve when stored values exist and none of them is
/// encrypted under a configured key, which points at a wrong key configuration.
pub async fn check_decryptable_data(
    key_set: &EncryptionKeySet,
    repository: &dyn EncryptedValueRepositoryLike,
) -> Result<DecryptableDataReport, EncryptionError> {
    let total = repository.count_by_key_not_in(&[]).await?;
    let decryptable = repository.count_by_key_in(&key_set.get_uuids()).await?;

    if total > 0 && decryptable == 0 {
        return Err(EncryptionError::invalid_configuration(format!(
            "the configured encryption keys cannot decrypt any of the {total} stored value(s)"
        )));
    }
    if decryptable < total {
        warn!(
            "{} of {} stored value(s) are encrypted under keys that are not configured",
            total - decryptable,
            total
        );
    }

    info!("{} of {} stored value(s) are decryptable", decryptable, total);
    Ok(DecryptableDataReport { total, decryptable })
}
