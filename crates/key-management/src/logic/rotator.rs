// Encryption key rotator
// Moves every stored value off inactive keys onto the active key, then drops the
// canaries nothing references any more

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use shared::primitives::WrappedChronoDateTime;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::EncryptionError;
use crate::logic::encrypted_value::{EncryptedValue, EncryptedValueRecord};
use crate::logic::retrying::RetryingEncryptionService;
use crate::repository::EncryptedValueRepositoryLike;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationSummary {
    /// Values not under the active key when rotation started.
    pub pending_before: i64,
    pub rotated: u64,
    /// Values under keys missing from the key set; left untouched.
    pub skipped: u64,
    pub failed: u64,
    pub deleted_canaries: Vec<Uuid>,
    pub elapsed: Duration,
}

pub struct EncryptionKeyRotator {
    encryption_service: Arc<RetryingEncryptionService>,
    repository: Arc<dyn EncryptedValueRepositoryLike>,
    page_size: u32,
}

impl EncryptionKeyRotator {
    pub fn new(
        encryption_service: Arc<RetryingEncryptionService>,
        repository: Arc<dyn EncryptedValueRepositoryLike>,
        page_size: u32,
    ) -> Self {
        Self {
            encryption_service,
            repository,
            page_size: page_size.max(1),
        }
    }

    /// Run `rotate` on a background task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<RotationSummary, EncryptionError>> {
        tokio::spawn(async move { self.rotate().await })
    }

    /// One pass over every value not under the active key. A failing record is
    /// counted and logged; it never aborts the pass.
    pub async fn rotate(&self) -> Result<RotationSummary, EncryptionError> {
        let started = Instant::now();
        let key_set = self.encryption_service.key_set();
        let active_uuid = key_set.get_active_uuid();

        let mut summary = RotationSummary {
            pending_before: self.repository.count_by_key_not_in(&[active_uuid]).await?,
            ..Default::default()
        };
        info!(
            "starting encryption key rotation: {} value(s) to move onto key {}",
            summary.pending_before, active_uuid
        );

        let mut after = None;
        loop {
            let page = self
                .repository
                .find_page_by_key_not_in(&[active_uuid], after, self.page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.uuid);
            debug!("rotating page of {} value(s)", page.len());

            for record in page {
                self.rotate_record(record, &mut summary).await;
            }
        }

        let mut stale = Vec::new();
        for uuid in key_set.get_inactive_uuids() {
            if self.repository.count_by_key_in(&[uuid]).await? == 0 {
                stale.push(uuid);
            } else {
                warn!("keeping canary {}: values still reference its key", uuid);
            }
        }
        if !stale.is_empty() {
            key_set.mapper().delete(&stale).await?;
            key_set.reload().await?;
        }
        summary.deleted_canaries = stale;
        summary.elapsed = started.elapsed();

        info!(
            "finished encryption key rotation in {}: {} rotated, {} skipped, {} failed, {} canaries deleted",
            humantime::format_duration(summary.elapsed),
            summary.rotated,
            summary.skipped,
            summary.failed,
            summary.deleted_canaries.len()
        );
        Ok(summary)
    }

    async fn rotate_record(&self, record: EncryptedValueRecord, summary: &mut RotationSummary) {
        let value = match self.reencrypt(&record.value).await {
            Ok(value) => value,
            Err(EncryptionError::KeyNotFound { key_uuid }) => {
                error!(
                    "value {} is encrypted under key {} which is not configured, skipping",
                    record.uuid, key_uuid
                );
                summary.skipped += 1;
                return;
            }
            Err(e) => {
                error!("failed to rotate value {}: {}", record.uuid, e);
                summary.failed += 1;
                return;
            }
        };

        let updated = EncryptedValueRecord {
            uuid: record.uuid,
            value,
            created_at: record.created_at,
            updated_at: WrappedChronoDateTime::now(),
        };
        match self.repository.save_and_flush(&updated).await {
            Ok(()) => summary.rotated += 1,
            Err(e) => {
                error!("failed to save rotated value {}: {}", record.uuid, e);
                summary.failed += 1;
            }
        }
    }

    async fn reencrypt(&self, value: &EncryptedValue) -> Result<EncryptedValue, EncryptionError> {
        let plaintext = Zeroizing::new(self.encryption_service.decrypt_bytes(value).await?);
        self.encryption_service.encrypt_bytes(&plaintext).await
    }
}
