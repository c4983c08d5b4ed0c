use std::collections::BTreeMap;

use anyhow::Context;
use libsql::params::Params;
use shared::error::CommonError;
use shared::primitives::{SqlMigrationLoader, WrappedChronoDateTime};
use uuid::Uuid;

use crate::logic::canary::EncryptionKeyCanary;
use crate::logic::encrypted_value::{EncryptedValue, EncryptedValueRecord};
use crate::repository::{EncryptedValueRepositoryLike, EncryptionKeyCanaryRepositoryLike};

const FIND_ALL_CANARIES: &str = r#"SELECT uuid, encrypted_canary_value, nonce, salt, created_at
FROM encryption_key_canary
ORDER BY created_at, uuid"#;

const INSERT_CANARY: &str = r#"INSERT INTO encryption_key_canary (uuid, encrypted_canary_value, nonce, salt, created_at)
VALUES (?, ?, ?, ?, ?)"#;

const INSERT_ENCRYPTED_VALUE: &str = r#"INSERT INTO encrypted_value (uuid, encryption_key_uuid, encrypted_value, nonce, created_at, updated_at)
VALUES (?, ?, ?, ?, ?, ?)"#;

const UPSERT_ENCRYPTED_VALUE: &str = r#"INSERT INTO encrypted_value (uuid, encryption_key_uuid, encrypted_value, nonce, created_at, updated_at)
VALUES (?, ?, ?, ?, ?, ?)
ON CONFLICT(uuid) DO UPDATE SET
    encryption_key_uuid = excluded.encryption_key_uuid,
    encrypted_value = excluded.encrypted_value,
    nonce = excluded.nonce,
    updated_at = excluded.updated_at"#;

const SELECT_ENCRYPTED_VALUE: &str = r#"SELECT uuid, encryption_key_uuid, encrypted_value, nonce, created_at, updated_at
FROM encrypted_value"#;

#[derive(Clone)]
pub struct Repository {
    conn: shared::libsql::Connection,
}

impl Repository {
    pub fn new(conn: shared::libsql::Connection) -> Self {
        Self { conn }
    }

    async fn count(&self, sql: &str, params: Vec<libsql::Value>) -> Result<i64, CommonError> {
        let mut rows = self
            .conn
            .query(sql, Params::Positional(params))
            .await
            .context("Failed to count encrypted values")
            .map_err(repository_error)?;

        let row = rows
            .next()
            .await
            .context("Failed to read encrypted value count")
            .map_err(repository_error)?
            .ok_or_else(|| CommonError::Repository {
                msg: "count query returned no rows".to_string(),
                source: None,
            })?;

        Ok(row.get::<i64>(0)?)
    }

    async fn select_records(
        &self,
        sql: &str,
        params: Vec<libsql::Value>,
    ) -> Result<Vec<EncryptedValueRecord>, CommonError> {
        let mut rows = self
            .conn
            .query(sql, Params::Positional(params))
            .await
            .context("Failed to query encrypted values")
            .map_err(repository_error)?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .context("Failed to read encrypted value row")
            .map_err(repository_error)?
        {
            records.push(record_from_row(&row)?);
        }
        Ok(records)
    }
}

macro_rules! migration {
    ($file:literal) => {
        (
            $file,
            include_str!(concat!("../../../dbs/key_management/migrations/", $file)),
        )
    };
}

impl SqlMigrationLoader for Repository {
    // one statement per file; the directory migrator executes each file as a single statement
    fn load_sql_migrations() -> BTreeMap<&'static str, BTreeMap<&'static str, &'static str>> {
        BTreeMap::from([(
            "sqlite",
            BTreeMap::from([
                migration!("20250601000000_create_encryption_key_canary.up.sql"),
                migration!("20250601000000_create_encryption_key_canary.down.sql"),
                migration!("20250601000001_create_encrypted_value.up.sql"),
                migration!("20250601000001_create_encrypted_value.down.sql"),
                migration!("20250601000002_index_encrypted_value_key.up.sql"),
                migration!("20250601000002_index_encrypted_value_key.down.sql"),
            ]),
        )])
    }
}

#[async_trait::async_trait]
impl EncryptionKeyCanaryRepositoryLike for Repository {
    async fn find_all_canaries(&self) -> Result<Vec<EncryptionKeyCanary>, CommonError> {
        let mut rows = self
            .conn
            .query(FIND_ALL_CANARIES, ())
            .await
            .context("Failed to list encryption key canaries")
            .map_err(repository_error)?;

        let mut canaries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .context("Failed to read encryption key canary row")
            .map_err(repository_error)?
        {
            canaries.push(EncryptionKeyCanary {
                uuid: uuid_column(&row, 0)?,
                encrypted_canary_value: blob_column(&row, 1)?,
                nonce: blob_column(&row, 2)?,
                salt: blob_column(&row, 3)?,
                created_at: datetime_column(&row, 4)?,
            });
        }
        Ok(canaries)
    }

    async fn save_canary(
        &self,
        canary: &EncryptionKeyCanary,
    ) -> Result<EncryptionKeyCanary, CommonError> {
        self.conn
            .execute(
                INSERT_CANARY,
                Params::Positional(vec![
                    libsql::Value::Text(canary.uuid.to_string()),
                    libsql::Value::Blob(canary.encrypted_canary_value.clone()),
                    libsql::Value::Blob(canary.nonce.clone()),
                    libsql::Value::Blob(canary.salt.clone()),
                    canary.created_at.into(),
                ]),
            )
            .await
            .context("Failed to save encryption key canary")
            .map_err(repository_error)?;
        Ok(canary.clone())
    }

    async fn delete_canaries(&self, uuids: &[Uuid]) -> Result<u64, CommonError> {
        if uuids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "DELETE FROM encryption_key_canary WHERE uuid IN ({})",
            placeholders(uuids.len())
        );
        let deleted = self
            .conn
            .execute(&sql, Params::Positional(uuid_values(uuids)))
            .await
            .context("Failed to delete encryption key canaries")
            .map_err(repository_error)?;
        Ok(deleted)
    }
}

#[async_trait::async_trait]
impl EncryptedValueRepositoryLike for Repository {
    async fn create_encrypted_value(
        &self,
        record: &EncryptedValueRecord,
    ) -> Result<(), CommonError> {
        self.conn
            .execute(INSERT_ENCRYPTED_VALUE, Params::Positional(record_values(record)))
            .await
            .context("Failed to create encrypted value")
            .map_err(repository_error)?;
        Ok(())
    }

    async fn get_encrypted_value(
        &self,
        uuid: &Uuid,
    ) -> Result<Option<EncryptedValueRecord>, CommonError> {
        let sql = format!("{SELECT_ENCRYPTED_VALUE}\nWHERE uuid = ?");
        let mut records = self
            .select_records(&sql, vec![libsql::Value::Text(uuid.to_string())])
            .await?;
        Ok(records.pop())
    }

    async fn count_by_key_not_in(&self, key_uuids: &[Uuid]) -> Result<i64, CommonError> {
        if key_uuids.is_empty() {
            return self
                .count("SELECT COUNT(*) FROM encrypted_value", vec![])
                .await;
        }

        let sql = format!(
            "SELECT COUNT(*) FROM encrypted_value WHERE encryption_key_uuid NOT IN ({})",
            placeholders(key_uuids.len())
        );
        self.count(&sql, uuid_values(key_uuids)).await
    }

    async fn count_by_key_in(&self, key_uuids: &[Uuid]) -> Result<i64, CommonError> {
        if key_uuids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "SELECT COUNT(*) FROM encrypted_value WHERE encryption_key_uuid IN ({})",
            placeholders(key_uuids.len())
        );
        self.count(&sql, uuid_values(key_uuids)).await
    }

    async fn find_page_by_key_not_in(
        &self,
        key_uuids: &[Uuid],
        after: Option<Uuid>,
        page_size: u32,
    ) -> Result<Vec<EncryptedValueRecord>, CommonError> {
        let mut sql = format!("{SELECT_ENCRYPTED_VALUE}\nWHERE 1 = 1");
        let mut params = Vec::new();

        if !key_uuids.is_empty() {
            sql.push_str(&format!(
                " AND encryption_key_uuid NOT IN ({})",
                placeholders(key_uuids.len())
            ));
            params.extend(uuid_values(key_uuids));
        }
        if let Some(after) = after {
            sql.push_str(" AND uuid > ?");
            params.push(libsql::Value::Text(after.to_string()));
        }
        sql.push_str("\nORDER BY uuid\nLIMIT ?");
        params.push(libsql::Value::Integer(i64::from(page_size)));

        self.select_records(&sql, params).await
    }

    async fn save_and_flush(&self, record: &EncryptedValueRecord) -> Result<(), CommonError> {
        self.conn
            .execute(UPSERT_ENCRYPTED_VALUE, Params::Positional(record_values(record)))
            .await
            .context("Failed to save encrypted value")
            .map_err(repository_error)?;
        Ok(())
    }
}

fn repository_error(e: anyhow::Error) -> CommonError {
    CommonError::Repository {
        msg: e.to_string(),
        source: Some(e),
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn uuid_values(uuids: &[Uuid]) -> Vec<libsql::Value> {
    uuids
        .iter()
        .map(|uuid| libsql::Value::Text(uuid.to_string()))
        .collect()
}

fn record_values(record: &EncryptedValueRecord) -> Vec<libsql::Value> {
    vec![
        libsql::Value::Text(record.uuid.to_string()),
        libsql::Value::Text(record.value.encryption_key_uuid.to_string()),
        libsql::Value::Blob(record.value.encrypted_value.clone()),
        libsql::Value::Blob(record.value.nonce.clone()),
        record.created_at.into(),
        record.updated_at.into(),
    ]
}

fn uuid_column(row: &libsql::Row, idx: i32) -> Result<Uuid, CommonError> {
    let value: String = row.get(idx)?;
    Uuid::parse_str(&value).map_err(|e| CommonError::Repository {
        msg: format!("invalid uuid in column {idx}: {value}"),
        source: Some(e.into()),
    })
}

fn datetime_column(row: &libsql::Row, idx: i32) -> Result<WrappedChronoDateTime, CommonError> {
    let value: String = row.get(idx)?;
    WrappedChronoDateTime::try_from(value.as_str()).map_err(|e| CommonError::Repository {
        msg: format!("invalid datetime in column {idx}: {value}"),
        source: Some(e),
    })
}

// empty blobs may come back as NULL
fn blob_column(row: &libsql::Row, idx: i32) -> Result<Vec<u8>, CommonError> {
    match row.get_value(idx)? {
        libsql::Value::Blob(bytes) => Ok(bytes),
        libsql::Value::Null => Ok(Vec::new()),
        _ => Err(CommonError::Repository {
            msg: format!("expected a blob in column {idx}"),
            source: None,
        }),
    }
}

fn record_from_row(row: &libsql::Row) -> Result<EncryptedValueRecord, CommonError> {
    Ok(EncryptedValueRecord {
        uuid: uuid_column(row, 0)?,
        value: EncryptedValue {
            encryption_key_uuid: uuid_column(row, 1)?,
            encrypted_value: blob_column(row, 2)?,
            nonce: blob_column(row, 3)?,
        },
        created_at: datetime_column(row, 4)?,
        updated_at: datetime_column(row, 5)?,
    })
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use shared::test_utils::repository::setup_in_memory_database;

    async fn repository() -> (libsql::Database, Repository) {
        let (db, conn) = setup_in_memory_database(vec![Repository::load_sql_migrations()])
            .await
            .unwrap();
        (db, Repository::new(conn))
    }

    fn canary(created_at: chrono::DateTime<chrono::Utc>) -> EncryptionKeyCanary {
        EncryptionKeyCanary {
            uuid: Uuid::new_v4(),
            encrypted_canary_value: vec![1, 2, 3],
            nonce: vec![4; 12],
            salt: Vec::new(),
            created_at: WrappedChronoDateTime::new(created_at),
        }
    }

    fn record(key_uuid: Uuid) -> EncryptedValueRecord {
        EncryptedValueRecord::new(EncryptedValue {
            encryption_key_uuid: key_uuid,
            encrypted_value: vec![9, 9, 9],
            nonce: vec![1; 12],
        })
    }

    #[tokio::test]
    async fn test_canaries_are_listed_oldest_first() {
        shared::setup_test!();
        let (_db, repo) = repository().await;

        let now = chrono::Utc::now();
        let newer = canary(now);
        let older = canary(now - chrono::Duration::seconds(60));
        repo.save_canary(&newer).await.unwrap();
        repo.save_canary(&older).await.unwrap();

        let canaries = repo.find_all_canaries().await.unwrap();
        assert_eq!(canaries.len(), 2);
        assert_eq!(canaries[0].uuid, older.uuid);
        assert_eq!(canaries[1].uuid, newer.uuid);
        assert_eq!(canaries[0].encrypted_canary_value, vec![1, 2, 3]);
        assert_eq!(canaries[0].nonce, vec![4; 12]);
        assert!(canaries[0].salt.is_empty());
        assert_eq!(
            canaries[0].created_at.get_inner().timestamp_micros(),
            older.created_at.get_inner().timestamp_micros()
        );
    }

    #[tokio::test]
    async fn test_delete_canaries() {
        shared::setup_test!();
        let (_db, repo) = repository().await;

        let a = repo.save_canary(&canary(chrono::Utc::now())).await.unwrap();
        let b = repo.save_canary(&canary(chrono::Utc::now())).await.unwrap();

        assert_eq!(repo.delete_canaries(&[]).await.unwrap(), 0);
        assert_eq!(repo.delete_canaries(&[a.uuid, Uuid::new_v4()]).await.unwrap(), 1);

        let remaining = repo.find_all_canaries().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].uuid, b.uuid);
    }

    #[tokio::test]
    async fn test_counts_by_key() {
        shared::setup_test!();
        let (_db, repo) = repository().await;

        let k1 = Uuid::new_v4();
        let k2 = Uuid::new_v4();
        for key in [k1, k1, k2] {
            repo.create_encrypted_value(&record(key)).await.unwrap();
        }

        assert_eq!(repo.count_by_key_not_in(&[]).await.unwrap(), 3);
        assert_eq!(repo.count_by_key_not_in(&[k1]).await.unwrap(), 1);
        assert_eq!(repo.count_by_key_not_in(&[k1, k2]).await.unwrap(), 0);
        assert_eq!(repo.count_by_key_in(&[]).await.unwrap(), 0);
        assert_eq!(repo.count_by_key_in(&[k1]).await.unwrap(), 2);
        assert_eq!(repo.count_by_key_in(&[k1, k2]).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_find_page_by_key_not_in_pages_by_uuid() {
        shared::setup_test!();
        let (_db, repo) = repository().await;

        let active = Uuid::new_v4();
        let old = Uuid::new_v4();
        repo.create_encrypted_value(&record(active)).await.unwrap();
        for _ in 0..5 {
            repo.create_encrypted_value(&record(old)).await.unwrap();
        }

        let first = repo
            .find_page_by_key_not_in(&[active], None, 2)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].uuid < first[1].uuid);

        let mut seen: Vec<Uuid> = first.iter().map(|r| r.uuid).collect();
        let mut after = first.last().map(|r| r.uuid);
        loop {
            let page = repo
                .find_page_by_key_not_in(&[active], after, 2)
                .await
                .unwrap();
            if page.is_empty() {
                break;
            }
            after = page.last().map(|r| r.uuid);
            seen.extend(page.iter().map(|r| r.uuid));
        }

        assert_eq!(seen.len(), 5);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[tokio::test]
    async fn test_save_and_flush_keeps_identity() {
        shared::setup_test!();
        let (_db, repo) = repository().await;

        let original = record(Uuid::new_v4());
        repo.create_encrypted_value(&original).await.unwrap();

        let new_key = Uuid::new_v4();
        let mut rotated = original.clone();
        rotated.value = EncryptedValue {
            encryption_key_uuid: new_key,
            encrypted_value: vec![7, 7],
            nonce: Vec::new(),
        };
        rotated.updated_at = WrappedChronoDateTime::now();
        repo.save_and_flush(&rotated).await.unwrap();

        let stored = repo
            .get_encrypted_value(&original.uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.uuid, original.uuid);
        assert_eq!(stored.value.encryption_key_uuid, new_key);
        assert_eq!(stored.value.encrypted_value, vec![7, 7]);
        assert!(stored.value.nonce.is_empty());
        assert_eq!(repo.count_by_key_not_in(&[]).await.unwrap(), 1);

        assert!(
            repo.get_encrypted_value(&Uuid::new_v4())
                .await
                .unwrap()
                .is_none()
        );
    }
}
