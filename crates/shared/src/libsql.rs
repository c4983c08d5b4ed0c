use std::collections::BTreeMap;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use crate::error::CommonError;
use libsql::params::IntoParams;
use libsql::{Database, Rows};
use tempfile::TempDir;
use tracing::info;
use url::Url;

#[derive(Debug, Clone)]
pub struct Connection(pub libsql::Connection);

impl Connection {
    pub fn new(connection: libsql::Connection) -> Self {
        Self(connection)
    }
}

impl Deref for Connection {
    type Target = libsql::Connection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[macro_export]
macro_rules! execute_with_retry {
    ($operation:expr) => {
        $crate::execute_with_retry!($operation, 10)
    };
    ($operation:expr, $max_retries:expr) => {{
        async {
            let mut _retries = 0u32;
            let _max_retries: u32 = $max_retries;

            loop {
                match $operation.await {
                    Ok(result) => break Ok(result),
                    Err(err) => {
                        let err_str = err.to_string();
                        if err_str.contains("database is locked") || err_str.contains("SQLITE_BUSY")
                        {
                            tracing::warn!("Database is locked, retrying... {:?}", err);
                            if _retries >= _max_retries {
                                break Err(err);
                            }

                            _retries += 1;

                            // Very low delay with exponential backoff
                            let delay_us = 10_000 * (1 << _retries.min(6));
                            tokio::time::sleep(std::time::Duration::from_micros(delay_us)).await;
                        } else {
                            tracing::error!("Error executing with retry: {:?}", err);
                            break Err(err);
                        }
                    }
                }
            }
        }
        .await
    }};
}

impl Connection {
    /// Execute a statement, retrying while the database is locked.
    /// Returns the number of rows that were changed.
    pub async fn execute(&self, sql: &str, params: impl IntoParams) -> libsql::Result<u64> {
        tracing::trace!("executing `{}`", sql);
        let params = params.into_params()?;
        execute_with_retry!(self.0.execute(sql, params.clone()), 10)
    }

    /// Execute a batch of statements, retrying while the database is locked.
    pub async fn execute_batch(&self, sql: &str) -> libsql::Result<()> {
        tracing::trace!("executing batch `{}`", sql);
        execute_with_retry!(self.0.execute_batch(sql), 10).map(|_| ())
    }

    /// Run a query, retrying while the database is locked.
    pub async fn query(&self, sql: &str, params: impl IntoParams) -> libsql::Result<Rows> {
        let stmt = self.0.prepare(sql).await?;
        let params = params.into_params()?;
        execute_with_retry!(stmt.query(params.clone()), 10)
    }
}

pub struct LocalConnectionParams {
    pub path_to_db_file: PathBuf,
}

pub struct RemoteConnectionParams {
    pub remote_url: String,
    pub auth_token: String,
}

pub enum ConnectionType {
    Local(LocalConnectionParams),
    Remote(RemoteConnectionParams),
}

fn get_libsql_path(url: &Url, url_str: &str) -> String {
    // libsql://./relative/path keeps the leading dot as the host
    if url_str.starts_with("libsql://./") {
        format!(".{}", url.path())
    } else {
        url.path().to_string()
    }
}

impl TryFrom<Url> for ConnectionType {
    type Error = CommonError;
    fn try_from(url: Url) -> Result<Self, Self::Error> {
        if url.scheme() != "libsql" {
            let scheme = url.scheme();
            return Err(CommonError::InvalidRequest {
                msg: format!("invalid database url scheme: {scheme}"),
                source: None,
            });
        }

        let mode = match url
            .query_pairs()
            .find(|(key, _)| key == "mode")
            .map(|(_, value)| value.to_string())
        {
            Some(mode) => mode,
            None => {
                return Err(CommonError::InvalidRequest {
                    msg: "missing mode query parameter in database url".to_string(),
                    source: None,
                });
            }
        };

        match mode.as_str() {
            "local" => Ok(ConnectionType::Local(LocalConnectionParams {
                path_to_db_file: PathBuf::from(get_libsql_path(&url, url.as_str())),
            })),
            "remote" => {
                let auth_token = match url.query_pairs().find(|(key, _)| key == "auth") {
                    Some((_, value)) => value.to_string(),
                    None => {
                        return Err(CommonError::InvalidRequest {
                            msg: "missing auth query parameter for remote database".to_string(),
                            source: None,
                        });
                    }
                };

                let mut remote_url = url.clone();
                remote_url.set_query(None);
                remote_url
                    .set_scheme("https")
                    .map_err(|_| CommonError::InvalidRequest {
                        msg: format!("cannot convert {url} to an https url"),
                        source: None,
                    })?;

                Ok(ConnectionType::Remote(RemoteConnectionParams {
                    remote_url: remote_url.to_string(),
                    auth_token,
                }))
            }
            _ => Err(CommonError::InvalidRequest {
                msg: format!("invalid database mode: {mode}"),
                source: None,
            }),
        }
    }
}

pub type Migrations<'a> = BTreeMap<&'a str, BTreeMap<&'a str, &'a str>>;

pub fn merge_nested_migrations<'a>(mergable_migrations: Vec<Migrations<'a>>) -> Migrations<'a> {
    let mut target = Migrations::new();
    for other in mergable_migrations {
        for (outer_key, inner_map) in other {
            target
                .entry(outer_key)
                .and_modify(|existing_inner| {
                    for (inner_key, value) in inner_map.iter() {
                        existing_inner.insert(*inner_key, *value);
                    }
                })
                .or_insert(inner_map);
        }
    }
    target
}

/// The `.up.` sqlite migrations, keyed and ordered by file name.
pub fn up_migrations<'a>(migrations: &Migrations<'a>) -> BTreeMap<&'a str, &'a str> {
    migrations
        .get("sqlite")
        .map(|files| {
            files
                .iter()
                .filter(|(name, _)| name.contains(".up."))
                .map(|(name, contents)| (*name, *contents))
                .collect()
        })
        .unwrap_or_default()
}

/// Materialise embedded migrations as files so the directory migrator can pick them up.
pub fn write_migrations_to_temp_dir(
    migrations: &BTreeMap<&str, &str>,
) -> Result<TempDir, CommonError> {
    let temp_dir = TempDir::new()?;
    for (file_name, contents) in migrations {
        fs::write(temp_dir.path().join(file_name), contents)?;
    }
    Ok(temp_dir)
}

/// Apply pending migrations. Applied file names are tracked by `libsql_migration`
/// in its `libsql_migrations` table, so reopening a database is a no-op.
pub async fn run_migrations(conn: &Connection, migrations: &Migrations<'_>) -> Result<(), CommonError> {
    let migrations_to_run = up_migrations(migrations);
    if migrations_to_run.is_empty() {
        return Ok(());
    }

    let temp_dir = write_migrations_to_temp_dir(&migrations_to_run)?;
    let applied = libsql_migration::dir::migrate(conn, temp_dir.path().to_path_buf()).await?;
    if applied {
        info!("applied {} migration file(s)", migrations_to_run.len());
    }
    Ok(())
}

pub async fn establish_db_connection<'a>(
    connection_string: &Url,
    migrations: Option<Migrations<'a>>,
) -> Result<(Database, Connection), CommonError> {
    let connection_type = ConnectionType::try_from(connection_string.clone())?;

    fn create_db_file_parent_dir(parent_path: Option<&Path>) -> Result<(), CommonError> {
        if let Some(path) = parent_path {
            if !path.as_os_str().is_empty() && !std::fs::exists(path)? {
                std::fs::create_dir_all(path)?;
            }
        }
        Ok(())
    }

    let (db, conn) = match connection_type {
        ConnectionType::Local(params) => {
            info!("establishing local connection");
            create_db_file_parent_dir(params.path_to_db_file.parent())?;
            let db = libsql::Builder::new_local(params.path_to_db_file.clone())
                .build()
                .await?;
            let conn = db.connect()?;
            (db, conn)
        }
        ConnectionType::Remote(params) => {
            info!("establishing remote connection");
            let db =
                libsql::Builder::new_remote(params.remote_url.clone(), params.auth_token.clone())
                    .build()
                    .await?;
            let conn = db.connect()?;
            (db, conn)
        }
    };

    let conn = Connection(conn);
    if let Some(migrations) = migrations {
        run_migrations(&conn, &migrations).await?;
    }

    Ok((db, conn))
}
