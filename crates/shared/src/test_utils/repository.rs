use crate::error::CommonError;
use crate::libsql::{Connection, Migrations, merge_nested_migrations, up_migrations};

/// Fresh in-memory sqlite database with the given migrations applied.
pub async fn setup_in_memory_database<'a>(
    migrations: Vec<Migrations<'a>>,
) -> Result<(libsql::Database, Connection), CommonError> {
    let db = libsql::Builder::new_local(":memory:").build().await?;
    let conn = Connection(db.connect()?);

    conn.execute_batch("PRAGMA foreign_keys = ON;").await?;

    let migrations_to_run = merge_nested_migrations(migrations);
    for contents in up_migrations(&migrations_to_run).values() {
        conn.execute_batch(contents).await?;
    }

    Ok((db, conn))
}
