use clockface_core::StoreError;
use rusqlite::{Connection, Transaction};

pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Bring the schema up to [`CURRENT_SCHEMA_VERSION`] inside one transaction.
pub fn run_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let mut version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| StoreError::Backend(format!("failed to read user_version: {e}")))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::Backend(format!(
            "database version ({version}) is newer than supported schema ({CURRENT_SCHEMA_VERSION})"
        )));
    }

    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .map_err(|e| StoreError::Backend(format!("failed to open migration transaction: {e}")))?;

    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        apply_migration(&tx, next_version)?;
        tracing::info!(version = next_version, "applied schema migration");
        version = next_version;
    }

    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .map_err(|e| StoreError::Backend(format!("failed to update user_version: {e}")))?;
    tx.commit()
        .map_err(|e| StoreError::Backend(format!("failed to commit migrations: {e}")))?;

    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<(), StoreError> {
    let sql = match version {
        1 => include_str!("schema/v1.sql"),
        _ => {
            return Err(StoreError::Backend(format!(
                "unknown migration target version: {version}"
            )))
        }
    };
    tx.execute_batch(sql)
        .map_err(|e| StoreError::Backend(format!("migration to version {version} failed: {e}")))
}
