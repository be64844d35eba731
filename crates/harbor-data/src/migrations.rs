//! Ordered, immutable schema migrations tracked through `PRAGMA user_version`.
//!
//! The applied prefix of the migration list always equals `user_version`.
//! Each migration runs inside its own transaction; the first failure aborts
//! startup with `user_version` still pointing at the last fully-applied
//! prefix. The version is written once after the whole list has applied and
//! is never decremented.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::error::{DataError, Result};

/// Names of every migration, in application order. The list only ever grows.
pub const MIGRATION_NAMES: [&str; 6] = [
    "initial_setup",
    "session_settings",
    "users",
    "remove_session_params",
    "torrents_metadata",
    "client_data",
];

/// Apply all pending migrations.
///
/// # Errors
///
/// Returns [`DataError::MigrationFailed`] on the first migration that fails;
/// callers treat this as fatal.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    let version = user_version(pool).await?;

    if version < MIGRATION_NAMES.len() {
        info!(
            from = version,
            to = MIGRATION_NAMES.len(),
            "migrating database"
        );
    }

    for index in version..MIGRATION_NAMES.len() {
        let mut tx = pool
            .begin()
            .await
            .map_err(|source| DataError::MigrationFailed { index, source })?;
        apply(&mut tx, index)
            .await
            .map_err(|source| DataError::MigrationFailed { index, source })?;
        tx.commit()
            .await
            .map_err(|source| DataError::MigrationFailed { index, source })?;
    }

    set_user_version(pool, MIGRATION_NAMES.len()).await
}

/// Read the store's schema version.
pub async fn user_version(pool: &SqlitePool) -> Result<usize> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(|source| DataError::QueryFailed {
            operation: "read user_version",
            source,
        })?;
    Ok(usize::try_from(version).unwrap_or(0))
}

async fn set_user_version(pool: &SqlitePool, version: usize) -> Result<()> {
    sqlx::query(&format!("PRAGMA user_version = {version}"))
        .execute(pool)
        .await
        .map_err(|source| DataError::QueryFailed {
            operation: "write user_version",
            source,
        })?;
    Ok(())
}

async fn apply(conn: &mut SqliteConnection, index: usize) -> sqlx::Result<()> {
    match index {
        0 => initial_setup(conn).await,
        1 => session_settings(conn).await,
        2 => users(conn).await,
        3 => remove_session_params(conn).await,
        4 => torrents_metadata(conn).await,
        5 => client_data(conn).await,
        _ => Ok(()),
    }
}

async fn initial_setup(conn: &mut SqliteConnection) -> sqlx::Result<()> {
    sqlx::query(
        r"
        CREATE TABLE torrents (
            info_hash_v1   TEXT NOT NULL DEFAULT '',
            info_hash_v2   TEXT NOT NULL DEFAULT '',
            name           TEXT NOT NULL,
            save_path      TEXT NOT NULL,
            queue_position INTEGER NOT NULL DEFAULT 0,
            resume_data    BLOB NOT NULL,
            PRIMARY KEY (info_hash_v1, info_hash_v2)
        )
        ",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE session_params (
            data      BLOB NOT NULL,
            timestamp INTEGER NOT NULL
        )
        ",
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn session_settings(conn: &mut SqliteConnection) -> sqlx::Result<()> {
    sqlx::query(
        r"
        CREATE TABLE session_settings (
            key   TEXT NOT NULL PRIMARY KEY,
            value TEXT NOT NULL
        )
        ",
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn users(conn: &mut SqliteConnection) -> sqlx::Result<()> {
    sqlx::query(
        r"
        CREATE TABLE users (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            username        TEXT NOT NULL UNIQUE,
            password_hashed TEXT NOT NULL
        )
        ",
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}

// Session state moved to the on-disk params file; the scratch table goes away.
async fn remove_session_params(conn: &mut SqliteConnection) -> sqlx::Result<()> {
    sqlx::query("DROP TABLE session_params")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn torrents_metadata(conn: &mut SqliteConnection) -> sqlx::Result<()> {
    sqlx::query(
        r"
        CREATE TABLE torrents_metadata (
            info_hash_v1 TEXT NOT NULL DEFAULT '',
            info_hash_v2 TEXT NOT NULL DEFAULT '',
            key          TEXT NOT NULL,
            value        TEXT NOT NULL,
            PRIMARY KEY (info_hash_v1, info_hash_v2, key)
        )
        ",
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn client_data(conn: &mut SqliteConnection) -> sqlx::Result<()> {
    sqlx::query("ALTER TABLE torrents ADD COLUMN client_data TEXT")
        .execute(&mut *conn)
        .await?;
    Ok(())
}
