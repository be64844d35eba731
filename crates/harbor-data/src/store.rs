//! Repositories over the embedded SQLite database.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use harbor_engine::{resume, AddTorrentParams, InfoHash};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio_stream::StreamExt;

use crate::error::{DataError, Result};
use crate::migrations;

/// Persisted resume record for a single torrent.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentRecord {
    /// Identity of the torrent; the primary key.
    pub info_hash: InfoHash,
    /// Display name at the time of the last save.
    pub name: String,
    /// Directory the payload is written into.
    pub save_path: String,
    /// Position within the session queue.
    pub queue_position: i32,
    /// Opaque engine-produced resume blob.
    pub resume_data: Vec<u8>,
    /// Client-owned auxiliary state, serialized as JSON.
    pub client_data: Option<serde_json::Value>,
}

/// Credential record consumed by the HTTP login handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Unique login name.
    pub username: String,
    /// Password hash in PHC string format.
    pub password_hashed: String,
}

fn map_query_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> DataError {
    move |source| DataError::QueryFailed { operation, source }
}

const INSERT_TORRENT: &str = r"
    INSERT INTO torrents (info_hash_v1, info_hash_v2, name, save_path, queue_position, resume_data, client_data)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
";

const UPSERT_TORRENT: &str = r"
    INSERT INTO torrents (info_hash_v1, info_hash_v2, name, save_path, queue_position, resume_data, client_data)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    ON CONFLICT (info_hash_v1, info_hash_v2) DO UPDATE SET
        name = excluded.name,
        save_path = excluded.save_path,
        queue_position = excluded.queue_position,
        resume_data = excluded.resume_data,
        client_data = excluded.client_data
";

const SELECT_TORRENTS: &str = r"
    SELECT info_hash_v1, info_hash_v2, name, save_path, queue_position, resume_data, client_data
    FROM torrents
";

// Identity lookups match on any hash member present on both sides.
const HASH_PREDICATE: &str = r"
    (info_hash_v1 != '' AND info_hash_v1 = ?1) OR (info_hash_v2 != '' AND info_hash_v2 = ?2)
";

/// Handle over the embedded database.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) and migrate the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or a migration fails;
    /// both are fatal at startup.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = Self::build_pool(options).await?;
        migrations::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Open a fresh in-memory database and migrate it. Test-friendly.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = Self::connect_in_memory().await?;
        migrations::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Connect to a fresh in-memory database without migrating.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect_in_memory() -> Result<SqlitePool> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(map_query_err("connect"))?;
        Self::build_pool(options).await
    }

    async fn build_pool(options: SqliteConnectOptions) -> Result<SqlitePool> {
        // One connection, held forever: all statements are issued from the
        // supervisor task, and an in-memory database dies with its connection.
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(map_query_err("connect"))
    }

    /// Access the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of persisted torrent records.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn torrent_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT count(*) FROM torrents")
            .fetch_one(&self.pool)
            .await
            .map_err(map_query_err("count torrents"))
    }

    /// Visit every persisted record, decoded into engine-ready add
    /// parameters. Order is unspecified.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a record cannot be decoded.
    pub async fn for_each_torrent<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(AddTorrentParams),
    {
        let mut rows = sqlx::query(SELECT_TORRENTS).fetch(&self.pool);
        while let Some(row) = rows.next().await {
            let row = row.map_err(map_query_err("load torrents"))?;
            visitor(decode_row_params(&row)?);
        }
        Ok(())
    }

    /// Insert a new torrent record.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::DuplicateKey`] when a record with the same
    /// identity exists.
    pub async fn insert_torrent(&self, record: &TorrentRecord) -> Result<()> {
        let (v1, v2) = record.info_hash.to_hex_pair();
        let client_data = encode_client_data(record.client_data.as_ref());
        sqlx::query(INSERT_TORRENT)
            .bind(v1)
            .bind(v2)
            .bind(&record.name)
            .bind(&record.save_path)
            .bind(record.queue_position)
            .bind(&record.resume_data)
            .bind(client_data)
            .execute(&self.pool)
            .await
            .map_err(|source| match &source {
                sqlx::Error::Database(db) if db.is_unique_violation() => DataError::DuplicateKey,
                _ => DataError::QueryFailed {
                    operation: "insert torrent",
                    source,
                },
            })?;
        Ok(())
    }

    /// Write the resume fields of a record, inserting it when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn update_torrent(&self, record: &TorrentRecord) -> Result<()> {
        let (v1, v2) = record.info_hash.to_hex_pair();
        let client_data = encode_client_data(record.client_data.as_ref());
        sqlx::query(UPSERT_TORRENT)
            .bind(v1)
            .bind(v2)
            .bind(&record.name)
            .bind(&record.save_path)
            .bind(record.queue_position)
            .bind(&record.resume_data)
            .bind(client_data)
            .execute(&self.pool)
            .await
            .map_err(map_query_err("update torrent"))?;
        Ok(())
    }

    /// Remove a torrent record. A missing record is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn remove_torrent(&self, info_hash: InfoHash) -> Result<()> {
        let (v1, v2) = info_hash.to_hex_pair();
        sqlx::query(&format!("DELETE FROM torrents WHERE {HASH_PREDICATE}"))
            .bind(v1)
            .bind(v2)
            .execute(&self.pool)
            .await
            .map_err(map_query_err("remove torrent"))?;
        Ok(())
    }

    /// Fetch a single record by identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the record cannot be decoded.
    pub async fn torrent(&self, info_hash: InfoHash) -> Result<Option<TorrentRecord>> {
        let (v1, v2) = info_hash.to_hex_pair();
        let row = sqlx::query(&format!("{SELECT_TORRENTS} WHERE {HASH_PREDICATE}"))
            .bind(v1)
            .bind(v2)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_query_err("fetch torrent"))?;
        row.map(|row| decode_row_record(&row)).transpose()
    }

    /// Insert a credential record.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::DuplicateKey`] when the username is taken.
    pub async fn insert_user(&self, user: &User) -> Result<()> {
        sqlx::query("INSERT INTO users (username, password_hashed) VALUES (?1, ?2)")
            .bind(&user.username)
            .bind(&user.password_hashed)
            .execute(&self.pool)
            .await
            .map_err(|source| match &source {
                sqlx::Error::Database(db) if db.is_unique_violation() => DataError::DuplicateKey,
                _ => DataError::QueryFailed {
                    operation: "insert user",
                    source,
                },
            })?;
        Ok(())
    }

    /// Fetch a credential record by username.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn user_by_name(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT username, password_hashed FROM users WHERE username = ?1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_query_err("fetch user"))?;
        row.map(|row| {
            Ok(User {
                username: row.try_get("username").map_err(map_query_err("fetch user"))?,
                password_hashed: row
                    .try_get("password_hashed")
                    .map_err(map_query_err("fetch user"))?,
            })
        })
        .transpose()
    }

    /// Number of credential records.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn user_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT count(*) FROM users")
            .fetch_one(&self.pool)
            .await
            .map_err(map_query_err("count users"))
    }

    /// The engine settings overlay applied at session construction.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a value cannot be decoded.
    pub async fn session_settings(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let rows = sqlx::query("SELECT key, value FROM session_settings")
            .fetch_all(&self.pool)
            .await
            .map_err(map_query_err("load session settings"))?;

        let mut settings = BTreeMap::new();
        for row in rows {
            let key: String = row
                .try_get("key")
                .map_err(map_query_err("load session settings"))?;
            let raw: String = row
                .try_get("value")
                .map_err(map_query_err("load session settings"))?;
            let value =
                serde_json::from_str(&raw).map_err(|err| DataError::CorruptRecord {
                    detail: format!("session setting {key}: {err}"),
                })?;
            settings.insert(key, value);
        }
        Ok(settings)
    }

    /// Set a single setting in the overlay.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn set_session_setting(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO session_settings (key, value) VALUES (?1, ?2)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(key)
        .bind(value.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_query_err("set session setting"))?;
        Ok(())
    }

    /// Fetch an auxiliary metadata value for a torrent.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the value cannot be decoded.
    pub async fn torrent_metadata(
        &self,
        info_hash: InfoHash,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let (v1, v2) = info_hash.to_hex_pair();
        let row = sqlx::query(&format!(
            "SELECT value FROM torrents_metadata WHERE ({HASH_PREDICATE}) AND key = ?3"
        ))
        .bind(v1)
        .bind(v2)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_query_err("fetch torrent metadata"))?;

        row.map(|row| {
            let raw: String = row
                .try_get("value")
                .map_err(map_query_err("fetch torrent metadata"))?;
            serde_json::from_str(&raw).map_err(|err| DataError::CorruptRecord {
                detail: format!("torrent metadata {key}: {err}"),
            })
        })
        .transpose()
    }

    /// Set an auxiliary metadata value for a torrent.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn set_torrent_metadata(
        &self,
        info_hash: InfoHash,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let (v1, v2) = info_hash.to_hex_pair();
        sqlx::query(
            r"
            INSERT INTO torrents_metadata (info_hash_v1, info_hash_v2, key, value)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (info_hash_v1, info_hash_v2, key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(v1)
        .bind(v2)
        .bind(key)
        .bind(value.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_query_err("set torrent metadata"))?;
        Ok(())
    }
}

fn encode_client_data(client_data: Option<&serde_json::Value>) -> Option<String> {
    client_data.map(serde_json::Value::to_string)
}

fn decode_row_record(row: &sqlx::sqlite::SqliteRow) -> Result<TorrentRecord> {
    let v1: String = row
        .try_get("info_hash_v1")
        .map_err(map_query_err("decode torrent row"))?;
    let v2: String = row
        .try_get("info_hash_v2")
        .map_err(map_query_err("decode torrent row"))?;
    let info_hash = InfoHash::from_hex_pair(&v1, &v2).map_err(|err| DataError::CorruptRecord {
        detail: format!("info hash: {err}"),
    })?;
    let client_data: Option<String> = row
        .try_get("client_data")
        .map_err(map_query_err("decode torrent row"))?;
    let client_data = client_data
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|err| DataError::CorruptRecord {
                detail: format!("client data: {err}"),
            })
        })
        .transpose()?;

    Ok(TorrentRecord {
        info_hash,
        name: row
            .try_get("name")
            .map_err(map_query_err("decode torrent row"))?,
        save_path: row
            .try_get("save_path")
            .map_err(map_query_err("decode torrent row"))?,
        queue_position: row
            .try_get("queue_position")
            .map_err(map_query_err("decode torrent row"))?,
        resume_data: row
            .try_get("resume_data")
            .map_err(map_query_err("decode torrent row"))?,
        client_data,
    })
}

// Columns are authoritative for the fields the daemon rewrites on every
// save; the blob carries everything else.
fn decode_row_params(row: &sqlx::sqlite::SqliteRow) -> Result<AddTorrentParams> {
    let record = decode_row_record(row)?;
    let mut params =
        resume::decode(&record.resume_data).map_err(|err| DataError::CorruptRecord {
            detail: format!("resume blob: {err}"),
        })?;
    params.name = record.name;
    params.save_path = record.save_path;
    params.queue_position = record.queue_position;
    params.info_hash = Some(record.info_hash);
    params.client_data = record.client_data;
    Ok(params)
}
