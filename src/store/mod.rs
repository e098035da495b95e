//! Store: the narrow surface over the embedded database.
//!
//! Exclusively owns on-disk state. File-backed databases run in WAL mode;
//! tests use a single-connection in-memory pool.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::Row;
use sqlx::SqlitePool;

use crate::PinakesError;
use crate::Result;

mod posts;
mod schema;
mod search;

pub use search::SearchOptions;
pub use search::SortOrder;
pub use search::VectorHit;
pub use search::DEFAULT_VECTOR_THRESHOLD;

#[cfg(test)]
pub(crate) use posts::sample_post;

/// Dimension of stored embedding vectors.
pub const EMBEDDING_DIM: usize = 384;

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and initialize the
    /// schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory database for tests. One connection: each `:memory:`
    /// connection is its own database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(PinakesError::from)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Idempotent schema creation.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(schema::SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_config(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM config WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_repo_rev(&self, did: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT rev FROM repo WHERE did = ?")
            .bind(did)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Last-writer-wins rev update at the end of a successful crawl.
    pub async fn set_repo_rev(&self, did: &str, rev: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO repo (did, rev) VALUES (?, ?)
             ON CONFLICT (did) DO UPDATE SET rev = excluded.rev",
        )
        .bind(did)
        .bind(rev)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Pack a vector as little-endian f32 bytes.
#[must_use]
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Unpack little-endian f32 bytes.
pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(PinakesError::Custom(format!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_roundtrip() {
        let vector = vec![0.25f32, -1.5, 3.75, 0.0];
        let decoded = decode_vector(&encode_vector(&vector)).unwrap();
        assert_eq!(decoded, vector);
    }

    #[test]
    fn ragged_blob_is_an_error() {
        assert!(decode_vector(&[1, 2, 3]).is_err());
    }

    #[tokio::test]
    async fn config_set_get_delete() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.get_config("did").await.unwrap(), None);
        store.set_config("did", "did:plc:me").await.unwrap();
        assert_eq!(
            store.get_config("did").await.unwrap().as_deref(),
            Some("did:plc:me")
        );
        store.set_config("did", "did:plc:other").await.unwrap();
        assert_eq!(
            store.get_config("did").await.unwrap().as_deref(),
            Some("did:plc:other")
        );
        store.delete_config("did").await.unwrap();
        assert_eq!(store.get_config("did").await.unwrap(), None);
    }

    #[tokio::test]
    async fn repo_rev_upsert() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.get_repo_rev("did:plc:a").await.unwrap(), None);
        store.set_repo_rev("did:plc:a", "3lk4aaa222222").await.unwrap();
        store.set_repo_rev("did:plc:a", "3lk4zzz222222").await.unwrap();
        assert_eq!(
            store.get_repo_rev("did:plc:a").await.unwrap().as_deref(),
            Some("3lk4zzz222222")
        );
    }

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        store.init_schema().await.unwrap();
        store.init_schema().await.unwrap();
    }
}
