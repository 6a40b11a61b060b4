//! Authoritative chunk-record store. Assigns the monotonic identifiers that
//! join the vector index and the lexical index.

use crate::error::RagResult;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChunkRecord {
    pub id: i64,
    pub content: String,
    pub source_uri: String,
    pub source_type: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub created_at: String,
    pub vector_digest: Option<String>,
}

/// A chunk awaiting insertion; the store assigns its identifier.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub content: String,
    pub source_uri: String,
    pub source_type: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
}

pub struct ChunkStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl ChunkStore {
    pub async fn open(path: &Path) -> RagResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT NOT NULL,
                source_uri TEXT NOT NULL,
                source_type TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                total_chunks INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                vector_digest TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source_uri ON chunks(source_uri)")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a batch inside one transaction. Identifiers are assigned in the
    /// caller-supplied order and returned in that order.
    pub async fn insert_batch(&self, chunks: &[NewChunk]) -> RagResult<Vec<i64>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let created_at = chrono::Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO chunks
                    (content, source_uri, source_type, chunk_index, total_chunks, created_at, vector_digest)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                RETURNING id
                "#,
            )
            .bind(&chunk.content)
            .bind(&chunk.source_uri)
            .bind(&chunk.source_type)
            .bind(chunk.chunk_index)
            .bind(chunk.total_chunks)
            .bind(&created_at)
            .bind(content_digest(&chunk.content))
            .fetch_one(&mut *tx)
            .await?;
            ids.push(id);
        }
        tx.commit().await?;
        Ok(ids)
    }

    pub async fn get(&self, id: i64) -> RagResult<Option<ChunkRecord>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| record_from_row(&r)))
    }

    /// Point lookups preserving request order; missing identifiers and
    /// duplicates are skipped.
    pub async fn get_many(&self, ids: &[i64]) -> RagResult<Vec<ChunkRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT * FROM chunks WHERE id IN ({})",
            placeholders.join(",")
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut by_id: HashMap<i64, ChunkRecord> = rows
            .iter()
            .map(|r| {
                let record = record_from_row(r);
                (record.id, record)
            })
            .collect();

        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if seen.insert(*id) {
                if let Some(record) = by_id.remove(id) {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    pub async fn by_source(&self, source_uri: &str) -> RagResult<Vec<ChunkRecord>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE source_uri = ?1 ORDER BY chunk_index")
            .bind(source_uri)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    pub async fn count(&self) -> RagResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Delete the backing file and reopen empty. The fresh AUTOINCREMENT
    /// sequence makes post-reset identifiers restart at 1.
    pub async fn reset(&mut self) -> RagResult<()> {
        self.pool.close().await;
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            let file = PathBuf::from(file);
            if file.exists() {
                std::fs::remove_file(&file)?;
            }
        }
        let reopened = ChunkStore::open(&self.path).await?;
        self.pool = reopened.pool;
        info!(path = %self.path.display(), "Chunk store reset");
        Ok(())
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> ChunkRecord {
    ChunkRecord {
        id: row.get("id"),
        content: row.get("content"),
        source_uri: row.get("source_uri"),
        source_type: row.get("source_type"),
        chunk_index: row.get("chunk_index"),
        total_chunks: row.get("total_chunks"),
        created_at: row.get("created_at"),
        vector_digest: row.get("vector_digest"),
    }
}

/// SHA-256 hex digest of the chunk content, recorded next to its embedding.
fn content_digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str, uri: &str, index: i64, total: i64) -> NewChunk {
        NewChunk {
            content: content.to_string(),
            source_uri: uri.to_string(),
            source_type: "text".to_string(),
            chunk_index: index,
            total_chunks: total,
        }
    }

    #[tokio::test]
    async fn identifiers_are_dense_and_start_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(&dir.path().join("chunks.db")).await.unwrap();

        let ids = store
            .insert_batch(&[
                chunk("first", "doc.txt", 0, 2),
                chunk("second", "doc.txt", 1, 2),
            ])
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(store.count().await.unwrap(), 2);

        let more = store.insert_batch(&[chunk("third", "other.txt", 0, 1)]).await.unwrap();
        assert_eq!(more, vec![3]);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(&dir.path().join("chunks.db")).await.unwrap();
        assert!(store.insert_batch(&[]).await.unwrap().is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn get_many_preserves_order_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(&dir.path().join("chunks.db")).await.unwrap();
        store
            .insert_batch(&[
                chunk("a", "s.txt", 0, 3),
                chunk("b", "s.txt", 1, 3),
                chunk("c", "s.txt", 2, 3),
            ])
            .await
            .unwrap();

        let records = store.get_many(&[3, 99, 1, 3]).await.unwrap();
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[tokio::test]
    async fn records_carry_a_content_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(&dir.path().join("chunks.db")).await.unwrap();
        store.insert_batch(&[chunk("payload", "s.txt", 0, 1)]).await.unwrap();

        let record = store.get(1).await.unwrap().unwrap();
        assert_eq!(record.vector_digest.as_deref(), Some(content_digest("payload").as_str()));
        assert!(!record.created_at.is_empty());
    }

    #[tokio::test]
    async fn source_uri_lookup_returns_chunks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(&dir.path().join("chunks.db")).await.unwrap();
        store
            .insert_batch(&[
                chunk("p1", "a.txt", 1, 2),
                chunk("p0", "a.txt", 0, 2),
                chunk("x", "b.txt", 0, 1),
            ])
            .await
            .unwrap();

        let records = store.by_source("a.txt").await.unwrap();
        let indexes: Vec<i64> = records.iter().map(|r| r.chunk_index).collect();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[tokio::test]
    async fn reset_restarts_identifier_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ChunkStore::open(&dir.path().join("chunks.db")).await.unwrap();
        store
            .insert_batch(&[chunk("old", "s.txt", 0, 1), chunk("old2", "s.txt", 0, 1)])
            .await
            .unwrap();

        store.reset().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);

        let ids = store
            .insert_batch(&[chunk("x", "s.txt", 0, 2), chunk("y", "s.txt", 1, 2)])
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
    }
}
