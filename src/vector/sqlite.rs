//! SQLite-backed [`VectorStore`]: vectors stored as little-endian f32 BLOBs,
//! queried by brute-force cosine similarity.
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use super::{cosine_similarity, VectorDocument, VectorStore};
use crate::db;
use crate::model::RetrievedDocument;

#[derive(Debug, Clone)]
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = db::init_pool(database_url)
            .await
            .context("failed to open vector database")?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn index_dims(&self, name: &str) -> Result<Option<usize>> {
        let dims: Option<i64> = sqlx::query_scalar("SELECT dims FROM vector_indexes WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(dims.map(|d| d as usize))
    }
}

async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS vector_indexes (\
             name TEXT PRIMARY KEY, \
             dims INTEGER NOT NULL, \
             created_at TEXT NOT NULL)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS vector_documents (\
             index_name TEXT NOT NULL, \
             doc_key TEXT NOT NULL, \
             content TEXT NOT NULL, \
             metadata TEXT NOT NULL, \
             vector BLOB NOT NULL, \
             PRIMARY KEY (index_name, doc_key))",
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    #[instrument(skip(self))]
    async fn create_index(&self, name: &str, dims: usize) -> Result<()> {
        sqlx::query(
            "INSERT INTO vector_indexes (name, dims, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(dims as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to create vector index")?;

        match self.index_dims(name).await? {
            Some(existing) if existing != dims => {
                bail!("index {} has {} dimensions, expected {}", name, existing, dims)
            }
            _ => Ok(()),
        }
    }

    async fn open_index(&self, name: &str) -> Result<()> {
        self.index_dims(name)
            .await?
            .map(|_| ())
            .ok_or_else(|| anyhow!("vector index {} does not exist", name))
    }

    #[instrument(skip(self, docs), fields(count = docs.len()))]
    async fn store(&self, index: &str, docs: &[VectorDocument]) -> Result<()> {
        let dims = self
            .index_dims(index)
            .await?
            .ok_or_else(|| anyhow!("vector index {} does not exist", index))?;

        let mut tx = self.pool.begin().await?;
        for doc in docs {
            if doc.vector.len() != dims {
                bail!(
                    "document {} has {} dimensions, index {} expects {}",
                    doc.key,
                    doc.vector.len(),
                    index,
                    dims
                );
            }
            let metadata = serde_json::to_string(&doc.metadata)?;
            sqlx::query(
                "INSERT INTO vector_documents (index_name, doc_key, content, metadata, vector) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(index_name, doc_key) DO UPDATE SET \
                     content = excluded.content, metadata = excluded.metadata, vector = excluded.vector",
            )
            .bind(index)
            .bind(&doc.key)
            .bind(&doc.content)
            .bind(metadata)
            .bind(vec_to_blob(&doc.vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, vector))]
    async fn search(&self, index: &str, vector: &[f32], top_k: usize) -> Result<Vec<RetrievedDocument>> {
        let rows = sqlx::query(
            "SELECT doc_key, content, metadata, vector FROM vector_documents WHERE index_name = ?",
        )
        .bind(index)
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.try_get("vector")?;
            let score = cosine_similarity(vector, &blob_to_vec(&blob));
            scored.push((score, row));
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(top_k);
        debug!(index, hits = scored.len(), "vector search");

        scored
            .into_iter()
            .map(|(score, row)| -> Result<RetrievedDocument> {
                let raw: String = row.try_get("metadata")?;
                let mut metadata: Map<String, Value> = serde_json::from_str(&raw).unwrap_or_default();
                metadata.insert("distance".into(), Value::from(f64::from(1.0 - score)));
                Ok(RetrievedDocument {
                    id: row.try_get("doc_key")?,
                    content: row.try_get("content")?,
                    metadata,
                })
            })
            .collect()
    }

    async fn list_indexes(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar("SELECT name FROM vector_indexes ORDER BY created_at ASC, name ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    #[instrument(skip(self))]
    async fn drop_index(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM vector_documents WHERE index_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM vector_indexes WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
