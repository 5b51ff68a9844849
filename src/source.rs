//! External content store, read-only.
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::fmt;
use tracing::{debug, instrument};

use crate::config;
use crate::db;
use crate::model::{ArticleStatus, SourceArticle};

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Name of the source table; keys the watermark row.
    fn table_name(&self) -> &str;

    /// Published records with `utime > since`, ordered by `utime` ascending.
    async fn fetch_published_since(&self, since: i64) -> Result<Vec<SourceArticle>>;
}

/// Reads the published-articles table of an external SQLite database.
#[derive(Clone)]
pub struct SqlContentSource {
    pool: SqlitePool,
    table: String,
}

impl fmt::Debug for SqlContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlContentSource")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl SqlContentSource {
    /// `table` must already be validated as a plain identifier.
    pub fn new(pool: SqlitePool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    pub async fn connect(cfg: &config::Source) -> Result<Self> {
        let url = db::prepare_sqlite_url(&cfg.database_url);
        let pool = SqlitePool::connect(&url)
            .await
            .context("failed to connect to content source")?;
        Ok(Self::new(pool, cfg.table.clone()))
    }
}

#[async_trait]
impl ContentSource for SqlContentSource {
    fn table_name(&self) -> &str {
        &self.table
    }

    #[instrument(skip(self))]
    async fn fetch_published_since(&self, since: i64) -> Result<Vec<SourceArticle>> {
        let sql = format!(
            "SELECT id, title, content, author_id, status, ctime, utime FROM {} \
             WHERE status = ? AND utime > ? ORDER BY utime ASC, id ASC",
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(ArticleStatus::PUBLISHED_CODE))
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to query {}", self.table))?;
        debug!(count = rows.len(), since, "fetched source rows");

        rows.into_iter()
            .map(|row| -> Result<SourceArticle> {
                Ok(SourceArticle {
                    id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    content: row.try_get("content")?,
                    author_id: row.try_get("author_id")?,
                    status: ArticleStatus::from_code(row.try_get("status")?),
                    ctime: row.try_get("ctime")?,
                    utime: row.try_get("utime")?,
                })
            })
            .collect()
    }
}
