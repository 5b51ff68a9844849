use super::model::{PendingArticle, RegisteredIndex, UpsertOutcome};
use crate::model::{ArticleStatus, IndexKind, ReplicaArticle, SourceArticle, SyncWatermark};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open sqlite database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask sqlx to create the file. In-memory URLs and
/// read-only (`mode=ro`) URLs are left alone.
pub fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    let read_only = query_part.is_some_and(|q| q.split('&').any(|kv| kv == "mode=ro"));
    if !read_only {
        if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---- watermark ----

/// Current watermark for `table_name`, or `None` before the first advance.
#[instrument(skip_all)]
pub async fn get_watermark(pool: &Pool, table_name: &str) -> Result<Option<SyncWatermark>> {
    let row = sqlx::query("SELECT table_name, last_utime, updated_at FROM sync_states WHERE table_name = ?")
        .bind(table_name)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(SyncWatermark {
        table_name: row.get("table_name"),
        last_utime: row.get("last_utime"),
        updated_at: row.get("updated_at"),
    }))
}

/// Move the watermark to `utime` unless the stored value is already higher.
/// Returns the value stored after the write.
#[instrument(skip_all)]
pub async fn advance_watermark(pool: &Pool, table_name: &str, utime: i64) -> Result<i64> {
    let stored: i64 = sqlx::query_scalar(
        "INSERT INTO sync_states (table_name, last_utime, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(table_name) DO UPDATE SET \
             last_utime = MAX(sync_states.last_utime, excluded.last_utime), \
             updated_at = excluded.updated_at \
         RETURNING last_utime",
    )
    .bind(table_name)
    .bind(utime)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to persist sync watermark")?;
    Ok(stored)
}

// ---- replica ----

const ARTICLE_COLUMNS: &str = "id, external_id, author_id, title, content, status, external_ctime, \
     external_utime, is_indexed, content_revision, indexed_revision, created_at, updated_at";

fn article_from_row(row: &SqliteRow) -> Result<ReplicaArticle> {
    Ok(ReplicaArticle {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        author_id: row.try_get("author_id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        status: ArticleStatus::from_code(row.try_get("status")?),
        external_ctime: row.try_get("external_ctime")?,
        external_utime: row.try_get("external_utime")?,
        indexed: row.try_get("is_indexed")?,
        content_revision: row.try_get("content_revision")?,
        indexed_revision: row.try_get("indexed_revision")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[instrument(skip_all)]
pub async fn find_article_by_external_id(
    pool: &Pool,
    external_id: i64,
) -> Result<Option<ReplicaArticle>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM synced_articles WHERE external_id = ?",
        ARTICLE_COLUMNS
    ))
    .bind(external_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(article_from_row).transpose()
}

/// Reconcile one source record into the replica keyed by external id.
///
/// A new row starts pending. An existing row gets title/content/status/utime
/// overwritten, its revision bumped and is made pending again. A record that
/// matches the stored snapshot exactly (same `utime`, title, content and
/// status) is left untouched, so re-pulling it does not trigger a re-index.
#[instrument(skip_all, fields(external_id = article.id))]
pub async fn upsert_article(pool: &Pool, article: &SourceArticle) -> Result<UpsertOutcome> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();
    let existing = sqlx::query(
        "SELECT id, title, content, status, external_utime FROM synced_articles WHERE external_id = ?",
    )
    .bind(article.id)
    .fetch_optional(&mut *tx)
    .await?;
    let existing = match existing {
        Some(row) => {
            let id: i64 = row.try_get("id")?;
            let unchanged = row.try_get::<i64, _>("external_utime")? == article.utime
                && row.try_get::<String, _>("title")? == article.title
                && row.try_get::<String, _>("content")? == article.content
                && row.try_get::<i64, _>("status")? == i64::from(article.status.code());
            if unchanged {
                tx.commit().await?;
                return Ok(UpsertOutcome::Unchanged(id));
            }
            Some(id)
        }
        None => None,
    };

    let outcome = match existing {
        None => {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO synced_articles (external_id, author_id, title, content, status, \
                     external_ctime, external_utime, is_indexed, content_revision, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, 0, 1, ?, ?) RETURNING id",
            )
            .bind(article.id)
            .bind(article.author_id)
            .bind(&article.title)
            .bind(&article.content)
            .bind(i64::from(article.status.code()))
            .bind(article.ctime)
            .bind(article.utime)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            UpsertOutcome::Inserted(id)
        }
        Some(id) => {
            sqlx::query(
                "UPDATE synced_articles SET title = ?, content = ?, status = ?, external_utime = ?, \
                     is_indexed = 0, content_revision = content_revision + 1, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(&article.title)
            .bind(&article.content)
            .bind(i64::from(article.status.code()))
            .bind(article.utime)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            UpsertOutcome::Updated(id)
        }
    };
    tx.commit().await?;
    Ok(outcome)
}

/// Replica rows whose current revision has not been indexed yet.
#[instrument(skip_all)]
pub async fn list_pending_articles(pool: &Pool) -> Result<Vec<PendingArticle>> {
    let rows = sqlx::query(
        "SELECT id, external_id, author_id, title, content, content_revision \
         FROM synced_articles WHERE is_indexed = 0 ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;

    let pending = rows
        .into_iter()
        .map(|row| PendingArticle {
            id: row.get("id"),
            external_id: row.get("external_id"),
            author_id: row.get("author_id"),
            title: row.get("title"),
            content: row.get("content"),
            content_revision: row.get("content_revision"),
        })
        .collect();
    Ok(pending)
}

/// Mark `id` indexed for `revision`. Returns false when the row moved on to a
/// newer revision in the meantime; it then stays pending.
#[instrument(skip_all)]
pub async fn mark_article_indexed(pool: &Pool, id: i64, revision: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE synced_articles SET is_indexed = 1, indexed_revision = ?, updated_at = ? \
         WHERE id = ? AND content_revision = ?",
    )
    .bind(revision)
    .bind(Utc::now())
    .bind(id)
    .bind(revision)
    .execute(pool)
    .await
    .context("failed to mark article indexed")?;
    Ok(res.rows_affected() == 1)
}

pub async fn list_articles(pool: &Pool) -> Result<Vec<ReplicaArticle>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM synced_articles ORDER BY id ASC",
        ARTICLE_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(article_from_row).collect()
}

pub async fn list_articles_by_author(pool: &Pool, author_id: i64) -> Result<Vec<ReplicaArticle>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM synced_articles WHERE author_id = ? ORDER BY id ASC",
        ARTICLE_COLUMNS
    ))
    .bind(author_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(article_from_row).collect()
}

// ---- index registry ----

/// Owner label under which article indexes are registered.
pub fn author_owner(author_id: i64) -> String {
    format!("author:{}", author_id)
}

#[instrument(skip_all)]
pub async fn register_index(pool: &Pool, owner: &str, index_name: &str, kind: IndexKind) -> Result<()> {
    sqlx::query(
        "INSERT INTO index_registry (owner, index_name, kind, created_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(owner, index_name) DO NOTHING",
    )
    .bind(owner)
    .bind(index_name)
    .bind(kind.as_str())
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to register index")?;
    Ok(())
}

/// Remove `owner`'s registration of `index_name`. Other owners keep theirs.
#[instrument(skip_all)]
pub async fn unregister_index(pool: &Pool, owner: &str, index_name: &str) -> Result<u64> {
    let res = sqlx::query("DELETE FROM index_registry WHERE owner = ? AND index_name = ?")
        .bind(owner)
        .bind(index_name)
        .execute(pool)
        .await
        .context("failed to unregister index")?;
    Ok(res.rows_affected())
}

/// Number of owners still registered for `index_name`.
pub async fn count_index_owners(pool: &Pool, index_name: &str) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM index_registry WHERE index_name = ?")
        .bind(index_name)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

fn registered_from_row(row: &SqliteRow) -> Result<RegisteredIndex> {
    let kind: String = row.try_get("kind")?;
    Ok(RegisteredIndex {
        owner: row.try_get("owner")?,
        index_name: row.try_get("index_name")?,
        kind: IndexKind::parse_kind(&kind).ok_or_else(|| anyhow!("unknown index kind {}", kind))?,
    })
}

/// Indexes registered for exactly `owner`, in registration order.
pub async fn list_indexes_for_owner(pool: &Pool, owner: &str) -> Result<Vec<RegisteredIndex>> {
    let rows = sqlx::query(
        "SELECT owner, index_name, kind FROM index_registry WHERE owner = ? ORDER BY id ASC",
    )
    .bind(owner)
    .fetch_all(pool)
    .await?;
    rows.iter().map(registered_from_row).collect()
}

/// Every registered index of `kind`, in registration order.
pub async fn list_indexes_by_kind(pool: &Pool, kind: IndexKind) -> Result<Vec<RegisteredIndex>> {
    let rows = sqlx::query(
        "SELECT owner, index_name, kind FROM index_registry WHERE kind = ? ORDER BY id ASC",
    )
    .bind(kind.as_str())
    .fetch_all(pool)
    .await?;
    rows.iter().map(registered_from_row).collect()
}
