use anyhow::{anyhow, Result};
use article_rag::db;
use article_rag::embedding::Embedder;
use article_rag::model::{ArticleStatus, RetrievedDocument, SourceArticle};
use article_rag::source::{ContentSource, SqlContentSource};
use article_rag::sync::{dispatch_pending, index_pending, sync_once, CycleOutcome, SyncContext, SyncService};
use article_rag::vector::{self, SqliteVectorStore, VectorDocument, VectorStore};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};

async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

async fn setup_replica() -> SqlitePool {
    let pool = memory_pool().await;
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

async fn setup_blog() -> SqlitePool {
    let pool = memory_pool().await;
    sqlx::query(
        "CREATE TABLE published_articles (id INTEGER PRIMARY KEY, title TEXT NOT NULL, \
         content TEXT NOT NULL, author_id INTEGER NOT NULL, status INTEGER NOT NULL, \
         ctime INTEGER NOT NULL, utime INTEGER NOT NULL)",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool
}

const PUBLISHED: i64 = 2;
const DRAFT: i64 = 1;

async fn put_article(blog: &SqlitePool, id: i64, status: i64, utime: i64, content: &str) {
    sqlx::query(
        "INSERT INTO published_articles (id, title, content, author_id, status, ctime, utime) \
         VALUES (?, ?, ?, 5, ?, 1, ?) \
         ON CONFLICT(id) DO UPDATE SET content = excluded.content, status = excluded.status, utime = excluded.utime",
    )
    .bind(id)
    .bind(format!("title {}", id))
    .bind(content)
    .bind(status)
    .bind(utime)
    .execute(blog)
    .await
    .unwrap();
}

/// Deterministic 4-dimensional embedding derived from the text bytes.
struct HashEmbedder;

#[async_trait::async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        4
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![1.0f32; 4];
                for b in t.bytes() {
                    v[(b % 4) as usize] += 1.0;
                }
                v
            })
            .collect())
    }
}

/// Real SQLite vector store whose `store` fails for selected indexes.
#[derive(Clone)]
struct FlakyVectors {
    inner: Arc<SqliteVectorStore>,
    failing: Arc<Mutex<HashSet<String>>>,
    stored: Arc<Mutex<Vec<String>>>,
}

impl FlakyVectors {
    async fn new() -> Self {
        let inner = SqliteVectorStore::from_pool(memory_pool().await).await.unwrap();
        Self {
            inner: Arc::new(inner),
            failing: Arc::default(),
            stored: Arc::default(),
        }
    }

    async fn fail(&self, index: String) {
        self.failing.lock().await.insert(index);
    }

    async fn heal(&self) {
        self.failing.lock().await.clear();
    }

    async fn stored(&self) -> Vec<String> {
        self.stored.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl VectorStore for FlakyVectors {
    async fn create_index(&self, name: &str, dims: usize) -> Result<()> {
        self.inner.create_index(name, dims).await
    }

    async fn open_index(&self, name: &str) -> Result<()> {
        self.inner.open_index(name).await
    }

    async fn store(&self, index: &str, docs: &[VectorDocument]) -> Result<()> {
        if self.failing.lock().await.contains(index) {
            return Err(anyhow!("backend unavailable for {}", index));
        }
        self.stored.lock().await.push(index.to_string());
        self.inner.store(index, docs).await
    }

    async fn search(&self, index: &str, vector: &[f32], top_k: usize) -> Result<Vec<RetrievedDocument>> {
        self.inner.search(index, vector, top_k).await
    }

    async fn list_indexes(&self) -> Result<Vec<String>> {
        self.inner.list_indexes().await
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        self.inner.drop_index(name).await
    }
}

struct FailingSource;

#[async_trait::async_trait]
impl ContentSource for FailingSource {
    fn table_name(&self) -> &str {
        "published_articles"
    }

    async fn fetch_published_since(&self, _since: i64) -> Result<Vec<SourceArticle>> {
        Err(anyhow!("connection refused"))
    }
}

/// Source that blocks inside the query until released.
struct GatedSource {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait::async_trait]
impl ContentSource for GatedSource {
    fn table_name(&self) -> &str {
        "published_articles"
    }

    async fn fetch_published_since(&self, _since: i64) -> Result<Vec<SourceArticle>> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Vec::new())
    }
}

/// Delegates to an inner source but fails its first query.
struct RecoveringSource {
    inner: SqlContentSource,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ContentSource for RecoveringSource {
    fn table_name(&self) -> &str {
        self.inner.table_name()
    }

    async fn fetch_published_since(&self, since: i64) -> Result<Vec<SourceArticle>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(anyhow!("source not reachable yet"));
        }
        self.inner.fetch_published_since(since).await
    }
}

fn context(replica: &SqlitePool, source: Arc<dyn ContentSource>, vectors: &FlakyVectors) -> SyncContext {
    SyncContext {
        replica: replica.clone(),
        source,
        embedder: Arc::new(HashEmbedder),
        vectors: Arc::new(vectors.clone()),
    }
}

fn sql_source(blog: &SqlitePool) -> Arc<dyn ContentSource> {
    Arc::new(SqlContentSource::new(blog.clone(), "published_articles"))
}

async fn watermark(replica: &SqlitePool) -> Option<i64> {
    db::get_watermark(replica, "published_articles")
        .await
        .unwrap()
        .map(|w| w.last_utime)
}

#[tokio::test]
async fn first_cycle_copies_published_and_skips_drafts() {
    let replica = setup_replica().await;
    let blog = setup_blog().await;
    let vectors = FlakyVectors::new().await;
    put_article(&blog, 1, PUBLISHED, 100, "first").await;
    put_article(&blog, 2, DRAFT, 150, "draft").await;
    put_article(&blog, 3, PUBLISHED, 200, "second").await;

    assert_eq!(watermark(&replica).await, None);
    let ctx = context(&replica, sql_source(&blog), &vectors);
    let report = sync_once(&ctx).await.unwrap();

    assert_eq!(report.candidates, 2);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.watermark, 200);
    assert_eq!(watermark(&replica).await, Some(200));

    let articles = db::list_articles(&replica).await.unwrap();
    let ids: Vec<_> = articles.iter().map(|a| a.external_id).collect();
    assert_eq!(ids, vec![1, 3]);
    assert!(db::find_article_by_external_id(&replica, 2).await.unwrap().is_none());

    let first = &articles[0];
    assert_eq!(first.title, "title 1");
    assert_eq!(first.content, "first");
    assert_eq!(first.author_id, 5);
    assert_eq!(first.external_utime, 100);

    // Both got indexed within the same cycle.
    assert_eq!(report.indexing.indexed, 2);
    assert!(articles.iter().all(|a| a.indexed));
    let stored = vectors.stored().await;
    assert!(stored.contains(&vector::article_index_name(5, 1)));
    assert!(stored.contains(&vector::article_index_name(5, 3)));
}

#[tokio::test]
async fn repeated_cycle_without_changes_is_a_no_op() {
    let replica = setup_replica().await;
    let blog = setup_blog().await;
    let vectors = FlakyVectors::new().await;
    put_article(&blog, 7, PUBLISHED, 100, "body").await;
    let ctx = context(&replica, sql_source(&blog), &vectors);

    sync_once(&ctx).await.unwrap();
    let before = db::list_articles(&replica).await.unwrap();

    let report = sync_once(&ctx).await.unwrap();
    assert_eq!(report.candidates, 0);
    assert_eq!(report.watermark, 100);
    assert_eq!(report.indexing.pending, 0);

    let after = db::list_articles(&replica).await.unwrap();
    assert_eq!(before.len(), after.len());
    assert_eq!(before[0].content_revision, after[0].content_revision);
    assert_eq!(before[0].updated_at, after[0].updated_at);
    assert_eq!(watermark(&replica).await, Some(100));
}

#[tokio::test]
async fn changed_article_is_overwritten_and_pending_again() {
    let replica = setup_replica().await;
    let blog = setup_blog().await;
    let vectors = FlakyVectors::new().await;
    put_article(&blog, 7, PUBLISHED, 100, "old content").await;
    let ctx = context(&replica, sql_source(&blog), &vectors);

    sync_once(&ctx).await.unwrap();
    assert!(db::find_article_by_external_id(&replica, 7).await.unwrap().unwrap().indexed);

    // Keep the re-index from succeeding so the pending flag stays observable.
    vectors.fail(vector::article_index_name(5, 7)).await;
    put_article(&blog, 7, PUBLISHED, 300, "new content").await;
    let report = sync_once(&ctx).await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.indexing.failed, 1);

    let row = db::find_article_by_external_id(&replica, 7).await.unwrap().unwrap();
    assert_eq!(row.content, "new content");
    assert_eq!(row.external_utime, 300);
    assert!(!row.indexed);
    assert_eq!(watermark(&replica).await, Some(300));

    vectors.heal().await;
    let report = index_pending(&ctx).await.unwrap();
    assert_eq!(report.indexed, 1);
    let row = db::find_article_by_external_id(&replica, 7).await.unwrap().unwrap();
    assert!(row.indexed);
    assert_eq!(row.indexed_revision, Some(row.content_revision));
}

#[tokio::test]
async fn dispatcher_leaves_only_failed_records_pending() {
    let replica = setup_replica().await;
    let blog = setup_blog().await;
    let vectors = FlakyVectors::new().await;
    for (id, utime) in [(1, 10), (2, 20), (3, 30)] {
        put_article(&blog, id, PUBLISHED, utime, &format!("content {}", id)).await;
    }
    vectors.fail(vector::article_index_name(5, 2)).await;
    let ctx = context(&replica, sql_source(&blog), &vectors);

    let report = sync_once(&ctx).await.unwrap();
    assert_eq!(report.indexing.indexed, 2);
    assert_eq!(report.indexing.failed, 1);
    // Indexing failures never hold back the watermark.
    assert_eq!(report.watermark, 30);

    let pending = db::list_pending_articles(&replica).await.unwrap();
    let pending_ids: Vec<_> = pending.iter().map(|p| p.external_id).collect();
    assert_eq!(pending_ids, vec![2]);

    vectors.heal().await;
    let report = index_pending(&ctx).await.unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(report.indexed, 1);
    assert!(db::list_pending_articles(&replica).await.unwrap().is_empty());

    let registered = db::list_indexes_for_owner(&replica, &db::author_owner(5)).await.unwrap();
    assert_eq!(registered.len(), 3);
}

#[tokio::test]
async fn failed_upsert_is_skipped_and_holds_back_watermark() {
    let replica = setup_replica().await;
    sqlx::query(
        "CREATE TRIGGER reject_13 BEFORE INSERT ON synced_articles \
         WHEN NEW.external_id = 13 BEGIN SELECT RAISE(ABORT, 'rejected'); END",
    )
    .execute(&replica)
    .await
    .unwrap();
    let blog = setup_blog().await;
    let vectors = FlakyVectors::new().await;
    put_article(&blog, 12, PUBLISHED, 100, "a").await;
    put_article(&blog, 13, PUBLISHED, 150, "b").await;
    put_article(&blog, 14, PUBLISHED, 200, "c").await;
    let ctx = context(&replica, sql_source(&blog), &vectors);

    let report = sync_once(&ctx).await.unwrap();
    assert_eq!(report.candidates, 3);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.failed, 1);
    // Siblings are written, but the watermark stays below the failed record.
    assert_eq!(report.watermark, 100);
    assert!(db::find_article_by_external_id(&replica, 13).await.unwrap().is_none());
    assert!(db::find_article_by_external_id(&replica, 14).await.unwrap().is_some());

    // While the record keeps failing, its already-written sibling is pulled
    // again but neither bumped nor re-embedded.
    let stored_before = vectors.stored().await.len();
    let row_before = db::find_article_by_external_id(&replica, 14).await.unwrap().unwrap();
    let report = sync_once(&ctx).await.unwrap();
    assert_eq!(report.candidates, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.indexing.pending, 0);
    assert_eq!(report.watermark, 100);
    assert_eq!(vectors.stored().await.len(), stored_before);
    let row_after = db::find_article_by_external_id(&replica, 14).await.unwrap().unwrap();
    assert!(row_after.indexed);
    assert_eq!(row_after.content_revision, row_before.content_revision);

    sqlx::query("DROP TRIGGER reject_13").execute(&replica).await.unwrap();
    let report = sync_once(&ctx).await.unwrap();
    assert_eq!(report.candidates, 2);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.updated, 0);
    assert_eq!(report.watermark, 200);
    assert!(db::find_article_by_external_id(&replica, 13).await.unwrap().is_some());
}

#[tokio::test]
async fn source_failure_aborts_cycle_without_touching_watermark() {
    let replica = setup_replica().await;
    let vectors = FlakyVectors::new().await;
    let ctx = context(&replica, Arc::new(FailingSource), &vectors);

    assert!(sync_once(&ctx).await.is_err());
    assert_eq!(watermark(&replica).await, None);
    assert!(db::list_articles(&replica).await.unwrap().is_empty());
}

#[tokio::test]
async fn watermark_is_non_decreasing_across_cycles() {
    let replica = setup_replica().await;
    let blog = setup_blog().await;
    let vectors = FlakyVectors::new().await;
    let ctx = context(&replica, sql_source(&blog), &vectors);

    let mut seen = Vec::new();
    for (id, utime) in [(1, 50), (2, 40), (3, 90), (4, 90), (5, 120)] {
        put_article(&blog, id, PUBLISHED, utime, "x").await;
        let report = sync_once(&ctx).await.unwrap();
        seen.push(report.watermark);
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
    assert_eq!(seen.last(), Some(&120));
    // utime 40 arrived after the watermark passed it and is never pulled.
    assert!(db::find_article_by_external_id(&replica, 2).await.unwrap().is_none());
}

#[tokio::test]
async fn overlapping_cycles_are_skipped() {
    let replica = setup_replica().await;
    let vectors = FlakyVectors::new().await;
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let source = GatedSource {
        entered: entered.clone(),
        release: release.clone(),
    };
    let service = Arc::new(SyncService::new(
        context(&replica, Arc::new(source), &vectors),
        Duration::from_secs(60),
    ));

    let first = tokio::spawn({
        let service = service.clone();
        async move { service.run_cycle().await }
    });
    entered.notified().await;

    assert_eq!(service.run_cycle().await.unwrap(), CycleOutcome::Skipped);
    assert!(service.run_index_pass().await.unwrap().is_none());

    release.notify_one();
    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, CycleOutcome::Completed(_)));
}

#[tokio::test]
async fn scheduler_runs_immediately_and_stops_on_shutdown() {
    let replica = setup_replica().await;
    let blog = setup_blog().await;
    let vectors = FlakyVectors::new().await;
    put_article(&blog, 1, PUBLISHED, 100, "hello").await;
    let service = Arc::new(SyncService::new(
        context(&replica, sql_source(&blog), &vectors),
        Duration::from_secs(3600),
    ));

    let (tx, rx) = watch::channel(false);
    let handle = service.start(rx);

    let mut synced = false;
    for _ in 0..100 {
        if watermark(&replica).await == Some(100) {
            synced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(synced, "first cycle did not run at startup");

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
}

async fn wait_for_watermark(replica: &SqlitePool, expected: i64) -> bool {
    for _ in 0..250 {
        if watermark(replica).await == Some(expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn scheduler_keeps_ticking_after_a_failed_cycle() {
    let replica = setup_replica().await;
    let blog = setup_blog().await;
    let vectors = FlakyVectors::new().await;
    put_article(&blog, 1, PUBLISHED, 100, "hello").await;
    let source = Arc::new(RecoveringSource {
        inner: SqlContentSource::new(blog.clone(), "published_articles"),
        calls: AtomicUsize::new(0),
    });
    let service = Arc::new(SyncService::new(
        context(&replica, source.clone(), &vectors),
        Duration::from_millis(50),
    ));

    let (tx, rx) = watch::channel(false);
    let handle = service.start(rx);

    // The startup cycle fails; a later tick recovers.
    assert!(wait_for_watermark(&replica, 100).await, "no cycle after the failed one");
    assert!(source.calls.load(Ordering::SeqCst) >= 2);

    // Ticks keep coming and pick up new changes.
    put_article(&blog, 2, PUBLISHED, 200, "later").await;
    assert!(wait_for_watermark(&replica, 200).await, "interval stopped firing");
    assert!(db::find_article_by_external_id(&replica, 2).await.unwrap().is_some());

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
}

#[tokio::test]
async fn indexing_pass_runs_without_a_source() {
    let replica = setup_replica().await;
    let vectors = FlakyVectors::new().await;
    let article = SourceArticle {
        id: 21,
        title: "offline".into(),
        content: "indexed without the blog".into(),
        author_id: 5,
        status: ArticleStatus::Published,
        ctime: 1,
        utime: 10,
    };
    db::upsert_article(&replica, &article).await.unwrap();

    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder);
    let store: Arc<dyn VectorStore> = Arc::new(vectors.clone());
    let report = dispatch_pending(&replica, &embedder, &store).await.unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(report.indexed, 1);
    assert!(db::find_article_by_external_id(&replica, 21).await.unwrap().unwrap().indexed);
    assert_eq!(vectors.stored().await, vec![vector::article_index_name(5, 21)]);
}
