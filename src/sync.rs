//! Incremental article sync: watermark-driven pull, replica upsert and
//! re-index dispatch, plus the interval scheduler that drives it.
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::db::{self, Pool, UpsertOutcome};
use crate::embedding::Embedder;
use crate::indexer::Indexer;
use crate::model::IndexKind;
use crate::source::ContentSource;
use crate::vector::{self, VectorStore};

/// Source metadata value stored with article documents.
const ARTICLE_DOC_SOURCE: &str = "database";

/// Handles shared by every sync cycle. Built once at startup.
#[derive(Clone)]
pub struct SyncContext {
    pub replica: Pool,
    pub source: Arc<dyn ContentSource>,
    pub embedder: Arc<dyn Embedder>,
    pub vectors: Arc<dyn VectorStore>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub candidates: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Re-pulled without changes; left as they were.
    pub unchanged: usize,
    pub failed: usize,
    /// Watermark stored after the cycle.
    pub watermark: i64,
    pub indexing: IndexReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub pending: usize,
    pub indexed: usize,
    pub failed: usize,
    /// Indexed, but the row changed meanwhile and stays pending.
    pub superseded: usize,
}

/// Run one pull-reconcile-dispatch cycle.
///
/// A failing source query aborts the cycle before anything is written. A
/// failing upsert only skips that record. The watermark advances through the
/// persisted records but never past a failed one; indexing runs after that
/// and its failures never fail the cycle.
#[instrument(skip_all, fields(table = ctx.source.table_name()))]
pub async fn sync_once(ctx: &SyncContext) -> Result<SyncReport> {
    let table = ctx.source.table_name();
    let since = db::get_watermark(&ctx.replica, table)
        .await?
        .map(|wm| wm.last_utime)
        .unwrap_or(0);

    let candidates = ctx
        .source
        .fetch_published_since(since)
        .await
        .context("failed to query source articles")?;

    let mut report = SyncReport {
        candidates: candidates.len(),
        watermark: since,
        ..Default::default()
    };

    if candidates.is_empty() {
        info!(since, "no new articles to sync");
    } else {
        info!(count = candidates.len(), since, "found articles to sync");
        let mut frontier = Frontier::default();

        for article in &candidates {
            match db::upsert_article(&ctx.replica, article).await {
                Ok(UpsertOutcome::Inserted(id)) => {
                    report.inserted += 1;
                    info!(id, external_id = article.id, title = %article.title, "created local article");
                }
                Ok(UpsertOutcome::Updated(id)) => {
                    report.updated += 1;
                    info!(id, external_id = article.id, title = %article.title, "updated local article");
                }
                Ok(UpsertOutcome::Unchanged(id)) => {
                    report.unchanged += 1;
                    debug!(id, external_id = article.id, "local article already up to date");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(?err, external_id = article.id, "failed to upsert local article");
                    frontier.block(article.utime);
                    continue;
                }
            }
            frontier.persisted(article.utime);
        }

        match frontier.watermark() {
            Some(utime) if utime > since => {
                report.watermark = db::advance_watermark(&ctx.replica, table, utime).await?;
            }
            _ => info!(since, "watermark held back by failed upserts"),
        }
    }

    match index_pending(ctx).await {
        Ok(indexing) => report.indexing = indexing,
        Err(err) => warn!(?err, "failed to index pending articles"),
    }

    Ok(report)
}

/// Highest `utime` the watermark may move to within one ascending pass.
///
/// Records after the first failed upsert are still written but cannot move
/// the watermark past the failed one, so it is pulled again next cycle.
#[derive(Debug, Default)]
struct Frontier {
    reached: Option<i64>,
    blocked_at: Option<i64>,
}

impl Frontier {
    fn persisted(&mut self, utime: i64) {
        if self.blocked_at.is_none() {
            self.reached = Some(self.reached.map_or(utime, |r| r.max(utime)));
        }
    }

    fn block(&mut self, utime: i64) {
        if self.blocked_at.is_none() {
            self.blocked_at = Some(utime);
        }
    }

    fn watermark(&self) -> Option<i64> {
        match (self.reached, self.blocked_at) {
            (Some(reached), Some(blocked)) => Some(reached.min(blocked - 1)),
            (reached, _) => reached,
        }
    }
}

/// Index every replica row whose current revision is not indexed yet.
pub async fn index_pending(ctx: &SyncContext) -> Result<IndexReport> {
    dispatch_pending(&ctx.replica, &ctx.embedder, &ctx.vectors).await
}

/// Indexing pass over the replica alone; needs no content source.
///
/// Each row is handled independently: a failure leaves it pending for the
/// next pass and the loop moves on.
#[instrument(skip_all)]
pub async fn dispatch_pending(
    replica: &Pool,
    embedder: &Arc<dyn Embedder>,
    vectors: &Arc<dyn VectorStore>,
) -> Result<IndexReport> {
    let pending = db::list_pending_articles(replica)
        .await
        .context("failed to query pending articles")?;
    let mut report = IndexReport {
        pending: pending.len(),
        ..Default::default()
    };
    if pending.is_empty() {
        info!("no pending articles to index");
        return Ok(report);
    }
    info!(count = pending.len(), "indexing pending articles");

    for article in pending {
        let stem = vector::article_stem(article.author_id, article.external_id);
        let indexer =
            match Indexer::open(embedder.clone(), vectors.clone(), stem.as_str()).await {
                Ok(indexer) => indexer,
                Err(err) => {
                    report.failed += 1;
                    warn!(?err, id = article.id, "failed to create indexer for article");
                    continue;
                }
            };

        if let Err(err) = indexer
            .index_content(&stem, &article.document_body(), ARTICLE_DOC_SOURCE)
            .await
        {
            report.failed += 1;
            warn!(?err, id = article.id, "failed to index article");
            continue;
        }

        if let Err(err) = db::register_index(
            replica,
            &db::author_owner(article.author_id),
            indexer.index_name(),
            IndexKind::Article,
        )
        .await
        {
            report.failed += 1;
            warn!(?err, id = article.id, "failed to register article index");
            continue;
        }

        match db::mark_article_indexed(replica, article.id, article.content_revision).await {
            Ok(true) => {
                report.indexed += 1;
                info!(
                    id = article.id,
                    external_id = article.external_id,
                    title = %article.title,
                    "indexed article"
                );
            }
            Ok(false) => {
                report.superseded += 1;
                info!(id = article.id, "article changed while indexing; left pending");
            }
            Err(err) => {
                report.failed += 1;
                warn!(?err, id = article.id, "failed to mark article as indexed");
            }
        }
    }

    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(SyncReport),
    /// Another cycle was still running.
    Skipped,
}

/// Periodic driver for [`sync_once`]. At most one cycle runs at a time.
pub struct SyncService {
    ctx: SyncContext,
    interval: Duration,
    running: Mutex<()>,
}

impl SyncService {
    pub fn new(ctx: SyncContext, interval: Duration) -> Self {
        Self {
            ctx,
            interval,
            running: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Run one cycle now unless one is already in progress.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("previous sync cycle still running; skipping");
            return Ok(CycleOutcome::Skipped);
        };
        let span = info_span!("sync_cycle", cycle_id = %Uuid::new_v4());
        sync_once(&self.ctx)
            .instrument(span)
            .await
            .map(CycleOutcome::Completed)
    }

    /// Run one indexing pass, sharing the cycle guard.
    pub async fn run_index_pass(&self) -> Result<Option<IndexReport>> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("sync cycle running; skipping indexing pass");
            return Ok(None);
        };
        index_pending(&self.ctx).await.map(Some)
    }

    async fn tick(&self) {
        match self.run_cycle().await {
            Ok(CycleOutcome::Completed(report)) => info!(
                candidates = report.candidates,
                inserted = report.inserted,
                updated = report.updated,
                failed = report.failed,
                watermark = report.watermark,
                indexed = report.indexing.indexed,
                "sync cycle finished"
            ),
            Ok(CycleOutcome::Skipped) => {}
            Err(err) => error!(?err, "sync cycle failed"),
        }
    }

    /// Spawn the scheduler: one cycle immediately, then one per interval,
    /// until `shutdown` flips to true or its sender is dropped.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "starting article sync service");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("article sync service stopped");
        })
    }
}
