//! Fan-out retrieval over many per-document indexes.
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::config;
use crate::discovery::IndexDiscovery;
use crate::embedding::{self, Embedder};
use crate::error::RetrievalError;
use crate::model::RetrievedDocument;
use crate::vector::VectorStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalSettings {
    /// Hits taken from each index.
    pub top_k: usize,
    /// Cap on the merged result.
    pub max_documents: usize,
    /// Indexes queried at the same time.
    pub concurrency: usize,
    pub branch_timeout: Duration,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self::from(&config::Retrieval::default())
    }
}

impl From<&config::Retrieval> for RetrievalSettings {
    fn from(cfg: &config::Retrieval) -> Self {
        Self {
            top_k: cfg.top_k,
            max_documents: cfg.max_documents,
            concurrency: cfg.concurrency.max(1),
            branch_timeout: cfg.branch_timeout(),
        }
    }
}

/// Retriever bound to the indexes a requester could open.
pub struct MultiIndexRetriever {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    indexes: Vec<String>,
    settings: RetrievalSettings,
}

impl std::fmt::Debug for MultiIndexRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiIndexRetriever")
            .field("indexes", &self.indexes)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl MultiIndexRetriever {
    /// Discover the requester's indexes and keep those that can be opened.
    #[instrument(skip(discovery, embedder, vectors, settings))]
    pub async fn build(
        discovery: &IndexDiscovery,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        settings: RetrievalSettings,
        requester: &str,
    ) -> Result<Self, RetrievalError> {
        let names = discovery.discover(requester).await?;
        let mut indexes = Vec::with_capacity(names.len());
        for name in names {
            match vectors.open_index(&name).await {
                Ok(()) => indexes.push(name),
                Err(err) => debug!(?err, index = %name, "skipping index"),
            }
        }
        if indexes.is_empty() {
            return Err(RetrievalError::NoUsableIndex(requester.to_string()));
        }
        Ok(Self {
            embedder,
            vectors,
            indexes,
            settings,
        })
    }

    pub fn index_names(&self) -> &[String] {
        &self.indexes
    }

    /// Query every index with the same embedded query and merge the hits.
    ///
    /// Failed or timed-out branches are skipped. Hits are concatenated in index
    /// order, deduplicated by content (first wins) and capped.
    #[instrument(skip(self))]
    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        let vector = embedding::embed_query(self.embedder.as_ref(), query).await?;
        let vector = &vector;
        let top_k = self.settings.top_k;
        let timeout = self.settings.branch_timeout;

        let branches: Vec<Vec<RetrievedDocument>> = stream::iter(self.indexes.iter())
            .map(|name| async move {
                match tokio::time::timeout(timeout, self.vectors.search(name, vector, top_k)).await {
                    Ok(Ok(docs)) => docs,
                    Ok(Err(err)) => {
                        warn!(?err, index = %name, "index query failed");
                        Vec::new()
                    }
                    Err(_) => {
                        warn!(index = %name, timeout_ms = timeout.as_millis() as u64, "index query timed out");
                        Vec::new()
                    }
                }
            })
            .buffered(self.settings.concurrency)
            .collect()
            .await;

        let all: Vec<RetrievedDocument> = branches.into_iter().flatten().collect();
        if all.is_empty() {
            return Err(RetrievalError::NothingRetrieved);
        }
        Ok(merge_documents(all, self.settings.max_documents))
    }
}

/// Drop empty and repeated contents (first occurrence wins) and keep at most `cap`.
pub fn merge_documents(
    docs: impl IntoIterator<Item = RetrievedDocument>,
    cap: usize,
) -> Vec<RetrievedDocument> {
    let mut seen = HashSet::new();
    docs.into_iter()
        .filter(|doc| !doc.content.is_empty() && seen.insert(doc.content.clone()))
        .take(cap)
        .collect()
}
