//! Writes documents into one per-document vector index.
use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::db::{self, Pool};
use crate::embedding::Embedder;
use crate::vector::{self, VectorDocument, VectorStore};

/// Document id used for a whole uploaded file; re-uploads overwrite it.
const FILE_DOC_ID: &str = "doc_1";

/// Indexer bound to a single index. Opening it creates the index if needed.
pub struct Indexer {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    stem: String,
    index: String,
}

impl Indexer {
    pub async fn open(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        stem: impl Into<String>,
    ) -> Result<Self> {
        let stem = stem.into();
        let index = vector::index_name(&stem);
        store
            .create_index(&index, embedder.dims())
            .await
            .with_context(|| format!("failed to init index {}", index))?;
        Ok(Self {
            embedder,
            store,
            stem,
            index,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    /// Embed `content` and store it as one document keyed by `doc_id`.
    #[instrument(skip(self, content), fields(index = %self.index))]
    pub async fn index_content(&self, doc_id: &str, content: &str, source: &str) -> Result<()> {
        let mut vectors = self
            .embedder
            .embed(&[content.to_string()])
            .await
            .context("failed to embed document")?;
        let vector = vectors
            .pop()
            .ok_or_else(|| anyhow!("embedder returned no vector"))?;

        let mut metadata = Map::new();
        metadata.insert("source".into(), Value::from(source));
        let doc = VectorDocument {
            key: vector::document_key(&self.stem, doc_id),
            content: content.to_string(),
            metadata,
            vector,
        };
        self.store
            .store(&self.index, &[doc])
            .await
            .context("failed to store document")
    }

    /// Read a file and index its whole content as a single document.
    pub async fn index_file(&self, path: &Path) -> Result<()> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read file: {}", path.display()))?;
        self.index_content(FILE_DOC_ID, &content, &path.to_string_lossy())
            .await?;
        info!(index = %self.index, path = %path.display(), "indexed file");
        Ok(())
    }
}

/// Remove an index and its documents from the backend.
pub async fn delete_index(store: &dyn VectorStore, index: &str) -> Result<()> {
    store
        .drop_index(index)
        .await
        .with_context(|| format!("failed to delete index {}", index))
}

/// Drop `owner`'s registration of an uploaded file's index.
///
/// Upload index names depend only on the filename, so several owners can
/// share one backend index. It is dropped only once nobody is registered for
/// it anymore; returns whether that happened.
#[instrument(skip(replica, store))]
pub async fn remove_upload(
    replica: &Pool,
    store: &dyn VectorStore,
    owner: &str,
    filename: &str,
) -> Result<bool> {
    let index = vector::upload_index_name(filename);
    db::unregister_index(replica, owner, &index).await?;
    if db::count_index_owners(replica, &index).await? > 0 {
        info!(index = %index, "index still registered by other owners; kept");
        return Ok(false);
    }
    delete_index(store, &index).await?;
    Ok(true)
}
