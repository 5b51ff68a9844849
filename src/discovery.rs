//! Resolves the vector indexes a requester may query.
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::config::{self, ArticleScope};
use crate::db::{self, Pool};
use crate::error::RetrievalError;
use crate::model::IndexKind;
use crate::vector::{self, VectorStore};

pub struct IndexDiscovery {
    replica: Pool,
    vectors: Arc<dyn VectorStore>,
    uploads_dir: PathBuf,
    scope: ArticleScope,
    authors: BTreeMap<String, Vec<i64>>,
}

impl IndexDiscovery {
    pub fn new(
        replica: Pool,
        vectors: Arc<dyn VectorStore>,
        uploads_dir: impl Into<PathBuf>,
        scope: ArticleScope,
    ) -> Self {
        Self {
            replica,
            vectors,
            uploads_dir: uploads_dir.into(),
            scope,
            authors: BTreeMap::new(),
        }
    }

    pub fn from_config(cfg: &config::Config, replica: Pool, vectors: Arc<dyn VectorStore>) -> Self {
        Self::new(
            replica,
            vectors,
            &cfg.app.uploads_dir,
            cfg.retrieval.article_scope,
        )
        .with_authors(cfg.retrieval.authors.clone())
    }

    /// Link requesters to the external author ids whose articles they own.
    pub fn with_authors(mut self, authors: BTreeMap<String, Vec<i64>>) -> Self {
        self.authors = authors;
        self
    }

    /// Directory holding `requester`'s uploaded files.
    pub fn user_upload_dir(&self, requester: &str) -> Option<PathBuf> {
        if requester.is_empty()
            || requester == "."
            || requester == ".."
            || requester.contains(['/', '\\'])
        {
            return None;
        }
        Some(self.uploads_dir.join(requester))
    }

    /// Upload indexes first, then article indexes; duplicates keep their first
    /// position. Sources that cannot be read are logged and contribute nothing.
    #[instrument(skip(self))]
    pub async fn discover(&self, requester: &str) -> Result<Vec<String>, RetrievalError> {
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |name: String| {
            if seen.insert(name.clone()) {
                names.push(name);
            }
        };

        if let Some(dir) = self.user_upload_dir(requester) {
            for filename in list_uploaded_files(&dir).await {
                push(vector::upload_index_name(&filename));
            }
        }
        match db::list_indexes_for_owner(&self.replica, requester).await {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| e.kind == IndexKind::Upload)
                .for_each(|e| push(e.index_name)),
            Err(err) => warn!(?err, "failed to read upload registry"),
        }

        for name in self.article_indexes(requester).await {
            push(name);
        }

        debug!(count = names.len(), "discovered indexes");
        if names.is_empty() {
            return Err(RetrievalError::NoKnowledgeBase(requester.to_string()));
        }
        Ok(names)
    }

    async fn article_indexes(&self, requester: &str) -> Vec<String> {
        match self.scope {
            ArticleScope::Shared => {
                match db::list_indexes_by_kind(&self.replica, IndexKind::Article).await {
                    Ok(entries) => entries.into_iter().map(|e| e.index_name).collect(),
                    Err(err) => {
                        warn!(?err, "failed to read article registry");
                        Vec::new()
                    }
                }
            }
            ArticleScope::Owned => {
                let mut out = Vec::new();
                for author_id in self.authors.get(requester).into_iter().flatten() {
                    match db::list_indexes_for_owner(&self.replica, &db::author_owner(*author_id)).await {
                        Ok(entries) => out.extend(entries.into_iter().map(|e| e.index_name)),
                        Err(err) => warn!(?err, author_id, "failed to read article registry"),
                    }
                }
                out
            }
            ArticleScope::Scan => match self.vectors.list_indexes().await {
                Ok(all) => all
                    .into_iter()
                    .filter(|name| vector::is_article_index(name))
                    .collect(),
                Err(err) => {
                    warn!(?err, "failed to list vector indexes");
                    Vec::new()
                }
            },
        }
    }
}

/// Regular files directly inside `dir`, sorted by name. Missing dir -> empty.
async fn list_uploaded_files(dir: &Path) -> Vec<String> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut files = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
                if is_file {
                    if let Some(name) = entry.file_name().to_str() {
                        files.push(name.to_string());
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(?err, dir = %dir.display(), "failed to read uploads dir");
                break;
            }
        }
    }
    files.sort();
    files
}
