use thiserror::Error;

/// Failures a retrieval caller is expected to tell apart.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("no knowledge base found for user {0} (no uploaded file or synced articles)")]
    NoKnowledgeBase(String),
    #[error("failed to open any index for user {0}")]
    NoUsableIndex(String),
    #[error("no documents retrieved from any index")]
    NothingRetrieved,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
