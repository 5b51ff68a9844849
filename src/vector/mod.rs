//! Vector backend abstraction and index naming.
//!
//! One index exists per source document group: one per synced article and one
//! per uploaded file. Names are deterministic so re-indexing the same article
//! or re-uploading the same file always lands in the same index.

pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::model::RetrievedDocument;

pub use sqlite::SqliteVectorStore;

const INDEX_PREFIX: &str = "rag_docs:";
const INDEX_SUFFIX: &str = ":idx";
/// Substring identifying article indexes in a backend listing.
pub const ARTICLE_MARKER: &str = "article_";

/// A document ready to be written: content, provenance and its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorDocument {
    pub key: String,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub vector: Vec<f32>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create `name` if it does not exist yet. Creating an existing index is a no-op.
    async fn create_index(&self, name: &str, dims: usize) -> Result<()>;

    /// Fails when `name` is not a queryable index.
    async fn open_index(&self, name: &str) -> Result<()>;

    /// Insert or replace documents by key.
    async fn store(&self, index: &str, docs: &[VectorDocument]) -> Result<()>;

    /// Top `top_k` documents by similarity, best first.
    async fn search(&self, index: &str, vector: &[f32], top_k: usize) -> Result<Vec<RetrievedDocument>>;

    /// Every index in the backend.
    async fn list_indexes(&self) -> Result<Vec<String>>;

    async fn drop_index(&self, name: &str) -> Result<()>;
}

/// Stem for a synced article's index.
pub fn article_stem(author_id: i64, external_id: i64) -> String {
    format!("{}{}_{}", ARTICLE_MARKER, author_id, external_id)
}

/// Backend index name for a stem (article stem or uploaded filename).
pub fn index_name(stem: &str) -> String {
    format!("{}{}{}", INDEX_PREFIX, stem, INDEX_SUFFIX)
}

pub fn article_index_name(author_id: i64, external_id: i64) -> String {
    index_name(&article_stem(author_id, external_id))
}

pub fn upload_index_name(filename: &str) -> String {
    index_name(filename)
}

/// Key of a document inside the index built from `stem`.
pub fn document_key(stem: &str, doc_id: &str) -> String {
    format!("{}:{}", stem, doc_id)
}

pub fn is_article_index(name: &str) -> bool {
    name.contains(ARTICLE_MARKER)
}

/// Cosine similarity; 0.0 for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
