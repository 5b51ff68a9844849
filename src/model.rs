use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Publication status as stored by the external content store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ArticleStatus {
    Draft,
    Published,
    Other(u8),
}

impl ArticleStatus {
    pub const DRAFT_CODE: u8 = 1;
    pub const PUBLISHED_CODE: u8 = 2;

    pub fn from_code(code: i64) -> Self {
        match u8::try_from(code) {
            Ok(Self::DRAFT_CODE) => ArticleStatus::Draft,
            Ok(Self::PUBLISHED_CODE) => ArticleStatus::Published,
            Ok(other) => ArticleStatus::Other(other),
            Err(_) => ArticleStatus::Other(u8::MAX),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ArticleStatus::Draft => Self::DRAFT_CODE,
            ArticleStatus::Published => Self::PUBLISHED_CODE,
            ArticleStatus::Other(code) => *code,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleStatus::Draft => "draft",
            ArticleStatus::Published => "published",
            ArticleStatus::Other(_) => "other",
        }
    }
}

/// Row of the external published-content table. Read-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceArticle {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author_id: i64,
    pub status: ArticleStatus,
    pub ctime: i64,
    pub utime: i64,
}

/// Local copy of an external article plus indexing bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaArticle {
    pub id: i64,
    pub external_id: i64,
    pub author_id: i64,
    pub title: String,
    pub content: String,
    pub status: ArticleStatus,
    pub external_ctime: i64,
    pub external_utime: i64,
    pub indexed: bool,
    /// Bumped on every upsert; indexing only counts for the revision it read.
    pub content_revision: i64,
    pub indexed_revision: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReplicaArticle {
    pub fn document_body(&self) -> String {
        document_body(&self.title, &self.content)
    }
}

/// Body handed to a vector index for an article: title line, blank line, content.
pub fn document_body(title: &str, content: &str) -> String {
    format!("Title: {}\n\n{}", title, content)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncWatermark {
    pub table_name: String,
    pub last_utime: i64,
    pub updated_at: DateTime<Utc>,
}

/// Kind of a registered vector index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IndexKind {
    Article,
    Upload,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Article => "article",
            IndexKind::Upload => "upload",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "article" => Some(IndexKind::Article),
            "upload" => Some(IndexKind::Upload),
            _ => None,
        }
    }
}

/// A document as returned from a vector query. Never persisted locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedDocument {
    pub id: String,
    pub content: String,
    pub metadata: Map<String, Value>,
}

impl RetrievedDocument {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: Map::new(),
        }
    }
}
