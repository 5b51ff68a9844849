//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::IndexKind;

/// Replica slice used by the indexing dispatcher.
#[derive(Debug, Clone)]
pub struct PendingArticle {
    pub id: i64,
    pub external_id: i64,
    pub author_id: i64,
    pub title: String,
    pub content: String,
    /// Revision read together with the content; passed back when marking indexed.
    pub content_revision: i64,
}

impl PendingArticle {
    pub fn document_body(&self) -> String {
        crate::model::document_body(&self.title, &self.content)
    }
}

/// Result of reconciling one source record into the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(i64),
    Updated(i64),
    /// Same snapshot as stored; the row and its indexing state were left alone.
    Unchanged(i64),
}

impl UpsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) | UpsertOutcome::Unchanged(id) => {
                *id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredIndex {
    pub owner: String,
    pub index_name: String,
    pub kind: IndexKind,
}
