//! Replica store: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `article_rag::db`; the repository API
//! and commonly used models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{PendingArticle, RegisteredIndex, UpsertOutcome};
