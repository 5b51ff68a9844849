//! Incremental article replication into per-document vector indexes, and
//! fan-out retrieval across those indexes.

pub mod config;
pub mod db;
pub mod discovery;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod model;
pub mod prompt;
pub mod retriever;
pub mod source;
pub mod sync;
pub mod vector;

pub use error::RetrievalError;
pub use prompt::build_prompt;
pub use retriever::{MultiIndexRetriever, RetrievalSettings};
pub use sync::{dispatch_pending, index_pending, sync_once, CycleOutcome, SyncContext, SyncService};
