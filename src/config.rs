//! Configuration loader and validator for the article sync and retrieval service.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

static SQL_IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub source: Source,
    pub embedding: Embedding,
    pub vector: Vector,
    #[serde(default)]
    pub retrieval: Retrieval,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Replica store URL. `DATABASE_URL` takes precedence when set.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: String,
}

/// External content store. An empty `database_url` disables syncing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_source_table")]
    pub table: String,
}

/// OpenAI-compatible embeddings endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Embedding {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Vector backend location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vector {
    pub database_url: String,
}

/// Which article indexes a requester may query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArticleScope {
    /// Every registered article index.
    #[default]
    Shared,
    /// Only articles written by authors linked to the requester.
    Owned,
    /// List all backend indexes and keep names matching the article convention.
    Scan,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retrieval {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_documents")]
    pub max_documents: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_branch_timeout_secs")]
    pub branch_timeout_secs: u64,
    #[serde(default)]
    pub article_scope: ArticleScope,
    /// Requester name -> external author ids, consulted by `ArticleScope::Owned`.
    #[serde(default)]
    pub authors: BTreeMap<String, Vec<i64>>,
}

impl Default for Retrieval {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_documents: default_max_documents(),
            concurrency: default_concurrency(),
            branch_timeout_secs: default_branch_timeout_secs(),
            article_scope: ArticleScope::default(),
            authors: BTreeMap::new(),
        }
    }
}

fn default_sync_interval_secs() -> u64 {
    60
}
fn default_uploads_dir() -> String {
    "uploads".into()
}
fn default_source_table() -> String {
    "published_articles".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_top_k() -> usize {
    3
}
fn default_max_documents() -> usize {
    5
}
fn default_concurrency() -> usize {
    4
}
fn default_branch_timeout_secs() -> u64 {
    10
}

impl App {
    /// Expand a leading `~/` in `data_dir`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }

    /// Replica store URL: `DATABASE_URL`, then `app.database_url`, then a file in `data_dir`.
    pub fn replica_database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/article-rag.db", self.resolved_data_dir()))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

impl Source {
    pub fn is_enabled(&self) -> bool {
        !self.database_url.trim().is_empty()
    }
}

impl Retrieval {
    pub fn branch_timeout(&self) -> Duration {
        Duration::from_secs(self.branch_timeout_secs)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sync_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.sync_interval_secs must be > 0"));
    }
    if cfg.app.uploads_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.uploads_dir must be non-empty"));
    }

    if !SQL_IDENT.is_match(&cfg.source.table) {
        return Err(ConfigError::Invalid("source.table must be a plain SQL identifier"));
    }

    if cfg.embedding.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("embedding.base_url must be non-empty"));
    }
    if cfg.embedding.model.trim().is_empty() {
        return Err(ConfigError::Invalid("embedding.model must be non-empty"));
    }
    if cfg.embedding.dimension == 0 {
        return Err(ConfigError::Invalid("embedding.dimension must be > 0"));
    }
    if cfg.embedding.api_key_env.trim().is_empty() {
        return Err(ConfigError::Invalid("embedding.api_key_env must be non-empty"));
    }

    if cfg.vector.database_url.trim().is_empty() {
        return Err(ConfigError::Invalid("vector.database_url must be non-empty"));
    }

    let r = &cfg.retrieval;
    if r.top_k == 0 {
        return Err(ConfigError::Invalid("retrieval.top_k must be > 0"));
    }
    if r.max_documents == 0 {
        return Err(ConfigError::Invalid("retrieval.max_documents must be > 0"));
    }
    if r.concurrency == 0 {
        return Err(ConfigError::Invalid("retrieval.concurrency must be > 0"));
    }
    if r.branch_timeout_secs == 0 {
        return Err(ConfigError::Invalid("retrieval.branch_timeout_secs must be > 0"));
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sync_interval_secs: 60
  uploads_dir: "./uploads"

source:
  database_url: "sqlite://./blog.db?mode=ro"
  table: "published_articles"

embedding:
  base_url: "https://api.openai.com/v1/"
  model: "text-embedding-3-small"
  dimension: 1536
  api_key_env: "OPENAI_API_KEY"

vector:
  database_url: "sqlite://./data/vectors.db"

retrieval:
  top_k: 3
  max_documents: 5
  concurrency: 4
  branch_timeout_secs: 10
  article_scope: "shared"
  authors:
    alice:
      - 42
"#
}
