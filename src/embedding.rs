//! Embedding client abstraction and an OpenAI-compatible HTTP implementation.
//!
//! Retry strategy for [`HttpEmbedder`]:
//! - HTTP 429 and 5xx -> retry with exponential backoff (1s, 2s, 4s, ... capped at 32s)
//! - other 4xx -> fail immediately
//! - network errors -> retry
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    fn dims(&self) -> usize;

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("empty embedding response"))
}

#[derive(Clone)]
pub struct HttpEmbedder {
    http: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl fmt::Debug for HttpEmbedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpEmbedder")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    /// Build a client from config; the API key is read from `api_key_env`.
    pub fn from_config(cfg: &config::Embedding) -> Result<Self> {
        let api_key = std::env::var(&cfg.api_key_env)
            .with_context(|| format!("{} environment variable not set", cfg.api_key_env))?;
        let endpoint = embeddings_endpoint(&cfg.base_url)?;
        let http = Client::builder()
            .user_agent("article-rag/0.1")
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("failed to build embedding HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            model: cfg.model.clone(),
            dims: cfg.dimension,
            max_retries: cfg.max_retries,
        })
    }
}

/// `{base_url}/embeddings`, with or without a trailing slash on the base.
fn embeddings_endpoint(base_url: &str) -> Result<Url> {
    let mut base = Url::parse(base_url).context("invalid embedding.base_url")?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("embeddings").context("invalid embedding.base_url")
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "model": self.model, "input": texts });
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }
            debug!(attempt, count = texts.len(), "requesting embeddings");

            let res = self
                .http
                .post(self.endpoint.clone())
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            let res = match res {
                Ok(res) => res,
                Err(err) => {
                    warn!(?err, attempt, "embedding request failed");
                    last_err = Some(anyhow!(err).context("failed to reach embedding endpoint"));
                    continue;
                }
            };

            let status = res.status();
            if status.is_success() {
                let payload: EmbeddingResponse =
                    res.json().await.context("invalid embedding response")?;
                return parse_response(payload, texts.len(), self.dims);
            }

            let text = res.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                warn!(%status, attempt, "embedding endpoint busy; retrying");
                last_err = Some(anyhow!("embedding error {}: {}", status, text));
                continue;
            }
            bail!("embedding error {}: {}", status, text);
        }

        Err(last_err.unwrap_or_else(|| anyhow!("embedding failed after retries")))
    }
}

fn parse_response(payload: EmbeddingResponse, expected: usize, dims: usize) -> Result<Vec<Vec<f32>>> {
    if payload.data.len() != expected {
        bail!(
            "embedding response has {} vectors, expected {}",
            payload.data.len(),
            expected
        );
    }
    let mut items = payload.data;
    items.sort_by_key(|item| item.index);
    items
        .into_iter()
        .map(|item| {
            if item.embedding.len() != dims {
                bail!(
                    "embedding has {} dimensions, expected {}",
                    item.embedding.len(),
                    dims
                );
            }
            Ok(item.embedding)
        })
        .collect()
}
