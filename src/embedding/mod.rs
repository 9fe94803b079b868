//! Embedding provider backends.
//!
//! Implements the core [`EmbeddingProvider`] trait for:
//! - **[`HttpProvider`]**: Voyage AI, OpenAI, and Ollama over HTTP, with
//!   batching, retry, and backoff.
//! - **[`LocalProvider`]**: fastembed models run in-process (feature
//!   `local-embeddings-fastembed`); no network calls after model download.
//! - [`HashEmbedder`] and [`DisabledEmbedder`] from the core crate.
//!
//! # Provider Selection
//!
//! Use [`create_provider`] to instantiate the appropriate provider based
//! on the configuration:
//!
//! ```rust,no_run
//! # use kb_harness::config::EmbeddingConfig;
//! # use kb_harness::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```
//!
//! # Retry Strategy
//!
//! HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Exhausted retries surface as [`EmbeddingError::Transient`]; everything
//! else as [`EmbeddingError::Fatal`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use kb_harness_core::embedding::{
    check_vectors, DisabledEmbedder, EmbedPurpose, EmbeddingProvider, HashEmbedder,
};
use kb_harness_core::error::EmbeddingError;

use crate::config::EmbeddingConfig;

const VOYAGE_URL: &str = "https://api.voyageai.com/v1/embeddings";
const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";
const OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Voyage,
    OpenAI,
    Ollama,
}

impl Backend {
    fn label(&self) -> &'static str {
        match self {
            Backend::Voyage => "Voyage",
            Backend::OpenAI => "OpenAI",
            Backend::Ollama => "Ollama",
        }
    }
}

/// Embedding provider backed by a remote HTTP API.
pub struct HttpProvider {
    backend: Backend,
    model: String,
    dims: usize,
    endpoint: String,
    api_key: Option<String>,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpProvider {
    fn new(backend: Backend, config: &EmbeddingConfig) -> Result<Self> {
        let model = config.model_or_default();
        let dims = config.dims_or_default().unwrap_or(0);
        if dims == 0 {
            bail!("embedding.dims required for {} provider", backend.label());
        }

        let (endpoint, api_key) = match backend {
            Backend::Voyage => {
                let key = std::env::var("VOYAGE_API_KEY")
                    .map_err(|_| anyhow::anyhow!("VOYAGE_API_KEY environment variable not set"))?;
                (
                    config.url.clone().unwrap_or_else(|| VOYAGE_URL.to_string()),
                    Some(key),
                )
            }
            Backend::OpenAI => {
                let key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
                (
                    config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
                    Some(key),
                )
            }
            Backend::Ollama => {
                let base = config.url.as_deref().unwrap_or(OLLAMA_URL);
                (format!("{}/api/embed", base.trim_end_matches('/')), None)
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            backend,
            model,
            dims,
            endpoint,
            api_key,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            client,
        })
    }

    fn request_body(&self, texts: &[String], purpose: EmbedPurpose) -> serde_json::Value {
        match self.backend {
            Backend::Voyage => serde_json::json!({
                "model": self.model,
                "input": texts,
                "input_type": purpose.as_str(),
            }),
            Backend::OpenAI | Backend::Ollama => serde_json::json!({
                "model": self.model,
                "input": texts,
            }),
        }
    }

    fn parse(&self, json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        match self.backend {
            Backend::Voyage | Backend::OpenAI => parse_data_response(json),
            Backend::Ollama => parse_ollama_response(json),
        }
    }

    /// One API call with retry/backoff.
    async fn embed_once(
        &self,
        texts: &[String],
        purpose: EmbedPurpose,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let label = self.backend.label();
        let body = self.request_body(texts, purpose);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, delay_secs = delay.as_secs(), "retrying {label} embedding call");
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(&self.endpoint)
                .header("Content-Type", "application/json")
                .json(&body);
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            EmbeddingError::Fatal(format!("{label} response unreadable: {e}"))
                        })?;
                        return self.parse(&json);
                    }

                    // Rate limited or server error, retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        warn!(%status, attempt, "{label} embedding call failed; will retry");
                        last_err = Some(format!("{label} API error {status}: {body_text}"));
                        continue;
                    }

                    // Client error other than 429 is fatal
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(EmbeddingError::Fatal(format!(
                        "{label} API error {status}: {body_text}"
                    )));
                }
                Err(e) => {
                    warn!(error = %e, attempt, "{label} connection error; will retry");
                    last_err = Some(format!("{label} connection error ({}): {e}", self.endpoint));
                    continue;
                }
            }
        }

        Err(EmbeddingError::Transient(last_err.unwrap_or_else(|| {
            format!("{label} embedding failed after retries")
        })))
    }
}

#[async_trait]
impl EmbeddingProvider for HttpProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        purpose: EmbedPurpose,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.embed_once(batch, purpose).await?;
            check_vectors(&vectors, batch.len(), self.dims)?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

/// Parse an OpenAI-style `{"data": [{"index": i, "embedding": [...]}]}`
/// response (also used by Voyage), returning vectors in input order.
fn parse_data_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::Fatal("invalid response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbeddingError::Fatal("invalid response: missing embedding".into()))?;
        indexed.push((index, to_f32(embedding)?));
    }

    // Sort by index to ensure order matches input
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            EmbeddingError::Fatal("invalid Ollama response: missing embeddings array".into())
        })?;

    embeddings
        .iter()
        .map(|e| {
            e.as_array()
                .ok_or_else(|| {
                    EmbeddingError::Fatal("invalid Ollama response: embedding is not an array".into())
                })
                .and_then(|values| to_f32(values))
        })
        .collect()
}

fn to_f32(values: &[serde_json::Value]) -> Result<Vec<f32>, EmbeddingError> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbeddingError::Fatal("non-numeric embedding component".into()))
        })
        .collect()
}

// ============ Local Provider (fastembed) ============

/// Embedding provider for local inference via fastembed.
///
/// Models are downloaded on first use from Hugging Face and cached.
/// After initial download, embeddings run entirely offline.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    batch_size: usize,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config.model_or_default();
        config_to_fastembed_model(&model_name)?;
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "bge-base-en-v1.5" | "nomic-embed-text-v1.5" => 768,
            "bge-large-en-v1.5" => 1024,
            _ => 384,
        });
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size.max(1),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        _purpose: EmbedPurpose,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let fastembed_model = config_to_fastembed_model(&self.model_name)
            .map_err(|e| EmbeddingError::Fatal(e.to_string()))?;
        let batch_size = self.batch_size;
        let owned = texts.to_vec();

        let vectors = tokio::task::spawn_blocking(move || {
            let mut model = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
            )
            .map_err(|e| {
                EmbeddingError::Fatal(format!("Failed to initialize local embedding model: {e}"))
            })?;
            model
                .embed(owned, Some(batch_size))
                .map_err(|e| EmbeddingError::Fatal(format!("Local embedding failed: {e}")))
        })
        .await
        .map_err(|e| EmbeddingError::Fatal(format!("embedding task panicked: {e}")))??;

        check_vectors(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"hash"` | [`HashEmbedder`] |
/// | `"voyage"` / `"openai"` / `"ollama"` | [`HttpProvider`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings-fastembed`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims_or_default().unwrap_or(256),
        ))),
        "voyage" => Ok(Arc::new(HttpProvider::new(Backend::Voyage, config)?)),
        "openai" => Ok(Arc::new(HttpProvider::new(Backend::OpenAI, config)?)),
        "ollama" => Ok(Arc::new(HttpProvider::new(Backend::Ollama, config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!(
            "Local embedding provider requires --features local-embeddings-fastembed"
        ),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
