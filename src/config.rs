use anyhow::{Context, Result};
use kb_harness_core::search::{FusionWeights, SearchParams};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub load: LoadConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_min_candidates")]
    pub min_candidates: usize,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_keyword_weight(),
            default_k: default_k(),
            min_candidates: default_min_candidates(),
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

fn default_semantic_weight() -> f64 {
    0.7
}
fn default_keyword_weight() -> f64 {
    0.3
}
fn default_k() -> usize {
    5
}
fn default_min_candidates() -> usize {
    20
}
fn default_candidate_multiplier() -> usize {
    4
}

impl RetrievalConfig {
    /// Validated fusion weights.
    pub fn weights(&self) -> Result<FusionWeights> {
        FusionWeights::new(self.semantic_weight, self.keyword_weight)
            .context("invalid [retrieval] weights")
    }

    pub fn search_params(&self) -> Result<SearchParams> {
        Ok(SearchParams {
            weights: self.weights()?,
            min_candidates: self.min_candidates,
            candidate_multiplier: self.candidate_multiplier,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL override (Ollama host, OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    128
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Model name, falling back to the provider's default.
    pub fn model_or_default(&self) -> String {
        if let Some(model) = &self.model {
            return model.clone();
        }
        match self.provider.as_str() {
            "voyage" => "voyage-2",
            "openai" => "text-embedding-3-small",
            "ollama" => "nomic-embed-text",
            "local" => "all-minilm-l6-v2",
            _ => "",
        }
        .to_string()
    }

    /// Vector dimension, falling back to the model's known size.
    pub fn dims_or_default(&self) -> Option<usize> {
        self.dims.or(match self.provider.as_str() {
            "voyage" => Some(1024),
            "openai" => Some(1536),
            "ollama" => Some(768),
            "local" => Some(384),
            "hash" => Some(256),
            _ => None,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_source")]
    pub source: String,
    /// JSON change-log file for `source = "file"`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Base URL for `source = "http"`.
    #[serde(default)]
    pub url: Option<String>,
    /// Name of the environment variable holding the bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            path: None,
            url: None,
            token_env: None,
            max_attempts: default_max_attempts(),
            lock_ttl_secs: default_lock_ttl_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_source() -> String {
    "file".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_lock_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoadConfig {
    /// Default corpus file for `kb load`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate retrieval
    config.retrieval.weights()?;
    if config.retrieval.default_k < 1 {
        anyhow::bail!("retrieval.default_k must be >= 1");
    }
    if config.retrieval.candidate_multiplier < 1 {
        anyhow::bail!("retrieval.candidate_multiplier must be >= 1");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "voyage" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, voyage, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        match config.embedding.dims_or_default() {
            Some(d) if d > 0 => {}
            _ => anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            ),
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    // Validate sync
    match config.sync.source.as_str() {
        "file" | "http" => {}
        other => anyhow::bail!(
            "Unknown sync source: '{}'. Must be file or http.",
            other
        ),
    }
    if config.sync.max_attempts == 0 {
        anyhow::bail!("sync.max_attempts must be >= 1");
    }
    crate::sync::lock_ttl(config.sync.lock_ttl_secs)?;

    Ok(())
}
