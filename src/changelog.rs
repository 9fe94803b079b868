//! Change-log readers.
//!
//! Two [`ChangeSource`] implementations:
//!
//! - [`FileChangeSource`] reads a JSON document
//!   `{ "version": "...", "entries": [ {...}, ... ] }` from disk.
//! - [`HttpChangeSource`] reads `GET {url}/version` → `{"version": "..."}`
//!   and `GET {url}/entries?since=<v>` → `{"entries": [...]}`, with an
//!   optional bearer token taken from the environment.
//!
//! Each row carries the version it was recorded at; the document's top-level
//! version is the newest of them.
//!
//! Both read the version marker before any rows, so an unchanged log costs
//! one small read. Any I/O, HTTP or auth failure is reported as
//! [`ChangeSourceError::Unreachable`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use kb_harness_core::changelog::{entries_from_rows, ChangeLogEntry, ChangeSource};
use kb_harness_core::error::ChangeSourceError;
use kb_harness_core::models::SourceVersion;

use crate::config::SyncConfig;

#[derive(Debug, Deserialize)]
struct VersionDoc {
    version: SourceVersion,
}

#[derive(Debug, Deserialize)]
struct EntriesDoc {
    #[serde(default)]
    entries: Vec<Value>,
}

/// Change log stored as a JSON file.
pub struct FileChangeSource {
    path: PathBuf,
}

impl FileChangeSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_doc(&self) -> Result<Value, ChangeSourceError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ChangeSourceError::Unreachable(format!("{}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| ChangeSourceError::Malformed(format!("{}: {e}", self.path.display())))
    }
}

#[async_trait]
impl ChangeSource for FileChangeSource {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn current_version(&self) -> Result<SourceVersion, ChangeSourceError> {
        let doc = self.read_doc().await?;
        let parsed: VersionDoc = serde_json::from_value(doc)
            .map_err(|e| ChangeSourceError::Malformed(format!("version marker: {e}")))?;
        Ok(parsed.version)
    }

    async fn read_entries(
        &self,
        _since: Option<&SourceVersion>,
        current: &SourceVersion,
    ) -> Result<Vec<ChangeLogEntry>, ChangeSourceError> {
        let doc = self.read_doc().await?;
        let parsed: EntriesDoc = serde_json::from_value(doc)
            .map_err(|e| ChangeSourceError::Malformed(format!("entries: {e}")))?;
        debug!(rows = parsed.entries.len(), source = %self.describe(), "read change-log rows");
        Ok(entries_from_rows(parsed.entries, current))
    }
}

/// Change log served over HTTP.
pub struct HttpChangeSource {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpChangeSource {
    pub fn new(base_url: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, ChangeSourceError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url).query(query);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        let response = request
            .send()
            .await
            .map_err(|e| ChangeSourceError::Unreachable(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChangeSourceError::Unreachable(format!(
                "{url}: HTTP {status}: {body}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ChangeSourceError::Malformed(format!("{url}: {e}")))
    }
}

#[async_trait]
impl ChangeSource for HttpChangeSource {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn current_version(&self) -> Result<SourceVersion, ChangeSourceError> {
        let json = self.get_json("/version", &[]).await?;
        let parsed: VersionDoc = serde_json::from_value(json)
            .map_err(|e| ChangeSourceError::Malformed(format!("version marker: {e}")))?;
        Ok(parsed.version)
    }

    async fn read_entries(
        &self,
        since: Option<&SourceVersion>,
        current: &SourceVersion,
    ) -> Result<Vec<ChangeLogEntry>, ChangeSourceError> {
        let since = since.map(|v| v.as_str().to_string()).unwrap_or_default();
        let json = self.get_json("/entries", &[("since", since.as_str())]).await?;
        let parsed: EntriesDoc = serde_json::from_value(json)
            .map_err(|e| ChangeSourceError::Malformed(format!("entries: {e}")))?;
        Ok(entries_from_rows(parsed.entries, current))
    }
}

/// Builds the change source named by `[sync]`.
pub fn create_source(config: &SyncConfig) -> Result<Arc<dyn ChangeSource>> {
    match config.source.as_str() {
        "file" => {
            let path = config
                .path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("sync.path required when sync.source = \"file\""))?;
            Ok(Arc::new(FileChangeSource::new(path)))
        }
        "http" => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("sync.url required when sync.source = \"http\""))?;
            let token = match &config.token_env {
                Some(var) => Some(std::env::var(var).map_err(|_| {
                    anyhow::anyhow!("{} environment variable not set (sync.token_env)", var)
                })?),
                None => None,
            };
            Ok(Arc::new(HttpChangeSource::new(url, token, config.timeout_secs)?))
        }
        other => bail!("Unknown sync source: '{}'. Must be file or http.", other),
    }
}
