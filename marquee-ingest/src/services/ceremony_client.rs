//! Ceremony payload sources
//!
//! - [`HttpCeremonyClient`]: `GET {base}/ceremonies/{key}`
//! - [`FileCeremonySource`]: `{dir}/{key}.json`, for offline imports

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::catalog_client::{build_http_client, status_error};
use super::rate_limiter::SourceRateLimiter;
use super::sources::CeremonySource;
use crate::error::SourceError;

pub struct HttpCeremonyClient {
    http_client: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<SourceRateLimiter>,
}

impl HttpCeremonyClient {
    pub fn new(base_url: &str, rate_limiter: Arc<SourceRateLimiter>) -> Result<Self, SourceError> {
        Ok(Self {
            http_client: build_http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter,
        })
    }
}

#[async_trait]
impl CeremonySource for HttpCeremonyClient {
    async fn fetch_ceremony(&self, ceremony_key: &str) -> Result<serde_json::Value, SourceError> {
        self.rate_limiter.acquire().await;

        let url = format!("{}/ceremonies/{}", self.base_url, ceremony_key);
        tracing::debug!(url = %url, "Fetching ceremony payload");

        let response = self.http_client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(
                status.as_u16(),
                body,
                &format!("ceremony {}", ceremony_key),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))
    }
}

/// Reads ceremony payloads from a directory of JSON files
pub struct FileCeremonySource {
    dir: PathBuf,
}

impl FileCeremonySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, ceremony_key: &str) -> Result<PathBuf, SourceError> {
        let valid = !ceremony_key.is_empty()
            && ceremony_key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SourceError::NotFound(format!(
                "invalid ceremony key '{}'",
                ceremony_key
            )));
        }
        Ok(self.dir.join(format!("{}.json", ceremony_key)))
    }
}

/// Read and parse one JSON payload file
pub async fn read_payload_file(path: &Path) -> Result<serde_json::Value, SourceError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SourceError::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(SourceError::Network(format!("{}: {}", path.display(), e))),
    };

    serde_json::from_str(&content)
        .map_err(|e| SourceError::Parse(format!("{}: {}", path.display(), e)))
}

#[async_trait]
impl CeremonySource for FileCeremonySource {
    async fn fetch_ceremony(&self, ceremony_key: &str) -> Result<serde_json::Value, SourceError> {
        let path = self.path_for(ceremony_key)?;
        read_payload_file(&path).await
    }
}
