use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::error::PipelineError;
use crate::models::DecodedImage;
use crate::utils::imaging::{decode_image_bytes, detect_mime_type};

const MEDIA_DOWNLOAD_ERROR_BODY_LIMIT: usize = 800;

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<DecodedImage, PipelineError>;
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

/// Downloads over HTTP(S) with a bounded timeout and decodes on the blocking pool.
pub struct HttpImageFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpImageFetcher {
    pub fn new(client: Client, timeout: Duration) -> Self {
        HttpImageFetcher { client, timeout }
    }

    async fn download(&self, url: &Url) -> Result<Vec<u8>, PipelineError> {
        let download_error = |reason: String| PipelineError::Download {
            url: url.to_string(),
            reason,
        };

        let response = match self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                warn!(
                    "Failed to fetch image {url}: {err} (timeout={}, connect={})",
                    err.is_timeout(),
                    err.is_connect()
                );
                let reason = if err.is_timeout() {
                    format!("request timed out after {:?}", self.timeout)
                } else {
                    err.to_string()
                };
                return Err(download_error(reason));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Image download failed for {url} with status {}: {}",
                status,
                truncate_for_log(&body, MEDIA_DOWNLOAD_ERROR_BODY_LIMIT)
            );
            return Err(download_error(format!("HTTP status {status}")));
        }

        match response.bytes().await {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(err) => {
                warn!("Failed to read image bytes {url}: {err}");
                Err(download_error(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &Url) -> Result<DecodedImage, PipelineError> {
        let bytes = self.download(url).await?;
        debug!(
            url = %url,
            size = bytes.len(),
            mime = ?detect_mime_type(&bytes),
            "Downloaded image"
        );

        let decoded = tokio::task::spawn_blocking(move || decode_image_bytes(&bytes))
            .await
            .map_err(|err| PipelineError::Decode {
                url: url.to_string(),
                reason: format!("decoder task failed: {err}"),
            })?;

        decoded.map_err(|err| {
            warn!("Failed to decode image {url}: {err}");
            PipelineError::Decode {
                url: url.to_string(),
                reason: err.to_string(),
            }
        })
    }
}
