use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::{Config, PROMPT_INSTRUCTION};
use crate::llm::PromptGenerator;
use crate::models::DecodedImage;
use crate::utils::imaging::{encode_jpeg, to_base64};
use crate::utils::timing::log_call_timing;

pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    #[allow(dead_code)]
    Other(Value),
}

const GEMINI_MAX_RETRY_ATTEMPTS: usize = 2;
const GEMINI_RETRY_BASE_DELAY_MS: u64 = 900;

fn gemini_should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn gemini_should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn gemini_retry_delay(attempt: usize) -> Duration {
    let attempt = attempt.max(1) as u64;
    Duration::from_millis(GEMINI_RETRY_BASE_DELAY_MS.saturating_mul(attempt))
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            });
        return (message, truncate_for_log(&value.to_string(), 2000));
    }

    (None, truncate_for_log(trimmed, 2000))
}

fn summarize_payload(payload: &Value) -> Value {
    let mut summary = Map::new();
    if let Some(parts) = payload.pointer("/contents/0/parts").and_then(|v| v.as_array()) {
        let parts: Vec<Value> = parts
            .iter()
            .map(|part| {
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    json!({ "text": truncate_for_log(text, 120) })
                } else if let Some(inline) = part.get("inlineData") {
                    let data_len = inline
                        .get("data")
                        .and_then(|v| v.as_str())
                        .map(|v| v.len())
                        .unwrap_or(0);
                    json!({
                        "inlineData": { "mimeType": inline.get("mimeType"), "dataLen": data_len }
                    })
                } else {
                    json!({ "unknownPart": true })
                }
            })
            .collect();
        summary.insert("parts".to_string(), Value::Array(parts));
    }
    if let Some(config) = payload.get("generationConfig") {
        summary.insert("generationConfig".to_string(), config.clone());
    }
    Value::Object(summary)
}

/// Text parts of the first candidate, concatenated as returned.
fn extract_text_from_response(response: GeminiResponse) -> String {
    response
        .candidates
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .and_then(|content| content.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| match part {
            GeminiPart::Text { text } => Some(text),
            GeminiPart::Other(_) => None,
        })
        .collect()
}

fn build_prompt_payload(
    instruction: &str,
    jpeg_bytes: &[u8],
    temperature: f32,
    max_output_tokens: i32,
) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                { "text": instruction },
                { "inlineData": { "mimeType": "image/jpeg", "data": to_base64(jpeg_bytes) } }
            ]
        }],
        "generationConfig": {
            "temperature": temperature,
            "maxOutputTokens": max_output_tokens,
        },
    })
}

/// Multimodal prompt writer backed by the Gemini `generateContent` API.
pub struct GeminiPromptGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_output_tokens: i32,
    timeout: Duration,
    image_quality: u8,
}

impl GeminiPromptGenerator {
    pub fn from_config(client: Client, config: &Config) -> Self {
        GeminiPromptGenerator {
            client,
            base_url: GEMINI_API_BASE.to_string(),
            api_key: config.gemini_api_key.clone(),
            model: config.gemini_model.clone(),
            temperature: config.gemini_temperature,
            max_output_tokens: config.gemini_max_output_tokens,
            timeout: Duration::from_secs(config.gemini_timeout_secs),
            image_quality: 90,
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn redact(&self, text: &str) -> String {
        let key = self.api_key.trim();
        if key.is_empty() {
            return text.to_string();
        }
        text.replace(key, "[redacted]")
    }

    async fn call_gemini_api(&self, payload: &Value) -> Result<GeminiResponse> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(
                target: "llm.gemini",
                model = %self.model,
                payload = %summarize_payload(payload)
            );
        }

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = match self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .timeout(self.timeout)
                .json(payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    let err_text = self.redact(&err.to_string());
                    let should_retry =
                        gemini_should_retry_error(&err) && attempt < GEMINI_MAX_RETRY_ATTEMPTS;
                    warn!(
                        "Gemini request failed to send: {} (timeout={}, connect={}, retrying={})",
                        err_text,
                        err.is_timeout(),
                        err.is_connect(),
                        should_retry
                    );
                    if should_retry {
                        tokio::time::sleep(gemini_retry_delay(attempt)).await;
                        continue;
                    }
                    return Err(anyhow!("Gemini request failed: {}", err_text));
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let (message, body_summary) = summarize_error_body(&self.redact(&body));
                let should_retry =
                    gemini_should_retry_status(status) && attempt < GEMINI_MAX_RETRY_ATTEMPTS;
                warn!(
                    "Gemini API error: status={}, body={}, retrying={}",
                    status, body_summary, should_retry
                );
                if should_retry {
                    tokio::time::sleep(gemini_retry_delay(attempt)).await;
                    continue;
                }
                let detail = message.unwrap_or(body_summary);
                return Err(anyhow!(
                    "Gemini request failed with status {}: {}",
                    status,
                    detail
                ));
            }

            let value = response
                .json::<GeminiResponse>()
                .await
                .map_err(|err| {
                    anyhow!(
                        "Failed to parse Gemini response: {}",
                        self.redact(&err.to_string())
                    )
                })?;
            return Ok(value);
        }
    }
}

#[async_trait]
impl PromptGenerator for GeminiPromptGenerator {
    async fn generate_prompt(&self, image: &DecodedImage) -> Result<String> {
        let image = image.clone();
        let quality = self.image_quality;
        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&image, quality))
            .await
            .map_err(|err| anyhow!("reference image encoder task failed: {err}"))??;

        let payload = build_prompt_payload(
            PROMPT_INSTRUCTION,
            &jpeg,
            self.temperature,
            self.max_output_tokens,
        );

        log_call_timing("gemini", &self.model, "generate_prompt", None, || async {
            let response = self.call_gemini_api(&payload).await?;
            let text = extract_text_from_response(response);
            if text.trim().is_empty() {
                return Err(anyhow!("Gemini returned no text candidates"));
            }
            Ok(text)
        })
        .await
    }
}
