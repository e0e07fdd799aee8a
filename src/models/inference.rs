//! HTTP client for the inference worker that hosts the diffusion pipeline,
//! the face analyser and the pose annotator.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{Config, ModelManifest};
use crate::models::{
    DecodedImage, DiffusionPipeline, FaceAnalyzer, GenerationInputs, IdentityEmbedding,
    PoseDetector,
};
use crate::utils::imaging::{decode_base64_image, encode_png, to_base64};
use crate::utils::timing::log_call_timing;

#[derive(Debug, Clone, Serialize)]
pub struct LoadModelsRequest {
    pub cache_dir: PathBuf,
    pub device: String,
    pub download_only: bool,
    pub manifest: ModelManifest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadModelsResponse {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub dtype: Option<String>,
    #[serde(default)]
    pub loaded: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DetectedFace {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct FaceEmbedResponse {
    #[serde(default)]
    faces: Vec<DetectedFace>,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    image: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    images: Vec<String>,
}

async fn encode_for_transport(images: Vec<DecodedImage>) -> Result<Vec<String>> {
    tokio::task::spawn_blocking(move || {
        images
            .iter()
            .map(|image| encode_png(image).map(|bytes| to_base64(&bytes)))
            .collect::<Result<Vec<_>>>()
    })
    .await
    .map_err(|err| anyhow!("image encoder task failed: {err}"))?
}

async fn decode_from_transport(images: Vec<String>) -> Result<Vec<DecodedImage>> {
    tokio::task::spawn_blocking(move || {
        images
            .iter()
            .map(|encoded| decode_base64_image(encoded))
            .collect::<Result<Vec<_>>>()
    })
    .await
    .map_err(|err| anyhow!("image decoder task failed: {err}"))?
}

pub struct InferenceClient {
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
    load_timeout: Duration,
}

impl InferenceClient {
    pub fn new(client: Client, base_url: &str, api_key: &str, timeout: Duration) -> Self {
        InferenceClient {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            timeout,
            load_timeout: timeout,
        }
    }

    pub fn from_config(client: Client, config: &Config) -> Self {
        let mut inference = InferenceClient::new(
            client,
            &config.inference_base_url,
            &config.inference_api_key,
            Duration::from_secs(config.inference_timeout_secs),
        );
        inference.load_timeout = Duration::from_secs(config.model_load_timeout_secs);
        inference
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn with_auth_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            return request;
        }
        request.bearer_auth(&self.api_key)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<T> {
        let endpoint = format!("{}{}", self.base_url, path);
        let request = self.client.post(&endpoint).timeout(timeout).json(payload);
        let response = self
            .with_auth_headers(request)
            .send()
            .await
            .map_err(|err| anyhow!("Inference request to {path} failed: {err}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|value| {
                    value
                        .get("detail")
                        .or_else(|| value.get("error"))
                        .and_then(|v| v.as_str())
                        .map(|v| v.to_string())
                })
                .unwrap_or(body);
            return Err(anyhow!(
                "Inference worker {path} returned status {}: {}",
                status,
                detail.trim()
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|err| anyhow!("Failed to parse inference response from {path}: {err}"))
    }

    /// Asks the worker to download (and unless `download_only`, load) the model set.
    pub async fn load_models(&self, request: &LoadModelsRequest) -> Result<LoadModelsResponse> {
        let payload = serde_json::to_value(request)?;
        let operation = if request.download_only {
            "prefetch_models"
        } else {
            "load_models"
        };
        log_call_timing(
            "inference",
            &request.manifest.base_model_repo,
            operation,
            Some(json!({ "device": request.device })),
            || self.post_json::<LoadModelsResponse>("/v1/models/load", &payload, self.load_timeout),
        )
        .await
    }

    pub async fn health(&self) -> Result<()> {
        let endpoint = format!("{}/healthz", self.base_url);
        let response = self
            .with_auth_headers(self.client.get(&endpoint).timeout(Duration::from_secs(5)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("inference worker health returned {}", response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl FaceAnalyzer for InferenceClient {
    async fn extract(&self, image: &DecodedImage) -> Result<Option<IdentityEmbedding>> {
        let encoded = encode_for_transport(vec![image.clone()]).await?;
        let payload = json!({ "image": encoded[0] });
        let response = log_call_timing("inference", "face_analysis", "embed_face", None, || {
            self.post_json::<FaceEmbedResponse>("/v1/faces/embed", &payload, self.timeout)
        })
        .await?;

        Ok(response
            .faces
            .into_iter()
            .next()
            .map(|face| IdentityEmbedding::new(face.embedding))
            .filter(|embedding| !embedding.is_empty()))
    }
}

#[async_trait]
impl PoseDetector for InferenceClient {
    async fn extract_pose(
        &self,
        image: &DecodedImage,
        detect_resolution: u32,
        image_resolution: u32,
    ) -> Result<DecodedImage> {
        let encoded = encode_for_transport(vec![image.clone()]).await?;
        let payload = json!({
            "image": encoded[0],
            "detect_resolution": detect_resolution,
            "image_resolution": image_resolution,
        });
        let response = log_call_timing("inference", "openpose", "extract_pose", None, || {
            self.post_json::<ImageResponse>("/v1/pose", &payload, self.timeout)
        })
        .await?;

        decode_from_transport(vec![response.image])
            .await
            .context("pose image from worker")?
            .pop()
            .ok_or_else(|| anyhow!("inference worker returned no pose image"))
    }
}

#[async_trait]
impl DiffusionPipeline for InferenceClient {
    async fn generate(&self, inputs: GenerationInputs<'_>) -> Result<Vec<DecodedImage>> {
        let identity_images = encode_for_transport(inputs.identity_images.to_vec()).await?;
        let pose_image = encode_for_transport(vec![inputs.pose_image.clone()])
            .await?
            .remove(0);
        let id_embeds: Vec<&[f32]> = inputs
            .identity_embeddings
            .iter()
            .map(|embedding| embedding.as_slice())
            .collect();

        let payload = json!({
            "prompt": inputs.prompt,
            "negative_prompt": inputs.negative_prompt,
            "input_id_images": identity_images,
            "id_embeds": id_embeds,
            "image": pose_image,
            "controlnet_conditioning_scale": inputs.params.conditioning_scale,
            "guidance_scale": inputs.params.guidance_scale,
            "start_merge_step": inputs.params.start_merge_step,
            "num_images_per_prompt": inputs.params.num_images,
        });
        let metadata = json!({
            "identity_images": inputs.identity_images.len(),
            "embeddings": inputs.identity_embeddings.len(),
            "embedding_dim": inputs.identity_embeddings.first().map(IdentityEmbedding::len),
        });

        let response = log_call_timing("inference", "photomaker", "generate", Some(metadata), || {
            self.post_json::<GenerateResponse>("/v1/generate", &payload, self.timeout)
        })
        .await?;

        decode_from_transport(response.images)
            .await
            .context("generated image from worker")
    }
}
