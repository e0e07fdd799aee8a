//! The generate endpoint: fetch inputs, ask the LLM for a prompt, prepare pose
//! and identity conditioning, run the diffusion pipeline and encode the result.

use std::fmt;

use axum::extract::rejection::JsonRejection;
use axum::extract::{MatchedPath, State};
use axum::{Extension, Json};
use futures::future::{try_join, try_join_all};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use url::Url;

use crate::config::NEGATIVE_PROMPT;
use crate::error::{short_reason, PipelineError};
use crate::handlers::access::VerifiedUser;
use crate::models::{DecodedImage, GenerationInputs, IdentityEmbedding};
use crate::state::AppState;
use crate::utils::imaging::{encode_jpeg, to_base64};
use crate::utils::timing::{complete_request_timer, start_request_timer};

pub const GENERATE_PATH: &str = "/api/v1/generate-makeup";
pub const LEGACY_GENERATE_PATH: &str = "/generate";
pub const MAX_ID_PHOTOS: usize = 3;
pub const SUCCESS_MESSAGE: &str = "Image generated successfully";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub reference_photo_url: String,
    pub structure_photo_url: String,
    pub user_id_photo_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub reference: Url,
    pub structure: Url,
    pub identities: Vec<Url>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub message: String,
    pub llm_prompt: String,
    pub image_base64: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ReceivedRequest,
    PromptReady,
    InputsPrepared,
    Generated,
    Encoded,
    Responded,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::ReceivedRequest => "received_request",
            Stage::PromptReady => "prompt_ready",
            Stage::InputsPrepared => "inputs_prepared",
            Stage::Generated => "generated",
            Stage::Encoded => "encoded",
            Stage::Responded => "responded",
        };
        f.write_str(label)
    }
}

fn parse_photo_url(field: &str, raw: &str) -> Result<Url, PipelineError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|err| {
        PipelineError::InvalidRequest(format!("{field}: invalid URL '{trimmed}': {err}"))
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(PipelineError::InvalidRequest(format!(
            "{field}: '{trimmed}' is not an http(s) URL"
        )));
    }
    Ok(url)
}

impl GenerationRequest {
    pub fn validate(&self) -> Result<ValidatedRequest, PipelineError> {
        let count = self.user_id_photo_urls.len();
        if count == 0 || count > MAX_ID_PHOTOS {
            return Err(PipelineError::InvalidRequest(format!(
                "user_id_photo_urls must contain between 1 and {MAX_ID_PHOTOS} URLs, got {count}"
            )));
        }

        let reference = parse_photo_url("reference_photo_url", &self.reference_photo_url)?;
        let structure = parse_photo_url("structure_photo_url", &self.structure_photo_url)?;
        let identities = self
            .user_id_photo_urls
            .iter()
            .enumerate()
            .map(|(index, raw)| parse_photo_url(&format!("user_id_photo_urls[{index}]"), raw))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ValidatedRequest {
            reference,
            structure,
            identities,
        })
    }
}

struct PipelineRun<'a> {
    state: &'a AppState,
    request_id: &'a str,
    stage: Stage,
}

impl<'a> PipelineRun<'a> {
    fn new(state: &'a AppState, request_id: &'a str) -> Self {
        PipelineRun {
            state,
            request_id,
            stage: Stage::ReceivedRequest,
        }
    }

    fn advance(&mut self, stage: Stage) {
        self.stage = stage;
        info!(request_id = %self.request_id, stage = %stage, "Pipeline stage reached");
    }

    async fn execute(
        &mut self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, PipelineError> {
        let validated = request.validate()?;
        let registry = self.state.registry.get().ok_or(PipelineError::NotReady)?;
        let fetcher = self.state.fetcher.as_ref();
        let settings = self.state.settings;

        let reference = fetcher.fetch(&validated.reference).await?;
        info!(request_id = %self.request_id, "Requesting prompt from LLM");
        let prompt = self
            .state
            .prompts
            .generate_prompt(&reference)
            .await
            .map_err(|err| {
                error!(request_id = %self.request_id, "Prompt generation failed: {err:#}");
                PipelineError::Upstream(short_reason(&err))
            })?;
        drop(reference);
        info!(request_id = %self.request_id, prompt = %prompt, "Prompt received from LLM");
        self.advance(Stage::PromptReady);

        let (structure, identity_images) = try_join(
            fetcher.fetch(&validated.structure),
            try_join_all(validated.identities.iter().map(|url| fetcher.fetch(url))),
        )
        .await?;

        let permit = self
            .state
            .device_gate
            .acquire()
            .await
            .map_err(|_| PipelineError::Generation("device gate is closed".to_string()))?;

        let pose_image = registry
            .pose_detector
            .extract_pose(
                &structure,
                settings.pose_detect_resolution,
                settings.pose_image_resolution,
            )
            .await
            .map_err(|err| {
                error!(
                    request_id = %self.request_id,
                    url = %validated.structure,
                    "Pose extraction failed: {err:#}"
                );
                PipelineError::Inference {
                    stage: "Pose extraction",
                    reason: short_reason(&err),
                }
            })?;
        drop(structure);
        info!(
            request_id = %self.request_id,
            "Pose map ready ({}x{})",
            pose_image.width(),
            pose_image.height()
        );

        let embeddings = self
            .collect_embeddings(&validated.identities, &identity_images)
            .await?;
        self.advance(Stage::InputsPrepared);

        let images = registry
            .pipeline
            .generate(GenerationInputs {
                prompt: &prompt,
                negative_prompt: NEGATIVE_PROMPT,
                identity_images: &identity_images,
                identity_embeddings: &embeddings,
                pose_image: &pose_image,
                params: settings.generation,
            })
            .await
            .map_err(|err| {
                error!(request_id = %self.request_id, "Generation pipeline failed: {err:#}");
                PipelineError::Generation(short_reason(&err))
            })?;
        drop(permit);

        let generated = images
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Generation("pipeline returned no images".to_string()))?;
        self.advance(Stage::Generated);

        let image_base64 = encode_response_image(generated, settings.jpeg_quality).await?;
        self.advance(Stage::Encoded);

        let response = GenerationResponse {
            message: SUCCESS_MESSAGE.to_string(),
            llm_prompt: prompt,
            image_base64,
        };
        self.advance(Stage::Responded);
        Ok(response)
    }

    /// Embeddings in input order; photos without a detectable face are skipped.
    async fn collect_embeddings(
        &self,
        urls: &[Url],
        images: &[DecodedImage],
    ) -> Result<Vec<IdentityEmbedding>, PipelineError> {
        let registry = self.state.registry.get().ok_or(PipelineError::NotReady)?;
        let mut embeddings = Vec::with_capacity(images.len());
        for (url, image) in urls.iter().zip(images) {
            let extracted = registry.face_analyzer.extract(image).await.map_err(|err| {
                error!(request_id = %self.request_id, url = %url, "Face analysis failed: {err:#}");
                PipelineError::Inference {
                    stage: "Face analysis",
                    reason: short_reason(&err),
                }
            })?;
            match extracted {
                Some(embedding) => embeddings.push(embedding),
                None => warn!(
                    request_id = %self.request_id,
                    url = %url,
                    "No face detected in user photo"
                ),
            }
        }

        if embeddings.is_empty() {
            return Err(PipelineError::NoFaceFound);
        }
        info!(
            request_id = %self.request_id,
            "Extracted {} face embedding(s) from {} user photo(s)",
            embeddings.len(),
            images.len()
        );
        Ok(embeddings)
    }
}

async fn encode_response_image(image: DecodedImage, quality: u8) -> Result<String, PipelineError> {
    tokio::task::spawn_blocking(move || encode_jpeg(&image, quality).map(|bytes| to_base64(&bytes)))
        .await
        .map_err(|err| PipelineError::Encode(err.to_string()))?
        .map_err(|err| PipelineError::Encode(short_reason(&err)))
}

/// Runs the whole pipeline for one request. Any stage failure aborts the run.
pub async fn run_generation(
    state: &AppState,
    request: &GenerationRequest,
    request_id: &str,
) -> Result<GenerationResponse, PipelineError> {
    let mut run = PipelineRun::new(state, request_id);
    let result = run.execute(request).await;
    if let Err(err) = &result {
        let log_line = format!(
            "Generate request failed at stage {} ({}): {}",
            run.stage,
            err.kind(),
            err
        );
        if err.is_client_error() || matches!(err, PipelineError::NotReady) {
            warn!(request_id = %request_id, "{log_line}");
        } else {
            error!(request_id = %request_id, "{log_line}");
        }
    }
    result
}

pub async fn generate_handler(
    State(state): State<AppState>,
    matched: Option<MatchedPath>,
    user: Option<Extension<VerifiedUser>>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, PipelineError> {
    let request_id = uuid::Uuid::new_v4().to_string();
    let endpoint = matched
        .as_ref()
        .map(MatchedPath::as_str)
        .unwrap_or(GENERATE_PATH);
    let mut timer = start_request_timer(&request_id, endpoint);
    if let Some(Extension(user)) = &user {
        info!(
            request_id = %request_id,
            uid = %user.uid,
            "Generate request from authenticated user"
        );
    }

    let result = match payload {
        Ok(Json(request)) => run_generation(&state, &request, &request_id).await,
        Err(rejection) => {
            warn!(request_id = %request_id, "Rejected malformed body: {}", rejection.body_text());
            Err(PipelineError::InvalidRequest(rejection.body_text()))
        }
    };

    match &result {
        Ok(_) => complete_request_timer(&mut timer, "success", None),
        Err(err) => complete_request_timer(&mut timer, err.kind(), Some(err.to_string())),
    }
    result.map(Json)
}
