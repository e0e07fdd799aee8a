use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub logs_dir: PathBuf,
    pub bind_addr: String,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_temperature: f32,
    pub gemini_max_output_tokens: i32,
    pub gemini_timeout_secs: u64,
    pub image_fetch_timeout_secs: u64,
    pub inference_base_url: String,
    pub inference_api_key: String,
    pub inference_timeout_secs: u64,
    pub model_load_timeout_secs: u64,
    pub model_cache_dir: PathBuf,
    pub preferred_device: String,
    pub model_manifest: ModelManifest,
    pub pose_detect_resolution: u32,
    pub pose_image_resolution: u32,
    pub generation_concurrency: usize,
    pub jpeg_quality: u8,
    pub firebase_creds_json: Option<String>,
    pub firebase_api_key: String,
    pub local_server_url: String,
    pub proxy_timeout_secs: u64,
    pub server_ready_timeout_secs: u64,
    pub server_ready_poll_ms: u64,
    pub job_poll_interval_ms: u64,
    pub runpod_get_job_url: String,
    pub runpod_post_output_url: String,
    pub runpod_api_key: String,
    pub runpod_worker_id: String,
    /// Problems found while loading, replayed once logging is installed.
    pub warnings: Vec<String>,
}

/// Model set handed to the inference worker's loader.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ModelManifest {
    pub base_model_repo: String,
    pub controlnet_repo: String,
    pub openpose_repo: String,
    pub photomaker_repo: String,
    pub photomaker_filename: String,
    pub trigger_word: String,
    pub face_det_size: u32,
}

impl Default for ModelManifest {
    fn default() -> Self {
        ModelManifest {
            base_model_repo: "SG161222/RealVisXL_V4.0".to_string(),
            controlnet_repo: "thibaud/controlnet-openpose-sdxl-1.0".to_string(),
            openpose_repo: "lllyasviel/ControlNet".to_string(),
            photomaker_repo: "TencentARC/PhotoMaker-V2".to_string(),
            photomaker_filename: "photomaker-v2.bin".to_string(),
            trigger_word: "img".to_string(),
            face_det_size: 640,
        }
    }
}

/// The subset of a service-account blob the auth gate cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountCredentials {
    pub project_id: String,
    #[serde(default)]
    pub client_email: Option<String>,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f32>().ok())
        .unwrap_or(default)
}

fn env_i32(name: &str, default: i32) -> i32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn normalize_device(value: String, warnings: &mut Vec<String>) -> String {
    let lowered = value.trim().to_lowercase();
    match lowered.as_str() {
        "cuda" | "gpu" => "cuda".to_string(),
        "cpu" => "cpu".to_string(),
        "mps" => "mps".to_string(),
        _ => {
            warnings.push(format!(
                "Unknown PREFERRED_DEVICE value '{value}'; defaulting to cuda."
            ));
            "cuda".to_string()
        }
    }
}

fn normalize_jpeg_quality(value: u32) -> u8 {
    value.clamp(1, 100) as u8
}

fn load_model_manifest() -> ModelManifest {
    let defaults = ModelManifest::default();
    ModelManifest {
        base_model_repo: env_string("BASE_MODEL_REPO", &defaults.base_model_repo),
        controlnet_repo: env_string("CONTROLNET_REPO", &defaults.controlnet_repo),
        openpose_repo: env_string("OPENPOSE_REPO", &defaults.openpose_repo),
        photomaker_repo: env_string("PHOTOMAKER_REPO", &defaults.photomaker_repo),
        photomaker_filename: env_string("PHOTOMAKER_FILENAME", &defaults.photomaker_filename),
        trigger_word: env_string("PHOTOMAKER_TRIGGER_WORD", &defaults.trigger_word),
        face_det_size: env_u32("FACE_DET_SIZE", defaults.face_det_size),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut warnings = Vec::new();
        let preferred_device =
            normalize_device(env_string("PREFERRED_DEVICE", "cuda"), &mut warnings);
        Ok(Config {
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            logs_dir: PathBuf::from(env_string("LOGS_DIR", "logs")),
            bind_addr: env_string("BIND_ADDR", "0.0.0.0:8000"),
            gemini_api_key: env_string("GEMINI_API_KEY", ""),
            gemini_model: env_string("GEMINI_MODEL", "gemini-1.5-pro-latest"),
            gemini_temperature: env_f32("GEMINI_TEMPERATURE", 0.7),
            gemini_max_output_tokens: env_i32("GEMINI_MAX_OUTPUT_TOKENS", 1024),
            gemini_timeout_secs: env_u64("GEMINI_TIMEOUT_SECS", 90),
            image_fetch_timeout_secs: env_u64("IMAGE_FETCH_TIMEOUT_SECS", 15),
            inference_base_url: env_string("INFERENCE_BASE_URL", "http://127.0.0.1:7860"),
            inference_api_key: env_string("INFERENCE_API_KEY", ""),
            inference_timeout_secs: env_u64("INFERENCE_TIMEOUT_SECS", 600),
            model_load_timeout_secs: env_u64("MODEL_LOAD_TIMEOUT_SECS", 1800),
            model_cache_dir: PathBuf::from(env_string("MODEL_CACHE_DIR", "./models_cache")),
            preferred_device,
            model_manifest: load_model_manifest(),
            pose_detect_resolution: env_u32("POSE_DETECT_RESOLUTION", 512),
            pose_image_resolution: env_u32("POSE_IMAGE_RESOLUTION", 1024),
            generation_concurrency: env_usize("GENERATION_CONCURRENCY", 1).max(1),
            jpeg_quality: normalize_jpeg_quality(env_u32("JPEG_QUALITY", 75)),
            firebase_creds_json: env_optional("FIREBASE_CREDS_JSON"),
            firebase_api_key: env_string("FIREBASE_API_KEY", ""),
            local_server_url: env_string("LOCAL_SERVER_URL", "http://127.0.0.1:8000"),
            proxy_timeout_secs: env_u64("PROXY_TIMEOUT_SECS", 290),
            server_ready_timeout_secs: env_u64("SERVER_READY_TIMEOUT_SECS", 600),
            server_ready_poll_ms: env_u64("SERVER_READY_POLL_MS", 1000),
            job_poll_interval_ms: env_u64("JOB_POLL_INTERVAL_MS", 500),
            runpod_get_job_url: env_string("RUNPOD_WEBHOOK_GET_JOB", ""),
            runpod_post_output_url: env_string("RUNPOD_WEBHOOK_POST_OUTPUT", ""),
            runpod_api_key: env_string("RUNPOD_AI_API_KEY", ""),
            runpod_worker_id: env_string("RUNPOD_POD_ID", "local-worker"),
            warnings,
        })
    }

    pub fn log_warnings(&self) {
        for warning in &self.warnings {
            warn!("{warning}");
        }
    }

    /// Parses the identity-provider credential blob, if one was supplied.
    pub fn service_account(&self) -> Result<Option<ServiceAccountCredentials>> {
        let Some(raw) = self.firebase_creds_json.as_deref() else {
            return Ok(None);
        };
        let creds = parse_service_account(raw)?;
        Ok(Some(creds))
    }
}

pub fn parse_service_account(raw: &str) -> Result<ServiceAccountCredentials> {
    let creds: ServiceAccountCredentials = serde_json::from_str(raw)
        .map_err(|err| anyhow!("FIREBASE_CREDS_JSON is not a valid credential blob: {err}"))?;
    if creds.project_id.trim().is_empty() {
        return Err(anyhow!("FIREBASE_CREDS_JSON is missing project_id"));
    }
    Ok(creds)
}

pub const PROMPT_INSTRUCTION: &str = "Your task is to act as a prompt generator for the PhotoMaker AI model. Analyze the provided image in extreme detail. Identify the subject, their clothing, expression, and any specific features.
Describe the background, the lighting style (e.g., golden hour, studio lighting), and the overall artistic style (e.g., photorealistic, illustration).
Your final output must be a single, cohesive text-to-image prompt. This prompt must include the special trigger word 'img' immediately following a class word like 'woman' or 'man'.
For example, the structure must be '...a beautiful woman img...' or '...a handsome man img...'.
Do not add any other text, explanations, or formatting. Just return the single prompt string.";

pub const NEGATIVE_PROMPT: &str = "photograph, realistic, photo, 3d, render, blurry, deformed, bad anatomy, disfigured, poorly drawn face, mutation, extra limb, ugly, poorly drawn hands, watermark, signature, text, caption";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_account_requires_project_id() {
        let err = parse_service_account(r#"{"project_id": "  "}"#).unwrap_err();
        assert!(err.to_string().contains("project_id"));
    }

    #[test]
    fn service_account_rejects_non_json() {
        assert!(parse_service_account("not json").is_err());
    }

    #[test]
    fn service_account_keeps_project() {
        let creds = parse_service_account(
            r#"{"type": "service_account", "project_id": "photoshoot-prod", "client_email": "svc@example.com"}"#,
        )
        .unwrap();
        assert_eq!(creds.project_id, "photoshoot-prod");
        assert_eq!(creds.client_email.as_deref(), Some("svc@example.com"));
    }

    #[test]
    fn jpeg_quality_is_clamped() {
        assert_eq!(normalize_jpeg_quality(0), 1);
        assert_eq!(normalize_jpeg_quality(250), 100);
        assert_eq!(normalize_jpeg_quality(75), 75);
    }

    #[test]
    fn device_aliases_normalize() {
        let mut warnings = Vec::new();
        assert_eq!(normalize_device("GPU".to_string(), &mut warnings), "cuda");
        assert_eq!(normalize_device(" cpu ".to_string(), &mut warnings), "cpu");
        assert!(warnings.is_empty());
    }

    #[test]
    fn unknown_device_is_kept_as_deferred_warning() {
        let mut warnings = Vec::new();
        assert_eq!(normalize_device("tpu".to_string(), &mut warnings), "cuda");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("'tpu'"));
    }
}
