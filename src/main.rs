use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use tracing::{info, warn};

mod config;
mod error;
mod handlers;
mod llm;
mod models;
mod server;
mod serverless;
mod state;
mod utils;

use config::{Config, CONFIG};
use handlers::access::{FirebaseTokenVerifier, TokenVerifier};
use llm::{GeminiPromptGenerator, HttpImageFetcher};
use models::inference::InferenceClient;
use models::registry::{load_models, prefetch_models};
use models::{GenerationParams, RegistrySlot};
use state::{AppState, PipelineSettings};
use utils::http::get_http_client;
use utils::logging::init_logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serve,
    Worker,
    PrefetchModels,
}

fn usage() -> &'static str {
    "Usage: virtual_photoshoot [serve|worker|prefetch-models]"
}

fn parse_mode(args: &[String]) -> Result<Mode> {
    match args.get(1).map(|value| value.as_str()) {
        None | Some("serve") => Ok(Mode::Serve),
        Some("worker") => Ok(Mode::Worker),
        Some("prefetch-models") => Ok(Mode::PrefetchModels),
        Some("--help") | Some("-h") => Err(anyhow!(usage())),
        Some(other) => Err(anyhow!("Unknown command: {other}\n{}", usage())),
    }
}

fn build_verifier(config: &Config) -> Result<Option<Arc<dyn TokenVerifier>>> {
    let Some(credentials) = config.service_account()? else {
        warn!("FIREBASE_CREDS_JSON is not set; generate endpoints are unauthenticated");
        return Ok(None);
    };
    if config.firebase_api_key.trim().is_empty() {
        return Err(anyhow!(
            "FIREBASE_API_KEY is required when FIREBASE_CREDS_JSON is set"
        ));
    }
    let verifier: Arc<dyn TokenVerifier> = Arc::new(FirebaseTokenVerifier::new(
        get_http_client().clone(),
        &credentials,
        &config.firebase_api_key,
    ));
    Ok(Some(verifier))
}

async fn run_server(config: &Config) -> Result<()> {
    if config.gemini_api_key.trim().is_empty() {
        return Err(anyhow!("GEMINI_API_KEY is required to serve requests"));
    }
    let verifier = build_verifier(config)?;
    let client = get_http_client().clone();

    let inference = Arc::new(InferenceClient::from_config(client.clone(), config));
    inference
        .health()
        .await
        .with_context(|| format!("Inference worker at {} is unreachable", inference.base_url()))?;
    let load_timeout = Duration::from_secs(config.model_load_timeout_secs);
    let registry = tokio::time::timeout(load_timeout, load_models(inference, config))
        .await
        .map_err(|_| anyhow!("Model loading exceeded {:?}", load_timeout))?
        .context("Model loading failed")?;
    let slot = RegistrySlot::empty();
    slot.install(registry)?;

    let fetcher = Arc::new(HttpImageFetcher::new(
        client.clone(),
        Duration::from_secs(config.image_fetch_timeout_secs),
    ));
    let prompts = Arc::new(GeminiPromptGenerator::from_config(client, config));
    let settings = PipelineSettings {
        pose_detect_resolution: config.pose_detect_resolution,
        pose_image_resolution: config.pose_image_resolution,
        jpeg_quality: config.jpeg_quality,
        generation: GenerationParams::default(),
    };

    let mut state = AppState::new(
        slot,
        fetcher,
        prompts,
        config.generation_concurrency,
        settings,
    );
    if let Some(verifier) = verifier {
        state = state.with_verifier(verifier);
    }

    server::serve(&config.bind_addr, state).await
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let _guards = init_logging(&CONFIG.log_level, &CONFIG.logs_dir);
    CONFIG.log_warnings();

    let args: Vec<String> = std::env::args().collect();
    let mode = parse_mode(&args)?;
    info!("Starting virtual photoshoot service ({:?})", mode);

    match mode {
        Mode::Serve => run_server(&CONFIG).await,
        Mode::Worker => serverless::run_worker(&CONFIG, get_http_client().clone()).await,
        Mode::PrefetchModels => {
            let inference = InferenceClient::from_config(get_http_client().clone(), &CONFIG);
            prefetch_models(&inference, &CONFIG).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn mode_defaults_to_serve() {
        assert_eq!(parse_mode(&args(&["bin"])).unwrap(), Mode::Serve);
        assert_eq!(parse_mode(&args(&["bin", "serve"])).unwrap(), Mode::Serve);
        assert_eq!(parse_mode(&args(&["bin", "worker"])).unwrap(), Mode::Worker);
        assert_eq!(
            parse_mode(&args(&["bin", "prefetch-models"])).unwrap(),
            Mode::PrefetchModels
        );
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = parse_mode(&args(&["bin", "train"])).unwrap_err();
        assert!(err.to_string().contains("Unknown command: train"));
    }

    #[test]
    fn invalid_credentials_fail_startup() {
        let mut config = Config::load().unwrap();
        config.firebase_creds_json = Some("{\"client_email\": \"svc@x\"}".to_string());
        config.firebase_api_key = "web-key".to_string();
        assert!(build_verifier(&config).is_err());

        config.firebase_creds_json = Some("{\"project_id\": \"demo\"}".to_string());
        config.firebase_api_key = String::new();
        assert!(build_verifier(&config).is_err());

        config.firebase_api_key = "web-key".to_string();
        assert!(build_verifier(&config).unwrap().is_some());

        config.firebase_creds_json = None;
        assert!(build_verifier(&config).unwrap().is_none());
    }
}
