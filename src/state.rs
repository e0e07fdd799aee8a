use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::handlers::access::TokenVerifier;
use crate::llm::{ImageFetcher, PromptGenerator};
use crate::models::{GenerationParams, RegistrySlot};

/// Per-request tunables that stay fixed for the process lifetime.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub pose_detect_resolution: u32,
    pub pose_image_resolution: u32,
    pub jpeg_quality: u8,
    pub generation: GenerationParams,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            pose_detect_resolution: 512,
            pose_image_resolution: 1024,
            jpeg_quality: 75,
            generation: GenerationParams::default(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistrySlot,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub prompts: Arc<dyn PromptGenerator>,
    pub verifier: Option<Arc<dyn TokenVerifier>>,
    pub device_gate: Arc<Semaphore>,
    pub settings: PipelineSettings,
}

impl AppState {
    pub fn new(
        registry: RegistrySlot,
        fetcher: Arc<dyn ImageFetcher>,
        prompts: Arc<dyn PromptGenerator>,
        device_concurrency: usize,
        settings: PipelineSettings,
    ) -> Self {
        AppState {
            registry,
            fetcher,
            prompts,
            verifier: None,
            device_gate: Arc::new(Semaphore::new(device_concurrency.max(1))),
            settings,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }
}
