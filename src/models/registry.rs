use std::fmt;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::models::inference::{InferenceClient, LoadModelsRequest};
use crate::models::{DiffusionPipeline, FaceAnalyzer, PoseDetector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeDevice {
    Cuda,
    Cpu,
    Other(String),
}

impl ComputeDevice {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "cuda" | "gpu" => ComputeDevice::Cuda,
            "cpu" => ComputeDevice::Cpu,
            other => ComputeDevice::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeDevice::Cuda => write!(f, "cuda"),
            ComputeDevice::Cpu => write!(f, "cpu"),
            ComputeDevice::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Loaded capability handles. Built once, shared read-only afterwards.
#[derive(Clone)]
pub struct ModelRegistry {
    pub pipeline: Arc<dyn DiffusionPipeline>,
    pub face_analyzer: Arc<dyn FaceAnalyzer>,
    pub pose_detector: Arc<dyn PoseDetector>,
    pub device: ComputeDevice,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Write-once holder; readers see either nothing or the finished registry.
#[derive(Clone, Default)]
pub struct RegistrySlot(Arc<OnceLock<ModelRegistry>>);

impl RegistrySlot {
    pub fn empty() -> Self {
        RegistrySlot::default()
    }

    #[cfg(test)]
    pub fn ready(registry: ModelRegistry) -> Self {
        let slot = RegistrySlot::empty();
        // A fresh slot cannot already be filled.
        let _ = slot.0.set(registry);
        slot
    }

    pub fn install(&self, registry: ModelRegistry) -> Result<()> {
        self.0
            .set(registry)
            .map_err(|_| anyhow!("model registry is already populated"))
    }

    pub fn get(&self) -> Option<&ModelRegistry> {
        self.0.get()
    }
}

fn load_request(config: &Config, download_only: bool) -> LoadModelsRequest {
    LoadModelsRequest {
        cache_dir: config.model_cache_dir.clone(),
        device: if download_only {
            "cpu".to_string()
        } else {
            config.preferred_device.clone()
        },
        download_only,
        manifest: config.model_manifest.clone(),
    }
}

/// Loads every model on the worker and wires the handles into a registry.
pub async fn load_models(client: Arc<InferenceClient>, config: &Config) -> Result<ModelRegistry> {
    let request = load_request(config, false);
    info!(
        "Loading models via {} (base={}, controlnet={}, adapter={}, cache={})",
        client.base_url(),
        request.manifest.base_model_repo,
        request.manifest.controlnet_repo,
        request.manifest.photomaker_repo,
        request.cache_dir.display()
    );

    let response = client.load_models(&request).await?;
    let device = response
        .device
        .as_deref()
        .map(ComputeDevice::parse)
        .unwrap_or_else(|| ComputeDevice::parse(&request.device));
    let preferred = ComputeDevice::parse(&request.device);
    if device != preferred {
        warn!(
            "Preferred device {} unavailable; models were loaded on {}",
            preferred, device
        );
    }
    info!(
        "Models loaded on {} (dtype={}, components={})",
        device,
        response.dtype.as_deref().unwrap_or("unknown"),
        response.loaded.join(", ")
    );

    Ok(ModelRegistry {
        pipeline: client.clone(),
        face_analyzer: client.clone(),
        pose_detector: client,
        device,
    })
}

/// Warms the weight cache without loading anything into memory.
pub async fn prefetch_models(client: &InferenceClient, config: &Config) -> Result<()> {
    let request = load_request(config, true);
    info!(
        "Prefetching model weights into {}",
        request.cache_dir.display()
    );
    client.load_models(&request).await?;
    info!("All model weights are cached");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn spawn_loader(device: &'static str) -> String {
        let app = Router::new().route(
            "/v1/models/load",
            post(move |Json(body): Json<Value>| async move {
                let reported = if body["download_only"] == json!(true) {
                    "cpu"
                } else {
                    device
                };
                Json(json!({
                    "device": reported,
                    "dtype": "float16",
                    "loaded": ["pipe", "face_detector", "openpose"],
                    "echo": body,
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_config() -> Config {
        let mut config = Config::load().unwrap();
        config.preferred_device = "cuda".to_string();
        config
    }

    #[test]
    fn slot_is_write_once() {
        let slot = RegistrySlot::empty();
        assert!(slot.get().is_none());
        let client = Arc::new(InferenceClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            "",
            Duration::from_secs(1),
        ));
        let registry = ModelRegistry {
            pipeline: client.clone(),
            face_analyzer: client.clone(),
            pose_detector: client,
            device: ComputeDevice::Cpu,
        };
        slot.install(registry.clone()).unwrap();
        assert!(slot.get().is_some());
        assert!(slot.install(registry).is_err());
        assert_eq!(slot.get().unwrap().device, ComputeDevice::Cpu);
    }

    #[test]
    fn device_names_parse() {
        assert_eq!(ComputeDevice::parse("CUDA"), ComputeDevice::Cuda);
        assert_eq!(ComputeDevice::parse("cpu"), ComputeDevice::Cpu);
        assert_eq!(ComputeDevice::parse("mps").to_string(), "mps");
    }

    #[tokio::test]
    async fn load_reports_worker_device() {
        let base = spawn_loader("cpu").await;
        let client = Arc::new(InferenceClient::new(
            reqwest::Client::new(),
            &base,
            "",
            Duration::from_secs(5),
        ));
        let registry = load_models(client, &test_config()).await.unwrap();
        assert_eq!(registry.device, ComputeDevice::Cpu);
    }

    #[tokio::test]
    async fn prefetch_runs_download_only() {
        let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
        let recorder = seen.clone();
        let app = Router::new().route(
            "/v1/models/load",
            post(move |Json(body): Json<Value>| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push(body);
                    Json(json!({ "device": "cpu", "loaded": [] }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = InferenceClient::new(
            reqwest::Client::new(),
            &format!("http://{addr}"),
            "",
            Duration::from_secs(5),
        );
        let config = test_config();
        prefetch_models(&client, &config).await.unwrap();

        let bodies = seen.lock().unwrap().clone();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["download_only"], json!(true));
        assert_eq!(bodies[0]["device"], json!("cpu"));
        assert_eq!(
            bodies[0]["manifest"]["base_model_repo"],
            json!(config.model_manifest.base_model_repo)
        );
    }

    #[tokio::test]
    async fn unreachable_worker_fails_load() {
        let client = Arc::new(InferenceClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            "",
            Duration::from_secs(1),
        ));
        assert!(load_models(client, &test_config()).await.is_err());
    }
}
