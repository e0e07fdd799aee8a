//! Capability seams for the model-backed stages of the pipeline.
//!
//! Every GPU-bound collaborator is reached through one of these traits so the
//! orchestrator can be exercised with stubs and the concrete backend can be
//! swapped without touching request handling.

pub mod inference;
pub mod registry;

use anyhow::Result;
use async_trait::async_trait;
use image::RgbImage;

pub use registry::{ComputeDevice, ModelRegistry, RegistrySlot};

/// An RGB8 bitmap owned by whichever stage decoded it.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage(RgbImage);

impl DecodedImage {
    pub fn new(pixels: RgbImage) -> Self {
        DecodedImage(pixels)
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.0
    }
}

/// Identity features of one detected face.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityEmbedding(Vec<f32>);

impl IdentityEmbedding {
    pub fn new(values: Vec<f32>) -> Self {
        IdentityEmbedding(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// Fixed knobs of the identity-conditioned diffusion call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub conditioning_scale: f32,
    pub guidance_scale: f32,
    pub start_merge_step: u32,
    pub num_images: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        GenerationParams {
            conditioning_scale: 1.0,
            guidance_scale: 7.0,
            start_merge_step: 1,
            num_images: 1,
        }
    }
}

pub struct GenerationInputs<'a> {
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub identity_images: &'a [DecodedImage],
    pub identity_embeddings: &'a [IdentityEmbedding],
    pub pose_image: &'a DecodedImage,
    pub params: GenerationParams,
}

#[async_trait]
pub trait FaceAnalyzer: Send + Sync {
    /// Embedding of the first detected face, `None` when the image has no face.
    async fn extract(&self, image: &DecodedImage) -> Result<Option<IdentityEmbedding>>;
}

#[async_trait]
pub trait PoseDetector: Send + Sync {
    async fn extract_pose(
        &self,
        image: &DecodedImage,
        detect_resolution: u32,
        image_resolution: u32,
    ) -> Result<DecodedImage>;
}

#[async_trait]
pub trait DiffusionPipeline: Send + Sync {
    async fn generate(&self, inputs: GenerationInputs<'_>) -> Result<Vec<DecodedImage>>;
}
