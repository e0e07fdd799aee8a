pub mod gemini;
pub mod media;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::DecodedImage;

pub use gemini::GeminiPromptGenerator;
pub use media::{HttpImageFetcher, ImageFetcher};

#[async_trait]
pub trait PromptGenerator: Send + Sync {
    /// Returns the model's text verbatim; no parsing or validation is applied.
    async fn generate_prompt(&self, image: &DecodedImage) -> Result<String>;
}
