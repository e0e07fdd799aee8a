//! Failure taxonomy of the generate pipeline and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Failed to download image from URL: {url}. Error: {reason}")]
    Download { url: String, reason: String },

    #[error("Failed to decode image from URL: {url}. Error: {reason}")]
    Decode { url: String, reason: String },

    #[error("No faces were found on any of the provided user photos.")]
    NoFaceFound,

    #[error("{0}")]
    Unauthorized(String),

    #[error("Models are not loaded yet, try again in a minute.")]
    NotReady,

    #[error("LLM API request failed: {0}")]
    Upstream(String),

    #[error("{stage} failed: {reason}")]
    Inference { stage: &'static str, reason: String },

    #[error("Image generation failed: {0}")]
    Generation(String),

    #[error("Failed to encode generated image: {0}")]
    Encode(String),
}

impl PipelineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::Download { .. }
            | Self::Decode { .. }
            | Self::NoFaceFound => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_)
            | Self::Inference { .. }
            | Self::Generation(_)
            | Self::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label for logs and the timing stream.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Download { .. } => "download_error",
            Self::Decode { .. } => "decode_error",
            Self::NoFaceFound => "no_face_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotReady => "not_ready",
            Self::Upstream(_) => "upstream_llm_error",
            Self::Inference { .. } => "inference_error",
            Self::Generation(_) => "generation_failure",
            Self::Encode(_) => "encode_error",
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, Json(json!({ "detail": self.to_string() }))).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

/// Keeps only the outermost message of an error chain so client bodies never
/// carry internal detail.
pub fn short_reason(err: &anyhow::Error) -> String {
    let text = err.to_string();
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= 300 {
        return line.to_string();
    }
    let truncated: String = line.chars().take(300).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn client_failures_map_to_400() {
        let errors = [
            PipelineError::InvalidRequest("bad".into()),
            PipelineError::Download {
                url: "https://x.test/a.jpg".into(),
                reason: "404".into(),
            },
            PipelineError::Decode {
                url: "https://x.test/a.jpg".into(),
                reason: "not an image".into(),
            },
            PipelineError::NoFaceFound,
        ];
        for err in errors {
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST, "{}", err.kind());
            assert!(err.is_client_error());
        }
    }

    #[test]
    fn server_side_failures_map_to_5xx() {
        assert_eq!(PipelineError::NotReady.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            PipelineError::Upstream("quota".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            PipelineError::Generation("oom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            PipelineError::Unauthorized("missing token".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn download_message_names_the_url() {
        let err = PipelineError::Download {
            url: "https://cdn.test/ref.jpg".into(),
            reason: "HTTP status 404 Not Found".into(),
        };
        assert!(err.to_string().contains("https://cdn.test/ref.jpg"));
    }

    #[test]
    fn short_reason_drops_context_chain() {
        let err = anyhow!("root cause").context("worker returned 500");
        assert_eq!(short_reason(&err), "worker returned 500");

        let long = anyhow!("{}", "x".repeat(400));
        assert_eq!(short_reason(&long).chars().count(), 303);
    }
}
