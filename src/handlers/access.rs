use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::ServiceAccountCredentials;
use crate::error::PipelineError;
use crate::state::AppState;

pub const IDENTITY_TOOLKIT_BASE: &str = "https://identitytoolkit.googleapis.com/v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUser {
    pub uid: String,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedUser, PipelineError>;
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Rejects requests without a valid bearer token when a verifier is configured.
pub async fn require_bearer_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(verifier) = state.verifier.clone() else {
        return next.run(request).await;
    };

    let Some(token) = extract_bearer_token(request.headers()).map(str::to_owned) else {
        warn!("Rejected {} without bearer token", request.uri().path());
        return PipelineError::Unauthorized("Missing or malformed bearer token".to_string())
            .into_response();
    };

    match verifier.verify(&token).await {
        Ok(user) => {
            debug!(uid = %user.uid, "Bearer token accepted");
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(err) => {
            warn!("Rejected {}: {}", request.uri().path(), err);
            err.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct LookupUser {
    #[serde(rename = "localId")]
    local_id: String,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

/// Verifies Firebase ID tokens through the Identity Toolkit account lookup.
pub struct FirebaseTokenVerifier {
    client: Client,
    base_url: String,
    api_key: String,
    project_id: String,
}

impl FirebaseTokenVerifier {
    pub fn new(client: Client, credentials: &ServiceAccountCredentials, api_key: &str) -> Self {
        info!(
            "Bearer-token auth enabled for project {} ({})",
            credentials.project_id,
            credentials.client_email.as_deref().unwrap_or("no client email")
        );
        FirebaseTokenVerifier {
            client,
            base_url: IDENTITY_TOOLKIT_BASE.to_string(),
            api_key: api_key.trim().to_string(),
            project_id: credentials.project_id.clone(),
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl TokenVerifier for FirebaseTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedUser, PipelineError> {
        let endpoint = format!("{}/accounts:lookup", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .timeout(Duration::from_secs(10))
            .json(&json!({ "idToken": token, "targetProjectId": self.project_id }))
            .send()
            .await
            .map_err(|err| {
                warn!("Identity provider unreachable: {}", err.without_url());
                PipelineError::Unauthorized("Unable to verify token".to_string())
            })?;

        if !response.status().is_success() {
            debug!("Identity provider rejected token with status {}", response.status());
            return Err(PipelineError::Unauthorized("Invalid or expired token".to_string()));
        }

        let lookup = response.json::<LookupResponse>().await.map_err(|err| {
            warn!("Unreadable identity provider response: {err}");
            PipelineError::Unauthorized("Unable to verify token".to_string())
        })?;

        match lookup.users.into_iter().next() {
            Some(user) if !user.disabled => Ok(VerifiedUser { uid: user.local_id }),
            Some(_) => Err(PipelineError::Unauthorized("Account is disabled".to_string())),
            None => Err(PipelineError::Unauthorized("Invalid or expired token".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::{HeaderValue, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;
    use std::collections::HashMap;

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer   tok "));
        assert_eq!(extract_bearer_token(&headers), Some("tok"));
    }

    #[test]
    fn other_schemes_are_ignored() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(extract_bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    async fn spawn_identity_provider() -> String {
        let app = Router::new().route(
            "/v1/accounts:lookup",
            post(
                |Query(query): Query<HashMap<String, String>>, Json(body): Json<Value>| async move {
                    if query.get("key").map(String::as_str) != Some("web-key") {
                        return (
                            StatusCode::BAD_REQUEST,
                            Json(json!({ "error": "API key not valid" })),
                        );
                    }
                    match body["idToken"].as_str() {
                        Some("good") => (
                            StatusCode::OK,
                            Json(json!({ "users": [{ "localId": "user-1" }] })),
                        ),
                        Some("disabled") => (
                            StatusCode::OK,
                            Json(json!({ "users": [{ "localId": "user-2", "disabled": true }] })),
                        ),
                        _ => (
                            StatusCode::BAD_REQUEST,
                            Json(json!({ "error": { "message": "INVALID_ID_TOKEN" } })),
                        ),
                    }
                },
            ),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn verifier(base: &str) -> FirebaseTokenVerifier {
        let creds = ServiceAccountCredentials {
            project_id: "photoshoot-test".to_string(),
            client_email: None,
        };
        FirebaseTokenVerifier::new(Client::new(), &creds, "web-key").with_base_url(base)
    }

    #[tokio::test]
    async fn valid_token_yields_user() {
        let base = spawn_identity_provider().await;
        let user = verifier(&base).verify("good").await.unwrap();
        assert_eq!(user.uid, "user-1");
    }

    #[tokio::test]
    async fn invalid_or_disabled_tokens_are_unauthorized() {
        let base = spawn_identity_provider().await;
        let verifier = verifier(&base);
        for token in ["expired", "disabled"] {
            let err = verifier.verify(token).await.unwrap_err();
            assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED, "{token}");
        }
    }
}
