//! Job-queue ingress for serverless GPU hosts.
//!
//! Each job describes one HTTP call; it is replayed against the local API and
//! the JSON answer is posted back as the job output. Nothing here knows about
//! the generation pipeline.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::Config;

/// A queued job. `input` stays raw so a malformed one can still be answered.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub input: Value,
}

impl Job {
    pub fn parse_input(&self) -> Result<JobInput, serde_json::Error> {
        if self.input.is_null() {
            return Ok(JobInput::default());
        }
        serde_json::from_value(self.input.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobInput {
    #[serde(default = "default_method")]
    pub http_method: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl Default for JobInput {
    fn default() -> Self {
        JobInput {
            http_method: default_method(),
            path: default_path(),
            headers: HashMap::new(),
            body: None,
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn local_target(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

fn forwarded_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!("Dropping unforwardable job header '{}'", name),
        }
    }
    map
}

fn proxy_failure(reason: impl std::fmt::Display) -> Value {
    json!({ "error": format!("Failed to request local server: {reason}") })
}

/// Replays one job against the local API. Failures become an `error` object.
pub async fn handle_job(
    client: &Client,
    base_url: &str,
    input: &JobInput,
    timeout: Duration,
) -> Value {
    let method = match Method::from_bytes(input.http_method.trim().to_uppercase().as_bytes()) {
        Ok(method) => method,
        Err(err) => {
            return proxy_failure(format!("invalid method '{}': {err}", input.http_method));
        }
    };
    let url = local_target(base_url, &input.path);
    debug!("Proxying {} {}", method, url);

    let mut request = client
        .request(method, &url)
        .headers(forwarded_headers(&input.headers))
        .timeout(timeout);
    if let Some(body) = &input.body {
        request = request.json(body);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => return proxy_failure(err),
    };
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(500).collect();
        return proxy_failure(format!("{status} for url ({url}): {snippet}"));
    }

    match response.json::<Value>().await {
        Ok(value) => value,
        Err(err) => proxy_failure(format!("response was not JSON: {err}")),
    }
}

/// Polls `/healthz` until the API answers 2xx or the deadline passes.
pub async fn wait_for_server(
    client: &Client,
    base_url: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<()> {
    let url = local_target(base_url, "/healthz");
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match client.get(&url).timeout(poll.max(Duration::from_secs(1))).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Local API ready after {} attempt(s)", attempts);
                return Ok(());
            }
            Ok(response) => debug!("Readiness check returned {}", response.status()),
            Err(err) => debug!("Readiness check failed: {}", err.without_url()),
        }
        if Instant::now() + poll > deadline {
            return Err(anyhow!(
                "Local API at {} not ready after {:?} ({} probes)",
                base_url,
                timeout,
                attempts
            ));
        }
        tokio::time::sleep(poll).await;
    }
}

/// RunPod-style webhook pair: one endpoint hands out jobs, one takes results.
pub struct JobQueue {
    client: Client,
    get_job_url: String,
    post_output_url: String,
    api_key: String,
    worker_id: String,
}

impl JobQueue {
    pub fn new(
        client: Client,
        get_job_url: &str,
        post_output_url: &str,
        api_key: &str,
        worker_id: &str,
    ) -> Self {
        JobQueue {
            client,
            get_job_url: get_job_url.to_string(),
            post_output_url: post_output_url.to_string(),
            api_key: api_key.to_string(),
            worker_id: worker_id.to_string(),
        }
    }

    pub fn from_config(client: Client, config: &Config) -> Result<Self> {
        if config.runpod_get_job_url.trim().is_empty()
            || config.runpod_post_output_url.trim().is_empty()
        {
            return Err(anyhow!(
                "RUNPOD_WEBHOOK_GET_JOB and RUNPOD_WEBHOOK_POST_OUTPUT must be set in worker mode"
            ));
        }
        Ok(JobQueue::new(
            client,
            &config.runpod_get_job_url,
            &config.runpod_post_output_url,
            &config.runpod_api_key,
            &config.runpod_worker_id,
        ))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            request
        } else {
            request.header(AUTHORIZATION, &self.api_key)
        }
    }

    /// `Ok(None)` when the queue has nothing for this worker right now.
    pub async fn next_job(&self) -> Result<Option<Job>> {
        let url = self.get_job_url.replace("$ID", &self.worker_id);
        let response = self
            .authorized(self.client.get(&url))
            .timeout(Duration::from_secs(90))
            .send()
            .await
            .map_err(|err| anyhow!("Job queue request failed: {}", err.without_url()))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(anyhow!("Job queue returned {}", status));
        }

        let body = response.text().await.context("Failed to read job body")?;
        if body.trim().is_empty() || body.trim() == "{}" {
            return Ok(None);
        }
        let job = serde_json::from_str::<Job>(&body)
            .context("Job queue returned a job without an id")?;
        Ok(Some(job))
    }

    pub async fn post_output(&self, job_id: &str, output: &Value) -> Result<()> {
        let url = self.post_output_url.replace("$ID", job_id);
        let response = self
            .authorized(self.client.post(&url))
            .timeout(Duration::from_secs(60))
            .json(&json!({ "output": output }))
            .send()
            .await
            .map_err(|err| anyhow!("Posting job output failed: {}", err.without_url()))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Job output for {} rejected with {}",
                job_id,
                response.status()
            ));
        }
        Ok(())
    }
}

/// Answers one taken job. Every job gets an output, even when its input is
/// unusable.
pub async fn run_job(
    queue: &JobQueue,
    client: &Client,
    base_url: &str,
    job: &Job,
    timeout: Duration,
) -> Result<()> {
    let started = Instant::now();
    let output = match job.parse_input() {
        Ok(input) => {
            info!(
                job_id = %job.id,
                "Job received: {} {}",
                input.http_method,
                input.path
            );
            handle_job(client, base_url, &input, timeout).await
        }
        Err(err) => proxy_failure(format!("invalid job input: {err}")),
    };
    if let Some(reason) = output.get("error").and_then(Value::as_str) {
        warn!(job_id = %job.id, "Job finished with error: {}", reason);
    }
    queue.post_output(&job.id, &output).await?;
    info!(job_id = %job.id, "Job completed in {}ms", started.elapsed().as_millis());
    Ok(())
}

/// Takes at most one job. Returns whether a job was processed.
pub async fn process_next_job(
    queue: &JobQueue,
    client: &Client,
    base_url: &str,
    timeout: Duration,
) -> Result<bool> {
    let Some(job) = queue.next_job().await? else {
        return Ok(false);
    };
    run_job(queue, client, base_url, &job, timeout).await?;
    Ok(true)
}

/// Job loop. `shutdown` is only observed between jobs; a taken job always
/// runs to completion and has its output posted.
pub async fn serve_jobs<F>(
    queue: &JobQueue,
    client: &Client,
    base_url: &str,
    proxy_timeout: Duration,
    idle: Duration,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        let next = tokio::select! {
            _ = &mut shutdown => break,
            next = queue.next_job() => next,
        };
        let idle_wait = match next {
            Ok(Some(job)) => {
                if let Err(err) = run_job(queue, client, base_url, &job, proxy_timeout).await {
                    error!(job_id = %job.id, "Job output was not delivered: {err:#}");
                }
                continue;
            }
            Ok(None) => idle,
            Err(err) => {
                error!("Job loop error: {err:#}");
                idle
            }
        };
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(idle_wait) => {}
        }
    }
    info!("Shutdown signal received, worker exiting");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}

pub async fn run_worker(config: &Config, client: Client) -> Result<()> {
    let queue = JobQueue::from_config(client.clone(), config)?;
    let proxy_timeout = Duration::from_secs(config.proxy_timeout_secs);
    let idle = Duration::from_millis(config.job_poll_interval_ms.max(50));

    wait_for_server(
        &client,
        &config.local_server_url,
        Duration::from_secs(config.server_ready_timeout_secs),
        Duration::from_millis(config.server_ready_poll_ms.max(50)),
    )
    .await?;
    info!(
        "Serverless worker {} proxying to {}",
        config.runpod_worker_id, config.local_server_url
    );

    serve_jobs(
        &queue,
        &client,
        &config.local_server_url,
        proxy_timeout,
        idle,
        shutdown_signal(),
    )
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::http::HeaderMap as AxumHeaders;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn spawn_local_api() -> String {
        let app = Router::new()
            .route("/healthz", get(|| async { Json(json!({ "status": "ok" })) }))
            .route(
                "/echo",
                post(|headers: AxumHeaders, Json(body): Json<Value>| async move {
                    let trace = headers
                        .get("x-trace")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Json(json!({ "received": body, "trace": trace }))
                }),
            )
            .route(
                "/broken",
                post(|| async {
                    (
                        axum::http::StatusCode::BAD_REQUEST,
                        Json(json!({ "detail": "No faces were found" })),
                    )
                }),
            );
        spawn(app).await
    }

    #[test]
    fn job_input_defaults() {
        let job: Job = serde_json::from_value(json!({ "id": "j1", "input": {} })).unwrap();
        let input = job.parse_input().unwrap();
        assert_eq!(input.http_method, "GET");
        assert_eq!(input.path, "/");
        assert!(input.body.is_none());

        let bare: Job = serde_json::from_value(json!({ "id": "j2" })).unwrap();
        assert_eq!(bare.parse_input().unwrap().path, "/");
        assert_eq!(local_target("http://h:1/", "healthz"), "http://h:1/healthz");
    }

    #[tokio::test]
    async fn job_is_replayed_with_body_and_headers() {
        let base = spawn_local_api().await;
        let input = JobInput {
            http_method: "post".to_string(),
            path: "/echo".to_string(),
            headers: HashMap::from([("x-trace".to_string(), "abc".to_string())]),
            body: Some(json!({ "k": 1 })),
        };
        let output = handle_job(&Client::new(), &base, &input, Duration::from_secs(5)).await;
        assert_eq!(output, json!({ "received": { "k": 1 }, "trace": "abc" }));
    }

    #[tokio::test]
    async fn api_errors_become_error_objects() {
        let base = spawn_local_api().await;
        let input = JobInput {
            http_method: "POST".to_string(),
            path: "/broken".to_string(),
            ..JobInput::default()
        };
        let output = handle_job(&Client::new(), &base, &input, Duration::from_secs(5)).await;
        let message = output["error"].as_str().unwrap();
        assert!(message.starts_with("Failed to request local server:"));
        assert!(message.contains("400"));
    }

    #[tokio::test]
    async fn unreachable_api_becomes_error_object() {
        let output = handle_job(
            &Client::new(),
            "http://127.0.0.1:9",
            &JobInput::default(),
            Duration::from_secs(2),
        )
        .await;
        assert!(output["error"].is_string());
    }

    #[tokio::test]
    async fn readiness_wait_succeeds_and_times_out() {
        let base = spawn_local_api().await;
        wait_for_server(&Client::new(), &base, Duration::from_secs(2), Duration::from_millis(50))
            .await
            .unwrap();

        let err = wait_for_server(
            &Client::new(),
            "http://127.0.0.1:9",
            Duration::from_millis(200),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not ready"));
    }

    #[derive(Clone, Default)]
    struct QueueState {
        jobs: Arc<Mutex<Vec<Value>>>,
        outputs: Arc<Mutex<Vec<(String, Value, String)>>>,
    }

    async fn spawn_queue(state: QueueState) -> String {
        let app = Router::new()
            .route(
                "/job-take/{worker}",
                get(|State(state): State<QueueState>, Path(worker): Path<String>| async move {
                    assert_eq!(worker, "pod-7");
                    match state.jobs.lock().unwrap().pop() {
                        Some(job) => (axum::http::StatusCode::OK, Json(job)).into_response(),
                        None => axum::http::StatusCode::NO_CONTENT.into_response(),
                    }
                }),
            )
            .route(
                "/job-done/{job}",
                post(
                    |State(state): State<QueueState>,
                     Path(job): Path<String>,
                     headers: AxumHeaders,
                     Json(body): Json<Value>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|value| value.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        state.outputs.lock().unwrap().push((job, body, auth));
                        Json(json!({}))
                    },
                ),
            )
            .with_state(state);
        spawn(app).await
    }

    #[tokio::test]
    async fn worker_takes_job_and_posts_output() {
        let api = spawn_local_api().await;
        let state = QueueState::default();
        state.jobs.lock().unwrap().push(json!({
            "id": "job-1",
            "input": { "http_method": "POST", "path": "/echo", "body": { "n": 2 } }
        }));
        let queue_base = spawn_queue(state.clone()).await;
        let queue = JobQueue::new(
            Client::new(),
            &format!("{queue_base}/job-take/$ID"),
            &format!("{queue_base}/job-done/$ID"),
            "secret-key",
            "pod-7",
        );

        let client = Client::new();
        let timeout = Duration::from_secs(5);
        assert!(process_next_job(&queue, &client, &api, timeout).await.unwrap());
        assert!(!process_next_job(&queue, &client, &api, timeout).await.unwrap());

        let outputs = state.outputs.lock().unwrap().clone();
        assert_eq!(outputs.len(), 1);
        let (job_id, body, auth) = &outputs[0];
        assert_eq!(job_id, "job-1");
        assert_eq!(body["output"]["received"], json!({ "n": 2 }));
        assert_eq!(auth, "secret-key");
    }

    fn queue_for(base: &str) -> JobQueue {
        JobQueue::new(
            Client::new(),
            &format!("{base}/job-take/$ID"),
            &format!("{base}/job-done/$ID"),
            "secret-key",
            "pod-7",
        )
    }

    #[tokio::test]
    async fn malformed_job_input_is_still_answered() {
        let api = spawn_local_api().await;
        let state = QueueState::default();
        state.jobs.lock().unwrap().push(json!({
            "id": "job-9",
            "input": { "headers": { "x-retry": 1 } }
        }));
        let queue = queue_for(&spawn_queue(state.clone()).await);

        let processed = process_next_job(&queue, &Client::new(), &api, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(processed);

        let outputs = state.outputs.lock().unwrap().clone();
        assert_eq!(outputs.len(), 1);
        let (job_id, body, _) = &outputs[0];
        assert_eq!(job_id, "job-9");
        let message = body["output"]["error"].as_str().unwrap();
        assert!(message.starts_with("Failed to request local server: invalid job input"));
    }

    #[tokio::test]
    async fn shutdown_during_job_still_posts_output() {
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let started_tx = Arc::new(Mutex::new(Some(started_tx)));
        let app = Router::new().route(
            "/slow",
            get(move || {
                let started_tx = started_tx.clone();
                async move {
                    if let Some(tx) = started_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Json(json!({ "done": true }))
                }
            }),
        );
        let api = spawn(app).await;

        let state = QueueState::default();
        state.jobs.lock().unwrap().push(json!({
            "id": "job-slow",
            "input": { "path": "/slow" }
        }));
        let queue = queue_for(&spawn_queue(state.clone()).await);
        let shutdown = async move {
            let _ = started_rx.await;
        };

        tokio::time::timeout(
            Duration::from_secs(5),
            serve_jobs(
                &queue,
                &Client::new(),
                &api,
                Duration::from_secs(5),
                Duration::from_millis(20),
                shutdown,
            ),
        )
        .await
        .unwrap();

        let outputs = state.outputs.lock().unwrap().clone();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].0, "job-slow");
        assert_eq!(outputs[0].1["output"], json!({ "done": true }));
    }
}
