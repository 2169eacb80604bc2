//! Serverless-endpoint provider
//!
//! ```text
//! POST {endpoint}/run          {input}   -> {id, status}
//! GET  {endpoint}/status/{id}            -> {status, output?, error?}
//! GET  {endpoint}/result/{id}            -> {output}   (when status omits it)
//! POST {endpoint}/cancel/{id}
//! GET  {endpoint}/health
//! ```
//!
//! Workers upload their own outputs and may also report through the signed
//! webhook, so completed statuses usually carry hosted URLs. Output shapes
//! vary by worker version and are normalised into named artifacts.

use crate::comfy::DEFAULT_CONTROL_TIMEOUT;
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use kiln_core::{
    Artifact, ArtifactLocation, ComputeProvider, Job, JobKind, JobParams, KilnError,
    ProviderHandle, ProviderKind, ProviderStatus, Submission,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Serverless endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerlessConfig {
    /// Endpoint base URL (e.g. `https://api.runpod.ai/v2/<endpoint-id>`)
    pub endpoint_url: String,

    /// API key sent as a bearer token
    pub api_key: Option<String>,

    /// Where workers should post progress and results
    pub webhook_url: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    DEFAULT_CONTROL_TIMEOUT
}

impl ServerlessConfig {
    /// Create a new serverless config
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            webhook_url: None,
            timeout: default_timeout(),
        }
    }

    /// Set API key
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set webhook URL passed to workers
    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Serverless-endpoint compute provider
pub struct ServerlessProvider {
    config: ServerlessConfig,
    client: reqwest::Client,
}

impl ServerlessProvider {
    /// Create a new serverless provider
    pub fn new(config: ServerlessConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{}", self.config.endpoint_url, path));
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Worker input for a job
    pub fn build_input(&self, job: &Job) -> Value {
        let mut input = Map::new();
        input.insert("job_id".into(), json!(job.id.as_str()));
        input.insert("public_id".into(), json!(job.public_id));
        if let Some(url) = &self.config.webhook_url {
            input.insert("webhook_url".into(), json!(url));
        }

        match (&job.kind, &job.params) {
            (
                kind,
                JobParams::Prompt {
                    prompt,
                    negative_prompt,
                    width,
                    height,
                    seed,
                },
            ) => {
                input.insert("job_type".into(), json!(kind.as_str()));
                input.insert("prompt".into(), json!(prompt));
                if let Some(negative) = negative_prompt {
                    input.insert("negative_prompt".into(), json!(negative));
                }
                input.insert("width".into(), json!(width));
                input.insert("height".into(), json!(height));
                if let Some(seed) = seed {
                    input.insert("seed".into(), json!(seed));
                }
            }
            (kind, JobParams::Rotation { image_url, elevation }) => {
                let views = if *kind == JobKind::Rotation4 { 4 } else { 8 };
                input.insert("job_type".into(), json!("rotation"));
                input.insert("input_image_url".into(), json!(image_url));
                input.insert("elevation".into(), json!(elevation));
                input.insert("views".into(), json!(views));
            }
            (
                _,
                JobParams::SingleView {
                    image_url,
                    source,
                    target,
                    elevation,
                },
            ) => {
                input.insert("job_type".into(), json!("rotation"));
                input.insert("input_image_url".into(), json!(image_url));
                input.insert("elevation".into(), json!(elevation));
                input.insert("views".into(), json!(1));
                input.insert("azimuth".into(), json!(source.angle_to(*target)));
            }
        }
        Value::Object(input)
    }

    async fn fetch_result(&self, handle: &ProviderHandle) -> Result<Option<Value>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/result/{}", handle))
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let body: StatusResponse = response.json().await?;
        Ok(body.output)
    }

    fn handle<'a>(job: &'a Job) -> kiln_core::Result<&'a ProviderHandle> {
        job.handle
            .as_ref()
            .ok_or_else(|| KilnError::provider(format!("job {} has no serverless handle", job.id)))
    }
}

/// Turn a worker output blob into named artifacts.
///
/// Accepted shapes (possibly wrapped in `{"result": ...}`):
/// - `{"raw": {"url": ..}, "processed": {"url": ..}}`
/// - `{"raw_url": "..", "rotation_ne_url": ".."}` or `{"rotation_ne": ".."}`
/// - `{"rotations": {"front": {"url": ..}}}`
/// - `{"image": {"url": ..}}` (single processed image)
pub fn normalize_output(output: &Value) -> Vec<Artifact> {
    let root = match output.get("result") {
        Some(inner) if inner.is_object() => inner,
        _ => output,
    };
    let mut artifacts = Vec::new();
    if let Some(map) = root.as_object() {
        collect_urls(map, &mut artifacts);
    }
    artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    artifacts.dedup_by(|a, b| a.name == b.name);
    artifacts
}

fn collect_urls(map: &Map<String, Value>, out: &mut Vec<Artifact>) {
    for (key, value) in map {
        match value {
            Value::String(url)
                if key.ends_with("_url") || key == "url" || key.starts_with("rotation_") =>
            {
                if is_http_url(url) {
                    out.push(Artifact::hosted(output_name(key), url.clone()));
                }
            }
            Value::Object(inner) => match inner.get("url").and_then(Value::as_str) {
                Some(url) if is_http_url(url) => {
                    out.push(Artifact::hosted(output_name(key), url.to_string()))
                }
                _ => collect_urls(inner, out),
            },
            _ => {}
        }
    }
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("https://") || s.starts_with("http://")
}

/// `rotation_ne_url` -> `ne`, `raw_url` -> `raw`, `image` -> `processed`
fn output_name(key: &str) -> String {
    let key = key.strip_suffix("_url").unwrap_or(key);
    let key = key.strip_prefix("rotation_").unwrap_or(key);
    match key {
        "image" | "url" => "processed".to_string(),
        "rotated" => "rotated".to_string(),
        other => other.to_string(),
    }
}

/// Worker-reported error carried in an otherwise successful output
fn output_error(output: &Value) -> Option<String> {
    output.get("error").and_then(|e| match e {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

fn error_text(error: Option<Value>, fallback: &str) -> String {
    match error {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::Null) | None => fallback.to_string(),
        Some(other) => other.to_string(),
    }
}

#[async_trait]
impl ComputeProvider for ServerlessProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Serverless
    }

    fn supports(&self, _kind: JobKind) -> bool {
        true
    }

    async fn submit(&self, job: &Job) -> kiln_core::Result<Submission> {
        let response = self
            .request(reqwest::Method::POST, "/run")
            .json(&json!({ "input": self.build_input(job) }))
            .send()
            .await
            .map_err(OrchestratorError::from)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::api(status, text).into());
        }
        let run: RunResponse = response.json().await.map_err(OrchestratorError::from)?;

        info!(job_id = %job.id, request_id = %run.id, "Submitted to serverless endpoint");
        Ok(Submission::Accepted {
            handle: ProviderHandle::new(run.id),
            instance_id: None,
        })
    }

    async fn status(&self, job: &Job) -> kiln_core::Result<ProviderStatus> {
        let handle = Self::handle(job)?;
        let response = self
            .request(reqwest::Method::GET, &format!("/status/{}", handle))
            .send()
            .await
            .map_err(OrchestratorError::from)?;

        let code = response.status();
        if code == StatusCode::NOT_FOUND || code == StatusCode::GONE {
            // Purged or unknown request ids never come back
            return Ok(ProviderStatus::Failed {
                reason: "Job no longer exists".into(),
            });
        }
        if !code.is_success() {
            // Any other error is the endpoint's trouble, not the job's
            return Ok(ProviderStatus::Transient {
                reason: format!("status endpoint returned {}", code),
            });
        }

        let body: StatusResponse = response.json().await.map_err(OrchestratorError::from)?;
        debug!(job_id = %job.id, status = %body.status, "Serverless status");

        Ok(match body.status.as_str() {
            "IN_QUEUE" => ProviderStatus::Queued,
            "IN_PROGRESS" => {
                let progress = body
                    .output
                    .as_ref()
                    .and_then(|o| o.get("progress"))
                    .and_then(Value::as_u64)
                    .map(|p| p.min(100) as u8);
                let stage = body
                    .output
                    .as_ref()
                    .and_then(|o| o.get("current_stage"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                ProviderStatus::Running { progress, stage }
            }
            "COMPLETED" => {
                let output = match body.output {
                    Some(output) if !output.is_null() => Some(output),
                    _ => self.fetch_result(handle).await?,
                };
                match output {
                    None => ProviderStatus::Transient {
                        reason: "completed without output".into(),
                    },
                    Some(output) => match output_error(&output) {
                        Some(reason) => ProviderStatus::Failed { reason },
                        None => ProviderStatus::Completed(normalize_output(&output)),
                    },
                }
            }
            "FAILED" => ProviderStatus::Failed {
                reason: error_text(body.error, "Job failed"),
            },
            "CANCELLED" => ProviderStatus::Cancelled,
            "TIMED_OUT" => ProviderStatus::Transient {
                reason: "worker execution timed out".into(),
            },
            other => {
                warn!(job_id = %job.id, status = %other, "Unknown serverless status");
                ProviderStatus::Transient {
                    reason: format!("unknown status {}", other),
                }
            }
        })
    }

    async fn fetch_artifact(&self, _job: &Job, artifact: &Artifact) -> kiln_core::Result<Vec<u8>> {
        let ArtifactLocation::Hosted(url) = &artifact.location else {
            return Err(KilnError::Unsupported(
                "serverless outputs are always hosted".into(),
            ));
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(OrchestratorError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::api(status, "failed to download output").into());
        }
        Ok(response
            .bytes()
            .await
            .map_err(OrchestratorError::from)?
            .to_vec())
    }

    async fn cancel(&self, job: &Job) -> kiln_core::Result<()> {
        let handle = Self::handle(job)?;
        self.request(reqwest::Method::POST, &format!("/cancel/{}", handle))
            .send()
            .await
            .map_err(OrchestratorError::from)?
            .error_for_status()
            .map_err(OrchestratorError::from)?;
        info!(job_id = %job.id, request_id = %handle, "Cancelled serverless request");
        Ok(())
    }

    async fn health(&self) -> kiln_core::Result<()> {
        self.request(reqwest::Method::GET, "/health")
            .send()
            .await
            .map_err(OrchestratorError::from)?
            .error_for_status()
            .map_err(OrchestratorError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use kiln_core::{Direction, OwnerRef, TokenSplit};

    async fn spawn_mock() -> String {
        let router = Router::new()
            .route("/run", post(|| async { Json(json!({ "id": "req-1", "status": "IN_QUEUE" })) }))
            .route(
                "/status/{id}",
                get(|Path(id): Path<String>| async move {
                    match id.as_str() {
                        "queued" => Json(json!({ "status": "IN_QUEUE" })).into_response(),
                        "running" => Json(json!({
                            "status": "IN_PROGRESS",
                            "output": { "progress": 20, "current_stage": "Generating sprite..." }
                        }))
                        .into_response(),
                        "done" => Json(json!({
                            "status": "COMPLETED",
                            "output": { "status": "completed", "result": {
                                "raw_url": "https://blob.example/raw.png",
                                "processed_url": "https://blob.example/processed.png",
                                "seed": 12
                            }}
                        }))
                        .into_response(),
                        "deferred" => Json(json!({ "status": "COMPLETED" })).into_response(),
                        "worker-error" => Json(json!({
                            "status": "COMPLETED",
                            "output": { "error": "Missing blob_token" }
                        }))
                        .into_response(),
                        "failed" => Json(json!({ "status": "FAILED", "error": "OOM" })).into_response(),
                        "throttled" => StatusCode::TOO_MANY_REQUESTS.into_response(),
                        "forbidden" => StatusCode::FORBIDDEN.into_response(),
                        "expired" => StatusCode::GONE.into_response(),
                        "overloaded" => StatusCode::SERVICE_UNAVAILABLE.into_response(),
                        _ => StatusCode::NOT_FOUND.into_response(),
                    }
                }),
            )
            .route(
                "/result/{id}",
                get(|| async {
                    Json(json!({ "status": "COMPLETED", "output": {
                        "rotated": { "url": "https://blob.example/right.png" }
                    }}))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    use axum::response::IntoResponse;

    fn job_with_handle(handle: Option<&str>) -> Job {
        let mut job = Job::new(
            "pub1",
            OwnerRef::user("u1"),
            JobKind::Sprite,
            JobParams::Prompt {
                prompt: "archer".into(),
                negative_prompt: None,
                width: 1024,
                height: 1024,
                seed: None,
            },
            ProviderKind::Serverless,
            TokenSplit::new(2, 0),
        );
        job.handle = handle.map(ProviderHandle::new);
        job
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let provider = ServerlessProvider::new(ServerlessConfig::new(spawn_mock().await)).unwrap();

        assert_eq!(
            provider.submit(&job_with_handle(None)).await.unwrap(),
            Submission::Accepted {
                handle: ProviderHandle::new("req-1"),
                instance_id: None
            }
        );
        assert_eq!(
            provider.status(&job_with_handle(Some("queued"))).await.unwrap(),
            ProviderStatus::Queued
        );
        assert_eq!(
            provider.status(&job_with_handle(Some("running"))).await.unwrap(),
            ProviderStatus::Running {
                progress: Some(20),
                stage: Some("Generating sprite...".into())
            }
        );
        assert_eq!(
            provider.status(&job_with_handle(Some("failed"))).await.unwrap(),
            ProviderStatus::Failed { reason: "OOM".into() }
        );
        assert_eq!(
            provider.status(&job_with_handle(Some("purged"))).await.unwrap(),
            ProviderStatus::Failed {
                reason: "Job no longer exists".into()
            }
        );
        assert_eq!(
            provider.status(&job_with_handle(Some("worker-error"))).await.unwrap(),
            ProviderStatus::Failed {
                reason: "Missing blob_token".into()
            }
        );
    }

    #[tokio::test]
    async fn test_http_errors_split_into_gone_and_retryable() {
        let provider = ServerlessProvider::new(ServerlessConfig::new(spawn_mock().await)).unwrap();

        for handle in ["purged", "expired"] {
            assert!(matches!(
                provider.status(&job_with_handle(Some(handle))).await.unwrap(),
                ProviderStatus::Failed { .. }
            ));
        }
        for (handle, code) in [("throttled", "429"), ("forbidden", "403"), ("overloaded", "503")] {
            let ProviderStatus::Transient { reason } =
                provider.status(&job_with_handle(Some(handle))).await.unwrap()
            else {
                panic!("{} should be retryable", handle);
            };
            assert!(reason.contains(code), "{reason}");
        }
    }

    #[tokio::test]
    async fn test_completed_outputs_are_normalised() {
        let provider = ServerlessProvider::new(ServerlessConfig::new(spawn_mock().await)).unwrap();

        let ProviderStatus::Completed(artifacts) =
            provider.status(&job_with_handle(Some("done"))).await.unwrap()
        else {
            panic!("expected completed");
        };
        let names: Vec<_> = artifacts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["processed", "raw"]);

        let ProviderStatus::Completed(artifacts) =
            provider.status(&job_with_handle(Some("deferred"))).await.unwrap()
        else {
            panic!("expected completed via /result");
        };
        assert_eq!(
            artifacts,
            vec![Artifact::hosted("rotated", "https://blob.example/right.png")]
        );
    }

    #[test]
    fn test_normalize_rotation_shapes() {
        let output = json!({
            "rotation_n_url": "https://b/n.png",
            "rotation_ne_url": "https://b/ne.png",
            "seed": 3,
            "rotations": { "front": { "url": "https://b/front.png" } },
            "image": { "url": "https://b/img.png" }
        });
        let names: Vec<String> = normalize_output(&output).into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["front", "n", "ne", "processed"]);
    }

    #[test]
    fn test_single_view_input_carries_azimuth() {
        let provider = ServerlessProvider::new(
            ServerlessConfig::new("http://localhost").with_webhook_url("https://kiln/api/worker/webhook"),
        )
        .unwrap();
        let mut job = job_with_handle(None);
        job.kind = JobKind::RotationSingle;
        job.params = JobParams::SingleView {
            image_url: "https://b/in.png".into(),
            source: Direction::Front,
            target: Direction::Left,
            elevation: 20,
        };
        let input = provider.build_input(&job);
        assert_eq!(input["job_type"], "rotation");
        assert_eq!(input["azimuth"], 270);
        assert_eq!(input["views"], 1);
        assert_eq!(input["webhook_url"], "https://kiln/api/worker/webhook");
        assert_eq!(input["job_id"], job.id.as_str());
    }
}
