//! Marketplace-queue provider
//!
//! A hosted node-graph service with its own queue. Requests carry the API key
//! as a bearer token plus a session cookie obtained by logging in. The cookie
//! is cached on the adapter; when the service answers 401 or redirects to its
//! login page (302) the adapter logs in again and retries the request once.
//!
//! ```text
//! request ──► 200 ─────────────────────────────► ok
//!    │
//!    └─► 401/302 ─► POST /login (basic auth) ─► retry once ─► ok / error
//! ```

use crate::comfy::{self, QueuePosition, Workflow, DEFAULT_CONTROL_TIMEOUT};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kiln_core::{
    Artifact, ComputeProvider, Job, JobKind, KilnError, ProviderHandle, ProviderKind,
    ProviderStatus, Submission,
};
use reqwest::{header, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Marketplace configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    /// Service base URL
    pub base_url: String,

    /// API key sent as a bearer token
    pub api_key: Option<String>,

    /// Account used to obtain a session cookie
    pub username: Option<String>,

    /// Password for `username`
    pub password: Option<String>,

    /// Client id reported with every queued prompt
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Per-request timeout
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
}

fn default_client_id() -> String {
    "spritekiln".to_string()
}

fn default_timeout() -> Duration {
    DEFAULT_CONTROL_TIMEOUT
}

impl MarketplaceConfig {
    /// Create a new marketplace config
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            username: None,
            password: None,
            client_id: default_client_id(),
            timeout: default_timeout(),
        }
    }

    /// Set API key
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set login credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Marketplace-queue compute provider
pub struct MarketplaceProvider {
    config: MarketplaceConfig,
    client: reqwest::Client,
    /// Session cookie; scoped to this adapter instance
    session: RwLock<Option<String>>,
}

impl MarketplaceProvider {
    /// Create a new marketplace provider
    pub fn new(config: MarketplaceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            config,
            client,
            session: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn authorize(&self, mut request: RequestBuilder, cookie: Option<&str>) -> RequestBuilder {
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        request
    }

    /// Log in and cache the session cookie
    async fn login(&self) -> Result<String> {
        let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) else {
            return Err(OrchestratorError::config(
                "marketplace session expired and no credentials are configured",
            ));
        };
        let basic = BASE64.encode(format!("{}:{}", user, pass));

        let response = self
            .client
            .post(self.url("/login"))
            .header(header::AUTHORIZATION, format!("Basic {}", basic))
            .send()
            .await?;

        let status = response.status();
        if !(status.is_success() || status.is_redirection()) {
            return Err(OrchestratorError::api(status, "marketplace login rejected"));
        }

        let cookie = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        if cookie.is_empty() {
            return Err(OrchestratorError::InvalidPayload(
                "marketplace login returned no session cookie".into(),
            ));
        }

        info!("Marketplace session refreshed");
        *self.session.write().await = Some(cookie.clone());
        Ok(cookie)
    }

    /// Send a request, re-authenticating once on 401/302
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<reqwest::Response> {
        let build = |cookie: Option<&str>| {
            let mut request = self.client.request(method.clone(), self.url(path));
            if let Some(body) = body {
                request = request.json(body);
            }
            self.authorize(request, cookie)
        };

        let cached = self.session.read().await.clone();
        let response = build(cached.as_deref()).send().await?;
        if !matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FOUND) {
            return Ok(response);
        }

        debug!(path, status = %response.status(), "Marketplace session rejected, logging in");
        let cookie = self.login().await?;
        let retry = build(Some(&cookie)).send().await?;
        if matches!(retry.status(), StatusCode::UNAUTHORIZED | StatusCode::FOUND) {
            return Err(OrchestratorError::api(retry.status(), "marketplace rejected fresh session"));
        }
        Ok(retry)
    }

    async fn send_json(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let response = self.send(method, path, body).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::api(status, text));
        }
        Ok(response.json().await?)
    }

    fn handle<'a>(job: &'a Job) -> kiln_core::Result<&'a ProviderHandle> {
        job.handle
            .as_ref()
            .ok_or_else(|| KilnError::provider(format!("job {} has no marketplace handle", job.id)))
    }
}

#[async_trait]
impl ComputeProvider for MarketplaceProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Marketplace
    }

    fn supports(&self, kind: JobKind) -> bool {
        comfy::supports(kind)
    }

    async fn submit(&self, job: &Job) -> kiln_core::Result<Submission> {
        let workflow = Workflow::for_job(job.kind, &job.params).ok_or_else(|| {
            KilnError::Unsupported(format!("marketplace cannot run {} jobs", job.kind))
        })?;
        let body = workflow.prompt_body(&self.config.client_id);
        let response = self.send_json(Method::POST, "/prompt", Some(&body)).await?;
        let prompt_id = comfy::parse_prompt_response(&response)?;

        info!(job_id = %job.id, prompt_id = %prompt_id, "Submitted to marketplace");
        Ok(Submission::Accepted {
            handle: ProviderHandle::new(prompt_id),
            instance_id: None,
        })
    }

    async fn status(&self, job: &Job) -> kiln_core::Result<ProviderStatus> {
        let handle = Self::handle(job)?;
        let history_path = format!("/history/{}", handle);

        let history = self.send_json(Method::GET, &history_path, None).await?;
        if let Some(status) = comfy::parse_history(job.kind, handle.as_str(), &history) {
            return Ok(status);
        }

        let queue = self.send_json(Method::GET, "/queue", None).await?;
        match comfy::parse_queue(handle.as_str(), &queue) {
            QueuePosition::Running => Ok(ProviderStatus::Running {
                progress: None,
                stage: None,
            }),
            QueuePosition::Pending => Ok(ProviderStatus::Queued),
            QueuePosition::Absent => {
                // It may have finished between the two reads
                let history = self.send_json(Method::GET, &history_path, None).await?;
                Ok(comfy::parse_history(job.kind, handle.as_str(), &history).unwrap_or(
                    ProviderStatus::Transient {
                        reason: "prompt not found in queue or history".into(),
                    },
                ))
            }
        }
    }

    async fn fetch_artifact(&self, _job: &Job, artifact: &Artifact) -> kiln_core::Result<Vec<u8>> {
        let query = comfy::view_query(artifact)?;
        let path = format!(
            "/view?{}",
            query
                .iter()
                .map(|(k, v)| format!("{}={}", k, encode_query_value(v)))
                .collect::<Vec<_>>()
                .join("&")
        );
        let response = self.send(Method::GET, &path, None).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::api(status, "failed to fetch image").into());
        }
        Ok(response
            .bytes()
            .await
            .map_err(OrchestratorError::from)?
            .to_vec())
    }

    async fn cancel(&self, job: &Job) -> kiln_core::Result<()> {
        let handle = Self::handle(job)?;
        // Shared queue: only remove our own prompt, never interrupt
        let body = json!({ "delete": [handle.as_str()] });
        let response = self.send(Method::POST, "/queue", Some(&body)).await?;
        if !response.status().is_success() {
            warn!(job_id = %job.id, status = %response.status(), "Marketplace cancel not acknowledged");
        }
        Ok(())
    }

    async fn health(&self) -> kiln_core::Result<()> {
        self.send_json(Method::GET, "/system_stats", None).await?;
        Ok(())
    }
}

/// Percent-encode a query value (RFC 3986 unreserved characters pass through)
fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
