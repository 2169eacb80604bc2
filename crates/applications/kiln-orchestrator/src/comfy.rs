//! Node-graph worker API
//!
//! Both the marketplace backend and the self-hosted pool run the same
//! node-graph inference server. This module builds the workflow graph for a
//! job and understands the server's REST surface:
//!
//! ```text
//! POST /prompt         {prompt: <graph>, client_id}  -> {prompt_id}
//! GET  /history/{id}   {id: {outputs, status}}        (absent until finished)
//! GET  /queue          {queue_running, queue_pending}
//! GET  /view?filename&subfolder&type                  -> image bytes
//! POST /queue          {delete: [id]}
//! POST /interrupt
//! GET  /system_stats                                  health probe
//! ```

use crate::error::{OrchestratorError, Result};
use kiln_core::{Artifact, ArtifactLocation, JobKind, JobParams, ProviderStatus};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

/// Default worker port on self-hosted instances
pub const DEFAULT_WORKER_PORT: u16 = 8188;

/// Timeout applied to every control call
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound (exclusive) of generated sampler seeds
const MAX_SEED: u64 = 2_147_483_647;

/// Checkpoint the default graphs load
const DEFAULT_CHECKPOINT: &str = "flux/schnell";

/// A node graph ready to be queued
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    nodes: Map<String, Value>,
}

impl Workflow {
    fn new() -> Self {
        Self { nodes: Map::new() }
    }

    fn node(mut self, id: &str, class_type: &str, inputs: Value) -> Self {
        self.nodes.insert(
            id.to_string(),
            json!({ "class_type": class_type, "inputs": inputs }),
        );
        self
    }

    /// Text-to-image graph for sprites and textures.
    ///
    /// Returns `None` for kinds the node-graph backends do not run.
    pub fn for_job(kind: JobKind, params: &JobParams) -> Option<Self> {
        let JobParams::Prompt {
            prompt,
            negative_prompt,
            width,
            height,
            seed,
        } = params
        else {
            return None;
        };
        let styled = match kind {
            JobKind::Sprite => format!("{}, game sprite, centered, plain background", prompt),
            JobKind::Texture => format!("{}, seamless tileable texture, top-down", prompt),
            _ => return None,
        };
        let seed = seed.unwrap_or_else(|| rand::thread_rng().gen_range(0..MAX_SEED));

        Some(
            Self::new()
                .node(
                    "model_loader",
                    "CheckpointLoaderSimple",
                    json!({ "ckpt_name": DEFAULT_CHECKPOINT }),
                )
                .node(
                    "clip_loader",
                    "CLIPLoader",
                    json!({ "clip_name": DEFAULT_CHECKPOINT }),
                )
                .node(
                    "vae_loader",
                    "VAELoader",
                    json!({ "vae_name": DEFAULT_CHECKPOINT }),
                )
                .node(
                    "positive_prompt",
                    "CLIPTextEncode",
                    json!({ "text": styled, "clip": ["clip_loader", 0] }),
                )
                .node(
                    "negative_prompt",
                    "CLIPTextEncode",
                    json!({
                        "text": negative_prompt.clone().unwrap_or_default(),
                        "clip": ["clip_loader", 0]
                    }),
                )
                .node(
                    "latent",
                    "EmptyLatentImage",
                    json!({ "width": width, "height": height, "batch_size": 1 }),
                )
                .node(
                    "sampler",
                    "KSampler",
                    json!({
                        "seed": seed,
                        "steps": 20,
                        "cfg": 7,
                        "sampler_name": "euler",
                        "scheduler": "normal",
                        "denoise": 1,
                        "model": ["model_loader", 0],
                        "positive": ["positive_prompt", 0],
                        "negative": ["negative_prompt", 0],
                        "latent_image": ["latent", 0]
                    }),
                )
                .node(
                    "decoder",
                    "VAEDecode",
                    json!({ "samples": ["sampler", 0], "vae": ["vae_loader", 0] }),
                )
                .node(
                    "save",
                    "SaveImage",
                    json!({ "filename_prefix": kind.as_str(), "images": ["decoder", 0] }),
                ),
        )
    }

    /// Seed the sampler will use
    pub fn seed(&self) -> Option<u64> {
        self.nodes.get("sampler")?.get("inputs")?.get("seed")?.as_u64()
    }

    /// `POST /prompt` body
    pub fn prompt_body(&self, client_id: &str) -> Value {
        json!({ "prompt": Value::Object(self.nodes.clone()), "client_id": client_id })
    }
}

/// Kinds the node-graph backends can run
pub fn supports(kind: JobKind) -> bool {
    matches!(kind, JobKind::Sprite | JobKind::Texture)
}

/// Name of the first output image for a kind
fn primary_output(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Texture => "basecolor",
        _ => "raw",
    }
}

#[derive(Debug, Deserialize)]
struct PromptResponse {
    prompt_id: String,
}

/// Extract the prompt id from a `POST /prompt` response
pub fn parse_prompt_response(body: &Value) -> Result<String> {
    let parsed: PromptResponse = serde_json::from_value(body.clone())?;
    Ok(parsed.prompt_id)
}

#[derive(Debug, Deserialize)]
struct ImageRef {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// Interpret a `GET /history/{id}` body.
///
/// `None` means the prompt has no history entry yet (still queued or running).
pub fn parse_history(kind: JobKind, prompt_id: &str, body: &Value) -> Option<ProviderStatus> {
    let entry = body.get(prompt_id)?;
    let status = entry.get("status");

    let messages = status
        .and_then(|s| s.get("messages"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for message in &messages {
        if message.get(0).and_then(Value::as_str) == Some("execution_error") {
            let reason = message
                .get(1)
                .and_then(|d| d.get("exception_message"))
                .and_then(Value::as_str)
                .map(|m| format!("Workflow execution error: {}", m.trim()))
                .unwrap_or_else(|| "Workflow execution error".to_string());
            return Some(ProviderStatus::Failed { reason });
        }
    }

    if status.and_then(|s| s.get("status_str")).and_then(Value::as_str) == Some("error") {
        return Some(ProviderStatus::Failed {
            reason: "Workflow execution error".to_string(),
        });
    }

    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !completed {
        return Some(ProviderStatus::Running {
            progress: None,
            stage: None,
        });
    }

    // Node ids are ordered so output naming is stable across polls
    let mut images = Vec::new();
    if let Some(outputs) = entry.get("outputs").and_then(Value::as_object) {
        let mut node_ids: Vec<&String> = outputs.keys().collect();
        node_ids.sort();
        for node_id in node_ids {
            if let Some(list) = outputs[node_id].get("images") {
                if let Ok(refs) = serde_json::from_value::<Vec<ImageRef>>(list.clone()) {
                    images.extend(refs);
                }
            }
        }
    }

    let primary = primary_output(kind);
    let artifacts = images
        .into_iter()
        .enumerate()
        .map(|(i, image)| Artifact {
            name: if i == 0 {
                primary.to_string()
            } else {
                format!("{}_{}", primary, i)
            },
            location: ArtifactLocation::Remote {
                filename: image.filename,
                subfolder: image.subfolder,
                folder_type: image.folder_type,
            },
        })
        .collect();
    Some(ProviderStatus::Completed(artifacts))
}

/// Where a prompt sits in the server queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    Running,
    Pending,
    Absent,
}

/// Interpret a `GET /queue` body for one prompt.
///
/// Queue entries are arrays of `[number, prompt_id, graph, extra, outputs]`.
pub fn parse_queue(prompt_id: &str, body: &Value) -> QueuePosition {
    let contains = |key: &str| {
        body.get(key)
            .and_then(Value::as_array)
            .is_some_and(|items| {
                items
                    .iter()
                    .any(|item| item.get(1).and_then(Value::as_str) == Some(prompt_id))
            })
    };
    if contains("queue_running") {
        QueuePosition::Running
    } else if contains("queue_pending") {
        QueuePosition::Pending
    } else {
        QueuePosition::Absent
    }
}

/// Query string for `GET /view`
pub fn view_query(artifact: &Artifact) -> Result<Vec<(&'static str, String)>> {
    match &artifact.location {
        ArtifactLocation::Remote {
            filename,
            subfolder,
            folder_type,
        } => Ok(vec![
            ("filename", filename.clone()),
            ("subfolder", subfolder.clone()),
            ("type", folder_type.clone()),
        ]),
        ArtifactLocation::Hosted(url) => Err(OrchestratorError::InvalidPayload(format!(
            "artifact {} is already hosted at {}",
            artifact.name, url
        ))),
    }
}

/// Plain client for a worker reachable without credentials
#[derive(Clone)]
pub struct ComfyClient {
    base_url: String,
    client: reqwest::Client,
}

impl ComfyClient {
    /// Client for `base_url` sharing an existing connection pool
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Base URL of the worker
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn json_or_error(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::api(status, text));
        }
        Ok(response.json().await?)
    }

    /// Queue a workflow, returning the prompt id
    pub async fn queue_prompt(&self, workflow: &Workflow, client_id: &str) -> Result<String> {
        let url = format!("{}/prompt", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&workflow.prompt_body(client_id))
            .send()
            .await?;
        let body = Self::json_or_error(response).await?;
        let prompt_id = parse_prompt_response(&body)?;
        debug!(prompt_id = %prompt_id, base_url = %self.base_url, "Queued workflow");
        Ok(prompt_id)
    }

    /// Raw history body for a prompt
    pub async fn history(&self, prompt_id: &str) -> Result<Value> {
        let url = format!("{}/history/{}", self.base_url, prompt_id);
        let response = self.client.get(&url).send().await?;
        Self::json_or_error(response).await
    }

    /// Raw queue body
    pub async fn queue(&self) -> Result<Value> {
        let url = format!("{}/queue", self.base_url);
        let response = self.client.get(&url).send().await?;
        Self::json_or_error(response).await
    }

    /// Download an output image
    pub async fn view(&self, artifact: &Artifact) -> Result<Vec<u8>> {
        let url = format!("{}/view", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&view_query(artifact)?)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::api(status, "failed to fetch image"));
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Drop a prompt from the pending queue and stop the running one
    pub async fn cancel(&self, prompt_id: &str) -> Result<()> {
        let url = format!("{}/queue", self.base_url);
        self.client
            .post(&url)
            .json(&json!({ "delete": [prompt_id] }))
            .send()
            .await?
            .error_for_status()?;

        let url = format!("{}/interrupt", self.base_url);
        self.client.post(&url).send().await?.error_for_status()?;
        Ok(())
    }

    /// Check if the worker answers its stats endpoint
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/system_stats", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
