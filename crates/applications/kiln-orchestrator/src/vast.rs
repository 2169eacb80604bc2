//! GPU spot market client
//!
//! Talks to a Vast-style REST API to search offers and rent, inspect and
//! destroy machines.
//!
//! ```text
//! POST   /bundles/          offer search (filter body)
//! PUT    /asks/{offer}/     rent        -> {new_contract}
//! GET    /instances         list        -> {instances: [..]}
//! DELETE /instances/{id}/   destroy
//! ```

use crate::comfy::{DEFAULT_CONTROL_TIMEOUT, DEFAULT_WORKER_PORT};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use kiln_core::{
    InstanceId, LaunchRequest, Offer, OfferQuery, RemoteInstance, RemoteStatus, SpotMarket,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

/// Default API base URL
pub const DEFAULT_API_BASE: &str = "https://console.vast.ai/api/v0";

/// Spot market configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VastConfig {
    /// API base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// API key
    pub api_key: String,

    /// Worker image launched on rented machines
    #[serde(default = "default_image")]
    pub image: String,

    /// Disk to request (GB)
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,

    /// Container port the worker listens on
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,

    /// Per-request timeout
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_image() -> String {
    "ghcr.io/spritekiln/comfy-worker:latest".to_string()
}

fn default_disk_gb() -> u32 {
    100
}

fn default_worker_port() -> u16 {
    DEFAULT_WORKER_PORT
}

fn default_timeout() -> Duration {
    DEFAULT_CONTROL_TIMEOUT
}

impl VastConfig {
    /// Create a new config with the given API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_base: default_api_base(),
            api_key: api_key.into(),
            image: default_image(),
            disk_gb: default_disk_gb(),
            worker_port: default_worker_port(),
            timeout: default_timeout(),
        }
    }

    /// Set API base URL
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Set worker image
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Set worker port
    pub fn with_worker_port(mut self, port: u16) -> Self {
        self.worker_port = port;
        self
    }

    /// Launch request for a new worker machine
    pub fn launch_request(&self) -> LaunchRequest {
        let mut env = BTreeMap::new();
        env.insert("COMFYUI_PORT".to_string(), self.worker_port.to_string());
        LaunchRequest {
            image: self.image.clone(),
            disk_gb: self.disk_gb,
            env,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawOffer {
    id: u64,
    #[serde(default)]
    gpu_name: String,
    /// MB
    #[serde(default)]
    gpu_ram: f64,
    #[serde(default)]
    dph_total: f64,
    #[serde(default, alias = "reliability2")]
    reliability: f64,
}

#[derive(Debug, Deserialize)]
struct OffersResponse {
    #[serde(default)]
    offers: Vec<RawOffer>,
}

#[derive(Debug, Deserialize)]
struct PortBinding {
    #[serde(rename = "HostIp", default)]
    host_ip: String,
    #[serde(rename = "HostPort")]
    host_port: String,
}

#[derive(Debug, Deserialize)]
struct RawInstance {
    id: u64,
    #[serde(default)]
    actual_status: Option<String>,
    #[serde(default)]
    public_ipaddr: Option<String>,
    #[serde(default)]
    ssh_host: Option<String>,
    #[serde(default)]
    ports: Option<HashMap<String, Vec<PortBinding>>>,
}

#[derive(Debug, Deserialize)]
struct InstancesResponse {
    #[serde(default)]
    instances: Vec<RawInstance>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    new_contract: u64,
}

impl From<RawInstance> for RemoteInstance {
    fn from(raw: RawInstance) -> Self {
        let mut ports = BTreeMap::new();
        let mut binding_host = None;
        for (container_port, bindings) in raw.ports.unwrap_or_default() {
            if let Some(binding) = bindings.first() {
                if let Ok(port) = binding.host_port.parse::<u16>() {
                    ports.insert(container_port, port);
                }
                if !binding.host_ip.is_empty() && binding.host_ip != "0.0.0.0" {
                    binding_host.get_or_insert_with(|| binding.host_ip.clone());
                }
            }
        }
        let public_ip = raw
            .public_ipaddr
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty())
            .or(binding_host)
            .or(raw.ssh_host);

        RemoteInstance {
            id: InstanceId::new(raw.id.to_string()),
            status: raw
                .actual_status
                .as_deref()
                .map(RemoteStatus::parse)
                .unwrap_or(RemoteStatus::Created),
            public_ip,
            ports,
        }
    }
}

/// Offer search filter body
fn search_body(query: &OfferQuery) -> Value {
    json!({
        "verified": { "eq": true },
        "rentable": { "eq": true },
        "rented": { "eq": false },
        "gpu_ram": { "gte": query.min_gpu_ram_gb * 1024 },
        "disk_space": { "gte": query.min_disk_gb },
        "dph_total": { "lte": query.max_dph },
        "reliability2": { "gte": query.min_reliability },
        "num_gpus": { "eq": 1 },
        "cuda_max_good": { "gte": 12 },
        "type": "on-demand",
        "limit": query.limit,
        "order": [["dph_total", "asc"]]
    })
}

/// Spot market REST client
pub struct VastClient {
    config: VastConfig,
    client: reqwest::Client,
}

impl VastClient {
    /// Create a new spot market client
    pub fn new(config: VastConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(OrchestratorError::config("spot market API key is empty"));
        }
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    /// Configuration in use
    pub fn config(&self) -> &VastConfig {
        &self.config
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.config.api_base, path);
        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(OrchestratorError::api(status, text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl SpotMarket for VastClient {
    async fn search_offers(&self, query: &OfferQuery) -> kiln_core::Result<Vec<Offer>> {
        let body = self
            .call(reqwest::Method::POST, "/bundles/", Some(search_body(query)))
            .await?;
        let parsed: OffersResponse = serde_json::from_value(body).map_err(OrchestratorError::from)?;

        let mut offers: Vec<Offer> = parsed
            .offers
            .into_iter()
            .map(|o| Offer {
                id: o.id,
                gpu_name: o.gpu_name,
                gpu_ram_mb: o.gpu_ram.max(0.0) as u64,
                dph_total: o.dph_total,
                reliability: o.reliability,
            })
            .collect();
        offers.sort_by(|a, b| a.dph_total.total_cmp(&b.dph_total));
        debug!(count = offers.len(), "Spot offers found");
        Ok(offers)
    }

    async fn create_instance(&self, offer: &Offer, launch: &LaunchRequest) -> kiln_core::Result<InstanceId> {
        let body = json!({
            "client_id": "me",
            "disk": launch.disk_gb,
            "image": launch.image,
            "runtype": "ssh_proxy",
            "env": launch.env,
        });
        let response = self
            .call(
                reqwest::Method::PUT,
                &format!("/asks/{}/", offer.id),
                Some(body),
            )
            .await?;
        let created: CreateResponse =
            serde_json::from_value(response).map_err(OrchestratorError::from)?;
        let id = InstanceId::new(created.new_contract.to_string());

        info!(
            instance_id = %id,
            offer_id = offer.id,
            gpu = %offer.gpu_name,
            dph = offer.dph_total,
            "Rented spot instance"
        );
        Ok(id)
    }

    async fn get_instance(&self, id: &InstanceId) -> kiln_core::Result<Option<RemoteInstance>> {
        Ok(self
            .list_instances()
            .await?
            .into_iter()
            .find(|i| &i.id == id))
    }

    async fn list_instances(&self) -> kiln_core::Result<Vec<RemoteInstance>> {
        let body = self.call(reqwest::Method::GET, "/instances", None).await?;
        let parsed: InstancesResponse =
            serde_json::from_value(body).map_err(OrchestratorError::from)?;
        Ok(parsed.instances.into_iter().map(RemoteInstance::from).collect())
    }

    async fn destroy_instance(&self, id: &InstanceId) -> kiln_core::Result<()> {
        self.call(
            reqwest::Method::DELETE,
            &format!("/instances/{}/", id),
            None,
        )
        .await?;
        info!(instance_id = %id, "Destroyed spot instance");
        Ok(())
    }
}
