//! Test doubles shared by unit tests

use async_trait::async_trait;
use axum::routing::{get, post};
use axum::{Json, Router};
use kiln_core::{
    Artifact, ComputeProvider, InstanceId, Job, JobKind, KilnError, LaunchRequest, Offer,
    OfferQuery, ProviderHandle, ProviderKind, ProviderStatus, RemoteInstance, RemoteStatus,
    Result, SpotMarket, Submission,
};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Spot market kept in memory
pub struct FakeMarket {
    offers: Vec<Offer>,
    endpoint: Option<(String, u16)>,
    instances: Mutex<BTreeMap<InstanceId, RemoteInstance>>,
    destroyed: Mutex<Vec<InstanceId>>,
    next_id: AtomicU64,
    created: AtomicU32,
    refuse_destroy: AtomicBool,
}

impl FakeMarket {
    /// Market whose machines stay loading until told otherwise
    pub fn new() -> Self {
        Self {
            offers: vec![
                Offer {
                    id: 2,
                    gpu_name: "RTX 4090".into(),
                    gpu_ram_mb: 24_576,
                    dph_total: 0.55,
                    reliability: 0.99,
                },
                Offer {
                    id: 1,
                    gpu_name: "RTX 3090".into(),
                    gpu_ram_mb: 24_576,
                    dph_total: 0.31,
                    reliability: 0.97,
                },
            ],
            endpoint: None,
            instances: Mutex::new(BTreeMap::new()),
            destroyed: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(100),
            created: AtomicU32::new(0),
            refuse_destroy: AtomicBool::new(false),
        }
    }

    /// Market with nothing to rent
    pub fn sold_out() -> Self {
        Self {
            offers: Vec::new(),
            ..Self::new()
        }
    }

    /// Make every destroy call error
    pub fn refuse_destroy(&self) {
        self.refuse_destroy.store(true, Ordering::SeqCst);
    }

    /// Market whose machines come up running at `host:port`
    pub fn with_endpoint(host: &str, port: u16) -> Self {
        Self {
            endpoint: Some((host.to_string(), port)),
            ..Self::new()
        }
    }

    pub fn set_status(&self, id: &InstanceId, status: RemoteStatus) {
        if let Some(instance) = self.instances.lock().unwrap().get_mut(id) {
            instance.status = status;
        }
    }

    pub fn insert_remote(&self, id: &str, status: RemoteStatus) {
        let id = InstanceId::new(id);
        self.instances.lock().unwrap().insert(
            id.clone(),
            RemoteInstance {
                id,
                status,
                public_ip: None,
                ports: BTreeMap::new(),
            },
        );
    }

    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> Vec<InstanceId> {
        self.destroyed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpotMarket for FakeMarket {
    async fn search_offers(&self, _query: &OfferQuery) -> Result<Vec<Offer>> {
        Ok(self.offers.clone())
    }

    async fn create_instance(&self, _offer: &Offer, _launch: &LaunchRequest) -> Result<InstanceId> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let id = InstanceId::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string());
        let (status, public_ip, ports) = match &self.endpoint {
            Some((host, port)) => (
                RemoteStatus::Running,
                Some(host.clone()),
                BTreeMap::from([("8188/tcp".to_string(), *port)]),
            ),
            None => (RemoteStatus::Loading, None, BTreeMap::new()),
        };
        self.instances.lock().unwrap().insert(
            id.clone(),
            RemoteInstance {
                id: id.clone(),
                status,
                public_ip,
                ports,
            },
        );
        Ok(id)
    }

    async fn get_instance(&self, id: &InstanceId) -> Result<Option<RemoteInstance>> {
        Ok(self.instances.lock().unwrap().get(id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<RemoteInstance>> {
        Ok(self.instances.lock().unwrap().values().cloned().collect())
    }

    async fn destroy_instance(&self, id: &InstanceId) -> Result<()> {
        if self.refuse_destroy.load(Ordering::SeqCst) {
            return Err(KilnError::provider(format!("cannot destroy {}", id)));
        }
        self.instances.lock().unwrap().remove(id);
        self.destroyed.lock().unwrap().push(id.clone());
        Ok(())
    }
}

/// Minimal worker that only answers health checks. Returns its port.
pub async fn spawn_worker_mock() -> u16 {
    let router = Router::new()
        .route("/system_stats", get(|| async { Json(json!({ "system": {} })) }))
        .route("/interrupt", post(|| async { "" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    port
}

/// Provider whose answers are queued up by the test
pub struct ScriptedProvider {
    kind: ProviderKind,
    submissions: Mutex<VecDeque<Result<Submission>>>,
    statuses: Mutex<VecDeque<Result<ProviderStatus>>>,
    fallback_status: Mutex<ProviderStatus>,
    submitted: AtomicU32,
    cancelled: AtomicU32,
    released: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            submissions: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            fallback_status: Mutex::new(ProviderStatus::Queued),
            submitted: AtomicU32::new(0),
            cancelled: AtomicU32::new(0),
            released: AtomicU32::new(0),
        }
    }

    pub fn push_submission(&self, submission: Result<Submission>) {
        self.submissions.lock().unwrap().push_back(submission);
    }

    pub fn push_status(&self, status: Result<ProviderStatus>) {
        self.statuses.lock().unwrap().push_back(status);
    }

    /// Status returned once the scripted queue runs dry
    pub fn set_status(&self, status: ProviderStatus) {
        *self.fallback_status.lock().unwrap() = status;
    }

    pub fn submitted(&self) -> u32 {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> u32 {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u32 {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn supports(&self, _kind: JobKind) -> bool {
        true
    }

    async fn submit(&self, _job: &Job) -> Result<Submission> {
        let n = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        match self.submissions.lock().unwrap().pop_front() {
            Some(scripted) => scripted,
            None => Ok(Submission::Accepted {
                handle: ProviderHandle::new(format!("handle-{}", n)),
                instance_id: None,
            }),
        }
    }

    async fn status(&self, _job: &Job) -> Result<ProviderStatus> {
        match self.statuses.lock().unwrap().pop_front() {
            Some(scripted) => scripted,
            None => Ok(self.fallback_status.lock().unwrap().clone()),
        }
    }

    async fn fetch_artifact(&self, _job: &Job, artifact: &Artifact) -> Result<Vec<u8>> {
        Ok(format!("png:{}", artifact.name).into_bytes())
    }

    async fn cancel(&self, _job: &Job) -> Result<()> {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _job: &Job) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A submission failure the way a provider reports it
pub fn provider_down() -> KilnError {
    KilnError::network("connection refused")
}
