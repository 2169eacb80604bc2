//! Core types shared across SpriteKiln components

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random (v4) job id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a compute instance (assigned by the spot market)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference a provider hands back for a submitted unit of work
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderHandle(pub String);

impl ProviderHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who pays for (and may see) a job. Exactly one of user or guest session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum OwnerRef {
    User(String),
    Guest(String),
}

impl OwnerRef {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    pub fn guest(session: impl Into<String>) -> Self {
        Self::Guest(session.into())
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Self::Guest(_))
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::User(id) => Some(id),
            Self::Guest(_) => None,
        }
    }

    pub fn guest_session(&self) -> Option<&str> {
        match self {
            Self::Guest(id) => Some(id),
            Self::User(_) => None,
        }
    }
}

impl std::fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{}", id),
            Self::Guest(id) => write!(f, "guest:{}", id),
        }
    }
}

/// Kind of asset a job produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sprite,
    Texture,
    #[serde(rename = "rotation_8")]
    Rotation8,
    #[serde(rename = "rotation_4")]
    Rotation4,
    RotationSingle,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Sprite,
        JobKind::Texture,
        JobKind::Rotation8,
        JobKind::Rotation4,
        JobKind::RotationSingle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sprite => "sprite",
            JobKind::Texture => "texture",
            JobKind::Rotation8 => "rotation_8",
            JobKind::Rotation4 => "rotation_4",
            JobKind::RotationSingle => "rotation_single",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Rotation kinds take an input image instead of a prompt
    pub fn is_rotation(&self) -> bool {
        matches!(
            self,
            JobKind::Rotation8 | JobKind::Rotation4 | JobKind::RotationSingle
        )
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle status
///
/// ```text
/// pending ──► queued ──► processing ──► post_processing ──► completed
///    │          ▲  │          │                 │
///    │          └──┴──retry───┘                 │
///    └──────────────► failed ◄──────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    PostProcessing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::PostProcessing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::PostProcessing => "post_processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "post_processing" => Some(JobStatus::PostProcessing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which compute provider variant a job is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Hosted node-graph service with a managed queue
    Marketplace,
    /// Serverless GPU endpoint (run/status/cancel)
    Serverless,
    /// Node-graph workers on rented spot instances
    SelfHosted,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Marketplace => "marketplace",
            ProviderKind::Serverless => "serverless",
            ProviderKind::SelfHosted => "self-hosted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "marketplace" => Some(ProviderKind::Marketplace),
            "serverless" => Some(ProviderKind::Serverless),
            "self-hosted" | "selfhosted" | "self_hosted" => Some(ProviderKind::SelfHosted),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a debit was split between the two sub-balances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSplit {
    pub regular: i64,
    pub bonus: i64,
}

impl TokenSplit {
    pub fn new(regular: i64, bonus: i64) -> Self {
        Self { regular, bonus }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn total(&self) -> i64 {
        self.regular + self.bonus
    }

    pub fn is_zero(&self) -> bool {
        self.regular == 0 && self.bonus == 0
    }

    /// Bonus tokens are spent first, the remainder comes out of the regular balance.
    /// Returns `None` when the two balances together cannot cover `amount`.
    pub fn bonus_first(amount: i64, regular: i64, bonus: i64) -> Option<Self> {
        if amount < 0 || regular + bonus < amount {
            return None;
        }
        let from_bonus = bonus.min(amount).max(0);
        Some(Self {
            regular: amount - from_bonus,
            bonus: from_bonus,
        })
    }
}

/// Current balances of a user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub tokens: i64,
    pub bonus_tokens: i64,
}

impl Balance {
    pub fn total(&self) -> i64 {
        self.tokens + self.bonus_tokens
    }
}

/// Camera direction used by single-view rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Front,
    Right,
    Back,
    Left,
}

impl Direction {
    pub fn degrees(&self) -> u16 {
        match self {
            Direction::Front => 0,
            Direction::Right => 90,
            Direction::Back => 180,
            Direction::Left => 270,
        }
    }

    /// Horizontal orbit angle needed to go from `self` to `target`, in `0..360`
    pub fn angle_to(&self, target: Direction) -> u16 {
        (target.degrees() + 360 - self.degrees()) % 360
    }
}

/// Kind-specific job input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobParams {
    /// Text-to-image generation (sprites, textures)
    Prompt {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        negative_prompt: Option<String>,
        width: u32,
        height: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seed: Option<u64>,
    },
    /// Multi-view orbit around an input image
    Rotation { image_url: String, elevation: i32 },
    /// One novel view of an input image
    SingleView {
        image_url: String,
        source: Direction,
        target: Direction,
        elevation: i32,
    },
}

impl JobParams {
    pub fn prompt(&self) -> Option<&str> {
        match self {
            JobParams::Prompt { prompt, .. } => Some(prompt),
            _ => None,
        }
    }

    pub fn image_url(&self) -> Option<&str> {
        match self {
            JobParams::Rotation { image_url, .. } | JobParams::SingleView { image_url, .. } => {
                Some(image_url)
            }
            JobParams::Prompt { .. } => None,
        }
    }
}

/// A durable job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Short URL-safe id shown to clients
    pub public_id: String,
    pub owner: OwnerRef,
    pub kind: JobKind,
    pub params: JobParams,
    pub provider: ProviderKind,
    pub status: JobStatus,
    pub handle: Option<ProviderHandle>,
    pub instance_id: Option<InstanceId>,
    pub retry_count: u32,
    /// Split recorded at reservation; refunds give back exactly this
    pub cost: TokenSplit,
    /// Output name to hosted URL
    pub result: BTreeMap<String, String>,
    pub error: Option<String>,
    pub progress: u8,
    pub stage: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Start of the current attempt's wall-clock budget
    pub submitted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// New `pending` job
    pub fn new(
        public_id: impl Into<String>,
        owner: OwnerRef,
        kind: JobKind,
        params: JobParams,
        provider: ProviderKind,
        cost: TokenSplit,
    ) -> Self {
        let now = Utc::now().trunc_subsecs(6);
        Self {
            id: JobId::generate(),
            public_id: public_id.into(),
            owner,
            kind,
            params,
            provider,
            status: JobStatus::Pending,
            handle: None,
            instance_id: None,
            retry_count: 0,
            cost,
            result: BTreeMap::new(),
            error: None,
            progress: 0,
            stage: Some("Queued for processing...".to_string()),
            created_at: now,
            submitted_at: None,
            updated_at: now,
            completed_at: None,
        }
    }

    /// True once the provider has accepted the current attempt
    pub fn is_submitted(&self) -> bool {
        self.handle.is_some()
    }
}

/// Preconditions for a compare-and-set job update
#[derive(Debug, Clone, Default)]
pub struct JobGuard {
    pub statuses: Vec<JobStatus>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Provider attempt the row must still be on
    pub handle: Option<Option<ProviderHandle>>,
}

impl JobGuard {
    pub fn status(status: JobStatus) -> Self {
        Self::any_of(&[status])
    }

    pub fn any_of(statuses: &[JobStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            updated_at: None,
            handle: None,
        }
    }

    /// Every non-terminal status
    pub fn active() -> Self {
        Self::any_of(&JobStatus::ACTIVE)
    }

    /// Additionally require the row not to have moved since `at`
    pub fn unchanged_since(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    /// Additionally require the row to still be on the attempt `handle`
    pub fn on_attempt(mut self, handle: Option<ProviderHandle>) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.statuses.contains(&job.status)
            && self.updated_at.is_none_or(|at| job.updated_at == at)
            && self.handle.as_ref().is_none_or(|h| job.handle == *h)
    }
}

/// Partial update applied by a compare-and-set. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub handle: Option<Option<ProviderHandle>>,
    pub instance_id: Option<Option<InstanceId>>,
    pub retry_count: Option<u32>,
    pub result: Option<BTreeMap<String, String>>,
    pub error: Option<Option<String>>,
    pub progress: Option<u8>,
    pub stage: Option<String>,
    pub submitted_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn to(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_handle(mut self, handle: Option<ProviderHandle>) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_instance(mut self, instance_id: Option<InstanceId>) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn with_result(mut self, result: BTreeMap<String, String>) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn with_progress(mut self, progress: u8, stage: impl Into<String>) -> Self {
        self.progress = Some(progress.min(100));
        self.stage = Some(stage.into());
        self
    }

    pub fn with_submitted_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.submitted_at = Some(at);
        self
    }

    pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    /// Write the set fields into `job` and stamp `updated_at`
    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(handle) = &self.handle {
            job.handle = handle.clone();
        }
        if let Some(instance_id) = &self.instance_id {
            job.instance_id = instance_id.clone();
        }
        if let Some(retry_count) = self.retry_count {
            job.retry_count = retry_count;
        }
        if let Some(result) = &self.result {
            job.result = result.clone();
        }
        if let Some(error) = &self.error {
            job.error = error.clone();
        }
        if let Some(progress) = self.progress {
            job.progress = progress;
        }
        if let Some(stage) = &self.stage {
            job.stage = Some(stage.clone());
        }
        if let Some(submitted_at) = self.submitted_at {
            job.submitted_at = submitted_at;
        }
        if let Some(completed_at) = self.completed_at {
            job.completed_at = Some(completed_at);
        }
        // Strictly increasing at storage precision so `unchanged_since` guards hold
        let now = now.trunc_subsecs(6);
        job.updated_at = if now > job.updated_at {
            now
        } else {
            job.updated_at + chrono::Duration::microseconds(1)
        };
    }
}

/// Compute instance lifecycle state
///
/// ```text
/// creating ──► starting ──► ready ⇄ busy
///                             │
///                             └──► stopping ──► stopped
/// any non-terminal ──► failed ──► stopped (cleanup)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Creating,
    Starting,
    Ready,
    Busy,
    Stopping,
    Stopped,
    Failed,
}

impl InstanceState {
    /// States that still hold (or are about to hold) a rented machine
    pub const LIVE: [InstanceState; 5] = [
        InstanceState::Creating,
        InstanceState::Starting,
        InstanceState::Ready,
        InstanceState::Busy,
        InstanceState::Stopping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Creating => "creating",
            InstanceState::Starting => "starting",
            InstanceState::Ready => "ready",
            InstanceState::Busy => "busy",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(InstanceState::Creating),
            "starting" => Some(InstanceState::Starting),
            "ready" => Some(InstanceState::Ready),
            "busy" => Some(InstanceState::Busy),
            "stopping" => Some(InstanceState::Stopping),
            "stopped" => Some(InstanceState::Stopped),
            "failed" => Some(InstanceState::Failed),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }

    /// Still coming up; a job may wait on it
    pub fn is_warming(&self) -> bool {
        matches!(self, InstanceState::Creating | InstanceState::Starting)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rented GPU machine as tracked locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeInstance {
    pub id: InstanceId,
    pub state: InstanceState,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub current_job_id: Option<JobId>,
    pub gpu_name: Option<String>,
    pub cost_per_hour: Option<f64>,
    pub error: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ComputeInstance {
    /// Freshly rented instance in `creating`
    pub fn creating(id: InstanceId, gpu_name: Option<String>, cost_per_hour: Option<f64>) -> Self {
        let now = Utc::now().trunc_subsecs(6);
        Self {
            id,
            state: InstanceState::Creating,
            host: None,
            port: None,
            current_job_id: None,
            gpu_name,
            cost_per_hour,
            error: None,
            last_activity_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `http://host:port` once the worker endpoint is known
    pub fn base_url(&self) -> Option<String> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some(format!("http://{}:{}", host, port)),
            _ => None,
        }
    }
}

/// Partial instance update used by state transitions
#[derive(Debug, Clone, Default)]
pub struct InstanceUpdate {
    pub state: Option<InstanceState>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub current_job_id: Option<Option<JobId>>,
    pub error: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl InstanceUpdate {
    pub fn to(state: InstanceState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }

    pub fn with_job(mut self, job_id: Option<JobId>) -> Self {
        self.current_job_id = Some(job_id);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn touched(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity_at = Some(at);
        self
    }

    pub fn apply(&self, instance: &mut ComputeInstance, now: DateTime<Utc>) {
        if let Some(state) = self.state {
            instance.state = state;
        }
        if let Some(host) = &self.host {
            instance.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            instance.port = Some(port);
        }
        if let Some(job) = &self.current_job_id {
            instance.current_job_id = job.clone();
        }
        if let Some(error) = &self.error {
            instance.error = Some(error.clone());
        }
        if let Some(at) = self.last_activity_at {
            instance.last_activity_at = Some(at);
        }
        instance.updated_at = now;
    }
}

/// Where a finished output lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactLocation {
    /// Already at a public URL (e.g. uploaded by the worker)
    Hosted(String),
    /// Held by the provider; must be fetched and re-hosted
    Remote {
        filename: String,
        subfolder: String,
        folder_type: String,
    },
}

/// One named output of a finished job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub location: ArtifactLocation,
}

impl Artifact {
    pub fn hosted(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: ArtifactLocation::Hosted(url.into()),
        }
    }
}

/// Provider-agnostic view of a submitted unit of work
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderStatus {
    /// Accepted but waiting in the provider's queue
    Queued,
    /// Executing; progress is provider-reported when available
    Running {
        progress: Option<u8>,
        stage: Option<String>,
    },
    Completed(Vec<Artifact>),
    /// The provider says the work cannot succeed
    Failed { reason: String },
    /// Cancelled on the provider side
    Cancelled,
    /// The compute target that held the work is gone
    TargetLost { reason: String },
    /// Provider hiccup worth retrying
    Transient { reason: String },
}

/// Outcome of a submission attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Accepted {
        handle: ProviderHandle,
        instance_id: Option<InstanceId>,
    },
    /// Nothing to run on yet; try again on a later poll
    TargetNotReady { instance_id: Option<InstanceId> },
    /// The target the job was waiting on is gone
    TargetLost { reason: String },
}

/// Search constraints for renting a GPU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferQuery {
    pub min_gpu_ram_gb: u32,
    pub max_dph: f64,
    pub min_reliability: f64,
    pub min_disk_gb: u32,
    pub limit: u32,
}

impl Default for OfferQuery {
    fn default() -> Self {
        Self {
            min_gpu_ram_gb: 24,
            max_dph: 1.0,
            min_reliability: 0.95,
            min_disk_gb: 100,
            limit: 20,
        }
    }
}

/// A rentable machine on the spot market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: u64,
    pub gpu_name: String,
    pub gpu_ram_mb: u64,
    pub dph_total: f64,
    pub reliability: f64,
}

/// What to run on a freshly rented machine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub image: String,
    pub disk_gb: u32,
    pub env: BTreeMap<String, String>,
}

/// Spot market view of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Created,
    Loading,
    Running,
    Exited,
    Offline,
    Unknown,
}

impl RemoteStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "created" => RemoteStatus::Created,
            "loading" => RemoteStatus::Loading,
            "running" => RemoteStatus::Running,
            "exited" => RemoteStatus::Exited,
            "offline" => RemoteStatus::Offline,
            _ => RemoteStatus::Unknown,
        }
    }

    /// The machine is gone for good
    pub fn is_dead(&self) -> bool {
        matches!(self, RemoteStatus::Exited | RemoteStatus::Offline)
    }
}

/// A machine as reported by the spot market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInstance {
    pub id: InstanceId,
    pub status: RemoteStatus,
    pub public_ip: Option<String>,
    /// Container port (e.g. `8188/tcp`) to host port
    pub ports: BTreeMap<String, u16>,
}

impl RemoteInstance {
    /// Public `(host, port)` for a container port, once mapped
    pub fn endpoint(&self, container_port: u16) -> Option<(String, u16)> {
        let host = self.public_ip.clone()?;
        let port = *self.ports.get(&format!("{}/tcp", container_port))?;
        Some((host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bonus_first_split() {
        assert_eq!(TokenSplit::bonus_first(8, 10, 3), Some(TokenSplit::new(5, 3)));
        assert_eq!(TokenSplit::bonus_first(2, 10, 3), Some(TokenSplit::new(0, 2)));
        assert_eq!(TokenSplit::bonus_first(13, 10, 3), Some(TokenSplit::new(10, 3)));
        assert_eq!(TokenSplit::bonus_first(14, 10, 3), None);
        assert_eq!(TokenSplit::bonus_first(0, 0, 0), Some(TokenSplit::zero()));
    }

    #[test]
    fn test_direction_angles() {
        assert_eq!(Direction::Front.angle_to(Direction::Right), 90);
        assert_eq!(Direction::Right.angle_to(Direction::Front), 270);
        assert_eq!(Direction::Left.angle_to(Direction::Back), 270);
        assert_eq!(Direction::Back.angle_to(Direction::Back), 0);
    }

    #[test]
    fn test_wire_names_match_store_names() {
        for kind in JobKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        for status in JobStatus::ACTIVE {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_guard_matches_status_and_timestamp() {
        let mut job = Job::new(
            "abc",
            OwnerRef::user("u1"),
            JobKind::Sprite,
            JobParams::Prompt {
                prompt: "knight".into(),
                negative_prompt: None,
                width: 512,
                height: 512,
                seed: None,
            },
            ProviderKind::Serverless,
            TokenSplit::new(2, 0),
        );
        let stamp = job.updated_at;

        assert!(JobGuard::active().matches(&job));
        assert!(!JobGuard::status(JobStatus::Processing).matches(&job));
        assert!(JobGuard::active().unchanged_since(stamp).matches(&job));

        JobUpdate::to(JobStatus::Queued).apply(&mut job, stamp);
        assert!(job.updated_at > stamp);
        assert!(!JobGuard::active().unchanged_since(stamp).matches(&job));
    }

    #[test]
    fn test_guard_pins_provider_attempt() {
        let mut job = Job::new(
            "abc",
            OwnerRef::user("u1"),
            JobKind::Sprite,
            JobParams::Prompt {
                prompt: "knight".into(),
                negative_prompt: None,
                width: 512,
                height: 512,
                seed: None,
            },
            ProviderKind::Serverless,
            TokenSplit::new(2, 0),
        );
        let first = Some(ProviderHandle::new("h1"));
        JobUpdate::to(JobStatus::Queued)
            .with_handle(first.clone())
            .apply(&mut job, Utc::now());
        assert!(JobGuard::active().on_attempt(first.clone()).matches(&job));

        JobUpdate::to(JobStatus::Queued)
            .with_handle(Some(ProviderHandle::new("h2")))
            .apply(&mut job, Utc::now());
        assert!(!JobGuard::active().on_attempt(first).matches(&job));
        assert!(JobGuard::active().matches(&job));
    }

    #[test]
    fn test_update_clears_handle() {
        let mut job = Job::new(
            "abc",
            OwnerRef::guest("g1"),
            JobKind::Sprite,
            JobParams::Prompt {
                prompt: "slime".into(),
                negative_prompt: None,
                width: 512,
                height: 512,
                seed: None,
            },
            ProviderKind::Serverless,
            TokenSplit::zero(),
        );
        job.handle = Some(ProviderHandle::new("h1"));
        job.instance_id = Some(InstanceId::new("42"));

        JobUpdate::to(JobStatus::Queued)
            .with_handle(None)
            .with_instance(None)
            .with_retry_count(1)
            .apply(&mut job, Utc::now());

        assert_eq!(job.handle, None);
        assert_eq!(job.instance_id, None);
        assert_eq!(job.retry_count, 1);
    }

    #[test]
    fn test_remote_endpoint() {
        let mut ports = BTreeMap::new();
        ports.insert("8188/tcp".to_string(), 40123);
        let remote = RemoteInstance {
            id: InstanceId::new("7"),
            status: RemoteStatus::Running,
            public_ip: Some("1.2.3.4".into()),
            ports,
        };
        assert_eq!(remote.endpoint(8188), Some(("1.2.3.4".to_string(), 40123)));
        assert_eq!(remote.endpoint(22), None);
    }
}
