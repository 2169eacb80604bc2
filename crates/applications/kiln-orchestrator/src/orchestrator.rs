//! Job lifecycle orchestration
//!
//! ```text
//!   create ──► pending ──submit──► queued ──running──► processing
//!                 │                  │  ▲                   │
//!                 │ submit error     │  └──── retry ◄───────┤ lost / transient / timeout
//!                 ▼                  │                      │ completed
//!              failed ◄──────────────┴── provider failed    ▼
//!                 ▲                                  post_processing ──► completed
//!                 └──────────── retries exhausted ◄─────────┘ (assembly error)
//! ```
//!
//! Poll, webhook and sweep all funnel into the same reconcile step. Every
//! transition is a compare-and-set on the job row, so when several of them
//! race only the winner refunds, uploads or releases compute.

use crate::assembly::Assembler;
use crate::error::{OrchestratorError, Result};
use crate::ledger::Ledger;
use crate::progress::{self, STAGE_COMPLETED, STAGE_FINALIZING, STAGE_QUEUED};
use crate::routing::{generate_public_id, CreateJobRequest, Pricing, RoutingTable};
use crate::webhook::{WebhookPayload, WebhookStatus, WebhookVerifier};
use chrono::{DateTime, Utc};
use kiln_core::{
    Artifact, ComputeProvider, Job, JobGuard, JobId, JobKind, JobStatus, JobStore, JobUpdate,
    OwnerRef, ProviderHandle, ProviderKind, ProviderStatus, Submission, TokenSplit,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Message stored when the immediate submission fails
pub const SUBMIT_FAILED: &str = "Failed to submit job for processing";

/// Message stored when the owner cancels
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

const STAGE_WAITING_FOR_GPU: &str = "Waiting for GPU instance...";

/// Sweeps leave fresh pending jobs to the request that created them
const SUBMIT_GRACE: Duration = Duration::from_secs(60);

/// States in which provider work may still be outstanding
const IN_FLIGHT: [JobStatus; 3] = [JobStatus::Pending, JobStatus::Queued, JobStatus::Processing];

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Retries before a job fails for good
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wall-clock budget of one attempt
    #[serde(default = "default_job_timeout")]
    pub job_timeout: Duration,

    /// A `post_processing` row untouched this long is reclaimed
    #[serde(default = "default_post_processing_lease")]
    pub post_processing_lease: Duration,

    /// Jobs reconciled per sweep
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: usize,

    #[serde(default)]
    pub routing: RoutingTable,

    #[serde(default)]
    pub pricing: Pricing,
}

fn default_max_retries() -> u32 {
    3
}

fn default_job_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_post_processing_lease() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_sweep_batch() -> usize {
    100
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            job_timeout: default_job_timeout(),
            post_processing_lease: default_post_processing_lease(),
            sweep_batch: default_sweep_batch(),
            routing: RoutingTable::default(),
            pricing: Pricing::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_post_processing_lease(mut self, lease: Duration) -> Self {
        self.post_processing_lease = lease;
        self
    }

    pub fn with_routing(mut self, routing: RoutingTable) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }
}

/// Client view of a job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    /// Public id
    pub id: String,
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub provider: ProviderKind,
    pub progress: u8,
    pub current_stage: Option<String>,
    pub result: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub regular_tokens_used: i64,
    pub bonus_tokens_used: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.public_id.clone(),
            job_id: job.id.clone(),
            kind: job.kind,
            status: job.status,
            provider: job.provider,
            progress: job.progress,
            current_stage: job.stage.clone(),
            result: job.result.clone(),
            error: job.error.clone(),
            retry_count: job.retry_count,
            regular_tokens_used: job.cost.regular,
            bonus_tokens_used: job.cost.bonus,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

/// Result of a create
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOutcome {
    pub job: JobSnapshot,
    pub regular_tokens_used: i64,
    pub bonus_tokens_used: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generations_remaining: Option<u32>,
}

/// Result of a cancel
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub job: JobSnapshot,
    pub tokens_refunded: i64,
    pub regular_tokens_refunded: i64,
    pub bonus_tokens_refunded: i64,
}

/// Result of a worker callback
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub job_id: String,
    pub status: JobStatus,
    /// False for duplicates and stale deliveries
    pub applied: bool,
}

/// Counts from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub checked: usize,
    pub advanced: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Drives jobs from creation to settlement
pub struct Orchestrator {
    jobs: Arc<dyn JobStore>,
    ledger: Ledger,
    providers: HashMap<ProviderKind, Arc<dyn ComputeProvider>>,
    assembler: Assembler,
    verifier: Option<WebhookVerifier>,
    config: OrchestratorConfig,
}

fn elapsed_since(at: DateTime<Utc>) -> Duration {
    (Utc::now() - at).to_std().unwrap_or_default()
}

/// Outcomes reported for one provider attempt only apply while the row is
/// still on that attempt
fn attempt_guard(job: &Job) -> JobGuard {
    JobGuard::any_of(&IN_FLIGHT).on_attempt(job.handle.clone())
}

impl Orchestrator {
    /// Build an orchestrator. Fails if a route points at a provider that
    /// cannot run the routed kind.
    pub fn new(
        jobs: Arc<dyn JobStore>,
        ledger: Ledger,
        assembler: Assembler,
        providers: Vec<Arc<dyn ComputeProvider>>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let providers: HashMap<ProviderKind, Arc<dyn ComputeProvider>> =
            providers.into_iter().map(|p| (p.kind(), p)).collect();

        for (kind, target) in config.routing.routes() {
            match providers.get(&target) {
                Some(provider) if !provider.supports(kind) => {
                    return Err(OrchestratorError::config(format!(
                        "{} provider cannot run {} jobs",
                        target, kind
                    )));
                }
                Some(_) => {}
                None => warn!(kind = %kind, provider = %target, "No provider registered for route"),
            }
        }

        Ok(Self {
            jobs,
            ledger,
            providers,
            assembler,
            verifier: None,
            config,
        })
    }

    /// Accept worker callbacks signed with this verifier
    pub fn with_webhook_verifier(mut self, verifier: WebhookVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Registered providers
    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn ComputeProvider>> {
        self.providers.values()
    }

    fn provider(&self, kind: ProviderKind) -> Option<&dyn ComputeProvider> {
        self.providers.get(&kind).map(|p| p.as_ref())
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Validate, charge, record and submit a new job
    pub async fn create(&self, owner: OwnerRef, request: &CreateJobRequest) -> Result<CreateOutcome> {
        let (kind, params) = request.validate()?;
        if owner.is_guest() && kind != JobKind::Sprite {
            return Err(OrchestratorError::GuestKindNotAllowed(kind.to_string()));
        }
        let (provider_kind, provider) = self
            .config
            .routing
            .provider_for(kind)
            .and_then(|p| self.provider(p).map(|provider| (p, provider)))
            .ok_or_else(|| {
                OrchestratorError::validation(format!("{} generation is not available", kind))
            })?;

        let (cost, generations_remaining) = match &owner {
            OwnerRef::Guest(session) => (
                TokenSplit::zero(),
                Some(self.ledger.consume_guest_generation(session).await?),
            ),
            OwnerRef::User(_) => (
                self.ledger
                    .reserve(&owner, self.config.pricing.cost(kind))
                    .await?,
                None,
            ),
        };

        let job = Job::new(generate_public_id(), owner, kind, params, provider_kind, cost);
        if let Err(e) = self.jobs.insert_job(&job).await {
            self.give_back(&job).await;
            return Err(e.into());
        }
        info!(
            job_id = %job.id,
            public_id = %job.public_id,
            kind = %kind,
            provider = %provider_kind,
            regular = cost.regular,
            bonus = cost.bonus,
            "Job created"
        );

        let job = match provider.submit(&job).await {
            Ok(submission) => self.record_submission(job, provider, submission).await?,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Immediate submission failed");
                let update = JobUpdate::to(JobStatus::Failed)
                    .with_error(SUBMIT_FAILED)
                    .with_progress(0, "Failed");
                let failed = self
                    .jobs
                    .compare_and_update(&job.id, &JobGuard::status(JobStatus::Pending), &update)
                    .await?;
                let refunded = failed.is_some() && self.give_back(&job).await;
                return Err(OrchestratorError::SubmissionFailed {
                    job_id: job.id,
                    refunded,
                });
            }
        };

        Ok(CreateOutcome {
            job: JobSnapshot::from(&job),
            regular_tokens_used: cost.regular,
            bonus_tokens_used: cost.bonus,
            generations_remaining,
        })
    }

    /// Advance a job as far as provider state allows and return it.
    /// `id` may be the internal or the public id.
    pub async fn poll(&self, id: &str, owner: &OwnerRef) -> Result<JobSnapshot> {
        let job = self.load_owned(id, owner).await?;
        let job = self.reconcile(job).await?;
        Ok(JobSnapshot::from(&job))
    }

    /// Cancel a job. Completed jobs with a result need `force` and are never refunded.
    pub async fn cancel(&self, id: &str, owner: &OwnerRef, force: bool) -> Result<CancelOutcome> {
        let job = self.load_owned(id, owner).await?;
        let has_result = job.status == JobStatus::Completed && !job.result.is_empty();
        match job.status {
            JobStatus::Failed => {
                return Err(OrchestratorError::not_cancellable("job has already failed"));
            }
            JobStatus::Completed if has_result && !force => {
                return Err(OrchestratorError::not_cancellable(
                    "job already completed; use force to discard its result",
                ));
            }
            _ => {}
        }

        let provider = self.provider(job.provider);
        let outstanding = !job.status.is_terminal() && job.is_submitted();
        if let Some(provider) = provider.filter(|_| outstanding) {
            if let Err(e) = provider.cancel(&job).await {
                warn!(job_id = %job.id, error = %e, "Provider cancel failed");
            }
        }

        let guard = JobGuard::status(job.status).unchanged_since(job.updated_at);
        let update = JobUpdate::to(JobStatus::Failed)
            .with_error(CANCELLED_BY_USER)
            .with_progress(job.progress, "Cancelled");
        let Some(cancelled) = self.jobs.compare_and_update(&job.id, &guard, &update).await? else {
            return Err(OrchestratorError::not_cancellable(
                "job changed state while cancelling; try again",
            ));
        };
        if let Some(provider) = provider {
            self.release(provider, &job).await;
        }

        let refunded = if force || has_result {
            TokenSplit::zero()
        } else if self.give_back(&cancelled).await {
            cancelled.cost
        } else {
            TokenSplit::zero()
        };
        info!(
            job_id = %cancelled.id,
            force,
            refunded = refunded.total(),
            "Job cancelled"
        );

        Ok(CancelOutcome {
            job: JobSnapshot::from(&cancelled),
            tokens_refunded: refunded.total(),
            regular_tokens_refunded: refunded.regular,
            bonus_tokens_refunded: refunded.bonus,
        })
    }

    /// Apply a signed worker callback
    pub async fn webhook_update(&self, body: &[u8], signature: Option<&str>) -> Result<WebhookAck> {
        let verifier = self
            .verifier
            .as_ref()
            .ok_or(OrchestratorError::InvalidSignature)?;
        verifier.verify(body, signature.ok_or(OrchestratorError::InvalidSignature)?)?;
        let payload = WebhookPayload::parse(body)?;

        let job = self.find_for_webhook(&payload.job_id).await?;
        let seen_at = job.updated_at;
        let provider = self.provider(job.provider).ok_or_else(|| {
            OrchestratorError::config(format!("no {} provider registered", job.provider))
        })?;

        let job = if !IN_FLIGHT.contains(&job.status) {
            debug!(job_id = %job.id, status = %job.status, "Webhook for settled job ignored");
            job
        } else {
            match payload.status {
                WebhookStatus::Processing if job.is_submitted() => {
                    self.record_progress(
                        job,
                        payload.progress_percent(),
                        payload.current_stage.as_deref(),
                    )
                    .await?
                }
                WebhookStatus::Processing => job,
                WebhookStatus::Completed => {
                    self.finalize(job, provider, payload.artifacts()).await?
                }
                WebhookStatus::Failed => {
                    let reason = payload
                        .error
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string());
                    let guard = attempt_guard(&job);
                    self.fail_and_refund(job, guard, Some(provider), reason)
                        .await?
                }
            }
        };

        Ok(WebhookAck {
            job_id: job.public_id.clone(),
            status: job.status,
            applied: job.updated_at != seen_at,
        })
    }

    /// Reconcile every unsettled job, logging and skipping failures
    pub async fn sweep(&self) -> Result<SweepReport> {
        let jobs = self.jobs.list_active(self.config.sweep_batch).await?;
        let mut report = SweepReport {
            checked: jobs.len(),
            ..Default::default()
        };

        for job in jobs {
            if job.status == JobStatus::Pending && elapsed_since(job.created_at) < SUBMIT_GRACE {
                report.skipped += 1;
                continue;
            }
            let (id, before) = (job.id.clone(), job.status);
            match self.reconcile(job).await {
                Ok(after) => {
                    if after.status != before {
                        report.advanced += 1;
                    }
                    match after.status {
                        JobStatus::Completed => report.completed += 1,
                        JobStatus::Failed => report.failed += 1,
                        _ => {}
                    }
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(job_id = %id, error = %e, "Sweep could not reconcile job");
                }
            }
        }

        if report.checked > 0 {
            info!(
                checked = report.checked,
                advanced = report.advanced,
                completed = report.completed,
                failed = report.failed,
                errors = report.errors,
                "Job sweep finished"
            );
        }
        Ok(report)
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// One reconcile step for any job; settled jobs come back unchanged
    pub async fn reconcile(&self, job: Job) -> Result<Job> {
        match job.status {
            JobStatus::Completed | JobStatus::Failed => return Ok(job),
            JobStatus::PostProcessing => return self.reclaim_stale(job).await,
            _ => {}
        }

        let Some(provider) = self.provider(job.provider) else {
            let reason = format!("{} provider is not available", job.provider);
            return self
                .fail_and_refund(job, JobGuard::any_of(&IN_FLIGHT), None, reason)
                .await;
        };

        if self.budget_exceeded(&job) {
            let reason = format!(
                "Job timed out after {} minutes",
                self.config.job_timeout.as_secs() / 60
            );
            return self.retry_or_fail(job, provider, reason).await;
        }

        if job.is_submitted() {
            self.check_provider(job, provider).await
        } else {
            self.submit_pending(job, provider).await
        }
    }

    fn budget_exceeded(&self, job: &Job) -> bool {
        let anchor = job.submitted_at.unwrap_or(job.created_at);
        elapsed_since(anchor) >= self.config.job_timeout
    }

    async fn submit_pending(&self, job: Job, provider: &dyn ComputeProvider) -> Result<Job> {
        match provider.submit(&job).await {
            Ok(submission) => self.record_submission(job, provider, submission).await,
            Err(e) => {
                let reason = format!("Submission failed: {}", e);
                self.retry_or_fail(job, provider, reason).await
            }
        }
    }

    async fn record_submission(
        &self,
        job: Job,
        provider: &dyn ComputeProvider,
        submission: Submission,
    ) -> Result<Job> {
        let guard = JobGuard::status(job.status).unchanged_since(job.updated_at);
        let now = Utc::now();

        let (update, orphan) = match submission {
            Submission::Accepted {
                handle,
                instance_id,
            } => {
                let mut orphan = job.clone();
                orphan.handle = Some(handle.clone());
                orphan.instance_id = instance_id.clone();
                let update = JobUpdate::to(JobStatus::Queued)
                    .with_handle(Some(handle))
                    .with_instance(instance_id)
                    .with_submitted_at(Some(now))
                    .with_progress(0, STAGE_QUEUED);
                (update, Some(orphan))
            }
            Submission::TargetLost { reason } => {
                return self.retry_or_fail(job, provider, reason).await;
            }
            Submission::TargetNotReady { instance_id } => {
                if job.status == JobStatus::Queued && job.instance_id == instance_id {
                    return Ok(job);
                }
                let mut update = JobUpdate::to(JobStatus::Queued)
                    .with_instance(instance_id)
                    .with_progress(0, STAGE_WAITING_FOR_GPU);
                if job.submitted_at.is_none() {
                    update = update.with_submitted_at(Some(now));
                }
                (update, None)
            }
        };

        let recorded = match self.jobs.compare_and_update(&job.id, &guard, &update).await {
            Ok(recorded) => recorded,
            Err(e) => {
                if let Some(orphan) = &orphan {
                    error!(job_id = %job.id, error = %e, "Could not record submission, withdrawing it");
                    self.abandon(provider, orphan).await;
                }
                return Err(e.into());
            }
        };
        match recorded {
            Some(updated) => {
                match &updated.handle {
                    Some(handle) => info!(job_id = %updated.id, handle = %handle, "Job submitted"),
                    None => debug!(job_id = %updated.id, instance_id = ?updated.instance_id, "Job waiting for compute"),
                }
                Ok(updated)
            }
            None => {
                let current = self.reload(&job.id).await?;
                if let Some(orphan) = orphan {
                    if current.handle != orphan.handle {
                        warn!(job_id = %job.id, "Concurrent submission lost the race, withdrawing it");
                        self.abandon(provider, &orphan).await;
                    }
                }
                Ok(current)
            }
        }
    }

    async fn check_provider(&self, job: Job, provider: &dyn ComputeProvider) -> Result<Job> {
        let status = match provider.status(&job).await {
            Ok(status) => status,
            Err(e) => ProviderStatus::Transient {
                reason: format!("Status check failed: {}", e),
            },
        };

        match status {
            ProviderStatus::Queued => Ok(job),
            ProviderStatus::Running { progress, stage } => {
                self.record_progress(job, progress, stage.as_deref()).await
            }
            ProviderStatus::Completed(artifacts) => self.finalize(job, provider, artifacts).await,
            ProviderStatus::Failed { reason } => {
                let guard = attempt_guard(&job);
                self.fail_and_refund(job, guard, Some(provider), reason).await
            }
            ProviderStatus::Cancelled => {
                let guard = attempt_guard(&job);
                self.fail_and_refund(
                    job,
                    guard,
                    Some(provider),
                    "Cancelled by provider".to_string(),
                )
                .await
            }
            ProviderStatus::TargetLost { reason } | ProviderStatus::Transient { reason } => {
                self.retry_or_fail(job, provider, reason).await
            }
        }
    }

    async fn record_progress(
        &self,
        job: Job,
        reported: Option<u8>,
        reported_stage: Option<&str>,
    ) -> Result<Job> {
        let anchor = job.submitted_at.unwrap_or(job.created_at);
        let (progress, stage) = progress::merge(
            job.kind,
            elapsed_since(anchor),
            job.progress,
            reported,
            reported_stage,
        );
        if job.status == JobStatus::Processing
            && job.progress == progress
            && job.stage.as_deref() == Some(stage.as_str())
        {
            return Ok(job);
        }

        let guard = JobGuard::any_of(&[JobStatus::Queued, JobStatus::Processing])
            .on_attempt(job.handle.clone());
        let update = JobUpdate::to(JobStatus::Processing).with_progress(progress, stage);
        match self.jobs.compare_and_update(&job.id, &guard, &update).await? {
            Some(updated) => Ok(updated),
            None => self.reload(&job.id).await,
        }
    }

    /// Claim the job for post-processing, host the outputs, complete it
    async fn finalize(
        &self,
        job: Job,
        provider: &dyn ComputeProvider,
        artifacts: Vec<Artifact>,
    ) -> Result<Job> {
        let claim = JobUpdate::to(JobStatus::PostProcessing)
            .with_progress(job.progress.max(95), STAGE_FINALIZING);
        let Some(claimed) = self
            .jobs
            .compare_and_update(&job.id, &attempt_guard(&job), &claim)
            .await?
        else {
            debug!(job_id = %job.id, "Another caller is finalizing the job");
            return self.reload(&job.id).await;
        };
        info!(job_id = %claimed.id, outputs = artifacts.len(), "Finalizing job");

        let result = match self.assembler.assemble(provider, &claimed, &artifacts).await {
            Ok(result) => result,
            Err(e) => {
                let reason = format!("Failed to assemble outputs: {}", e);
                return self.retry_or_fail(claimed, provider, reason).await;
            }
        };

        let guard = JobGuard::status(JobStatus::PostProcessing).unchanged_since(claimed.updated_at);
        let done = JobUpdate::to(JobStatus::Completed)
            .with_result(result)
            .with_progress(100, STAGE_COMPLETED)
            .with_completed_at(Utc::now());
        match self.jobs.compare_and_update(&claimed.id, &guard, &done).await? {
            Some(completed) => {
                self.release(provider, &completed).await;
                info!(
                    job_id = %completed.id,
                    outputs = completed.result.len(),
                    retries = completed.retry_count,
                    "Job completed"
                );
                Ok(completed)
            }
            None => {
                warn!(job_id = %claimed.id, "Post-processing lease lost before completion");
                self.reload(&claimed.id).await
            }
        }
    }

    /// Take back a `post_processing` job whose finalizer went quiet
    async fn reclaim_stale(&self, job: Job) -> Result<Job> {
        if elapsed_since(job.updated_at) < self.config.post_processing_lease {
            return Ok(job);
        }
        let guard = JobGuard::status(JobStatus::PostProcessing).unchanged_since(job.updated_at);
        let update =
            JobUpdate::to(JobStatus::Processing).with_progress(job.progress, "Resuming finalization...");
        let Some(reclaimed) = self.jobs.compare_and_update(&job.id, &guard, &update).await? else {
            return self.reload(&job.id).await;
        };
        warn!(job_id = %reclaimed.id, "Reclaimed stale post-processing job");

        match self.provider(reclaimed.provider) {
            Some(provider) if reclaimed.is_submitted() => self.check_provider(reclaimed, provider).await,
            _ => Ok(reclaimed),
        }
    }

    /// Requeue for another attempt, or fail and refund once retries run out
    async fn retry_or_fail(
        &self,
        job: Job,
        provider: &dyn ComputeProvider,
        reason: String,
    ) -> Result<Job> {
        let guard = JobGuard::status(job.status).unchanged_since(job.updated_at);
        if job.retry_count >= self.config.max_retries {
            return self.fail_and_refund(job, guard, Some(provider), reason).await;
        }

        let attempt = job.retry_count + 1;
        let update = JobUpdate::to(JobStatus::Queued)
            .with_handle(None)
            .with_instance(None)
            .with_retry_count(attempt)
            .with_submitted_at(Some(Utc::now()))
            .with_progress(
                0,
                format!("Retrying ({}/{})...", attempt, self.config.max_retries),
            );
        match self.jobs.compare_and_update(&job.id, &guard, &update).await? {
            Some(requeued) => {
                warn!(job_id = %job.id, attempt, reason = %reason, "Job requeued for retry");
                self.abandon(provider, &job).await;
                Ok(requeued)
            }
            None => self.reload(&job.id).await,
        }
    }

    /// Terminal failure; the CAS winner refunds and releases
    async fn fail_and_refund(
        &self,
        job: Job,
        guard: JobGuard,
        provider: Option<&dyn ComputeProvider>,
        reason: String,
    ) -> Result<Job> {
        let update = JobUpdate::to(JobStatus::Failed)
            .with_error(reason.clone())
            .with_progress(job.progress, "Failed");
        match self.jobs.compare_and_update(&job.id, &guard, &update).await? {
            Some(failed) => {
                warn!(job_id = %failed.id, reason = %reason, retries = failed.retry_count, "Job failed");
                self.give_back(&failed).await;
                if let Some(provider) = provider {
                    self.release(provider, &failed).await;
                }
                Ok(failed)
            }
            None => self.reload(&job.id).await,
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Return the reservation (or the guest generation). True on success.
    async fn give_back(&self, job: &Job) -> bool {
        match &job.owner {
            OwnerRef::User(_) => match self.ledger.refund(&job.owner, job.cost).await {
                Ok(()) => true,
                Err(e) => {
                    error!(
                        job_id = %job.id,
                        owner = %job.owner,
                        regular = job.cost.regular,
                        bonus = job.cost.bonus,
                        error = %e,
                        "Refund failed"
                    );
                    false
                }
            },
            OwnerRef::Guest(session) => {
                self.ledger.restore_guest_generation(session).await;
                true
            }
        }
    }

    /// Withdraw an attempt: cancel its handle and free its compute (best-effort)
    async fn abandon(&self, provider: &dyn ComputeProvider, job: &Job) {
        if job.is_submitted() {
            if let Err(e) = provider.cancel(job).await {
                debug!(job_id = %job.id, error = %e, "Cancel of abandoned attempt failed");
            }
        }
        self.release(provider, job).await;
    }

    async fn release(&self, provider: &dyn ComputeProvider, job: &Job) {
        if let Err(e) = provider.release(job).await {
            warn!(job_id = %job.id, error = %e, "Failed to release compute");
        }
    }

    async fn reload(&self, id: &JobId) -> Result<Job> {
        self.jobs
            .get_job(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("job {}", id)))
    }

    /// Ownership mismatches look exactly like misses
    async fn load_owned(&self, id: &str, owner: &OwnerRef) -> Result<Job> {
        let job = match self.jobs.get_job(&JobId::new(id)).await? {
            Some(job) => Some(job),
            None => self.jobs.find_by_public_id(id).await?,
        };
        job.filter(|job| &job.owner == owner)
            .ok_or_else(|| OrchestratorError::not_found(format!("job {}", id)))
    }

    /// Workers echo either the provider handle or our job id
    async fn find_for_webhook(&self, id: &str) -> Result<Job> {
        if let Some(job) = self.jobs.find_by_handle(&ProviderHandle::new(id)).await? {
            return Ok(job);
        }
        self.jobs
            .get_job(&JobId::new(id))
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("job {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::{MemoryObjectStorage, MemoryStore};
    use crate::testing::{provider_down, ScriptedProvider};
    use kiln_core::{InstanceId, KilnError, LedgerStore};

    struct Harness {
        orchestrator: Orchestrator,
        store: Arc<MemoryStore>,
        provider: Arc<ScriptedProvider>,
        verifier: WebhookVerifier,
    }

    fn harness_with(kind: ProviderKind, config: OrchestratorConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.put_user("alice", 10, 3);
        let provider = Arc::new(ScriptedProvider::new(kind));
        let routing = JobKind::ALL
            .iter()
            .fold(RoutingTable::default(), |table, k| table.with_route(*k, kind));
        let verifier = WebhookVerifier::new("hook-secret");
        let orchestrator = Orchestrator::new(
            store.clone(),
            Ledger::new(store.clone()),
            Assembler::new(Arc::new(MemoryObjectStorage::new())),
            vec![provider.clone() as Arc<dyn ComputeProvider>],
            config.with_routing(routing),
        )
        .unwrap()
        .with_webhook_verifier(verifier.clone());
        Harness {
            orchestrator,
            store,
            provider,
            verifier,
        }
    }

    fn harness() -> Harness {
        harness_with(ProviderKind::Serverless, OrchestratorConfig::default())
    }

    fn alice() -> OwnerRef {
        OwnerRef::user("alice")
    }

    async fn balance(store: &MemoryStore) -> (i64, i64) {
        let b = store.balance("alice").await.unwrap().unwrap();
        (b.tokens, b.bonus_tokens)
    }

    fn hosted_done() -> ProviderStatus {
        ProviderStatus::Completed(vec![
            Artifact::hosted("raw", "https://cdn.example/raw.png"),
            Artifact::hosted("processed", "https://cdn.example/processed.png"),
        ])
    }

    #[tokio::test]
    async fn test_create_reserves_bonus_first_and_queues() {
        let h = harness();
        let outcome = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Sprite, "knight"))
            .await
            .unwrap();

        assert_eq!(outcome.bonus_tokens_used, 2);
        assert_eq!(outcome.regular_tokens_used, 0);
        assert_eq!(outcome.job.status, JobStatus::Queued);
        assert_eq!(balance(&h.store).await, (10, 1));

        let job = h.store.get_job(&outcome.job.job_id).await.unwrap().unwrap();
        assert_eq!(job.handle, Some(ProviderHandle::new("handle-1")));
        assert!(job.submitted_at.is_some());
    }

    #[tokio::test]
    async fn test_insufficient_balance_changes_nothing() {
        let h = harness();
        h.store.put_user("alice", 1, 0);
        let err = h
            .orchestrator
            .create(alice(), &CreateJobRequest::image(JobKind::Rotation8, "https://x/a.png"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InsufficientBalance {
                required: 8,
                available: 1
            }
        ));
        assert_eq!(h.provider.submitted(), 0);
    }

    #[tokio::test]
    async fn test_sync_submission_failure_refunds() {
        let h = harness();
        h.provider.push_submission(Err(provider_down()));

        let err = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Texture, "moss"))
            .await
            .unwrap_err();
        let OrchestratorError::SubmissionFailed { job_id, refunded } = err else {
            panic!("expected submission failure, got {err:?}");
        };
        assert!(refunded);
        assert_eq!(balance(&h.store).await, (10, 3));

        let job = h.store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(SUBMIT_FAILED));
    }

    #[tokio::test]
    async fn test_provider_failure_refunds_exact_split() {
        let h = harness();
        h.store.put_user("alice", 5, 3);
        let outcome = h
            .orchestrator
            .create(alice(), &CreateJobRequest::image(JobKind::Rotation8, "https://x/a.png"))
            .await
            .unwrap();
        assert_eq!((outcome.regular_tokens_used, outcome.bonus_tokens_used), (5, 3));
        assert_eq!(balance(&h.store).await, (0, 0));

        h.provider.set_status(ProviderStatus::Failed {
            reason: "CUDA out of memory".into(),
        });
        let snapshot = h.orchestrator.poll(&outcome.job.id, &alice()).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("CUDA out of memory"));
        assert_eq!(balance(&h.store).await, (5, 3));

        // Terminal polls are idempotent
        let again = h.orchestrator.poll(&outcome.job.id, &alice()).await.unwrap();
        assert_eq!(again, snapshot);
        assert_eq!(balance(&h.store).await, (5, 3));
    }

    #[tokio::test]
    async fn test_running_then_completed() {
        let h = harness();
        let created = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Sprite, "archer"))
            .await
            .unwrap();

        h.provider.push_status(Ok(ProviderStatus::Running {
            progress: Some(40),
            stage: Some("Generating sprite...".into()),
        }));
        let running = h.orchestrator.poll(&created.job.id, &alice()).await.unwrap();
        assert_eq!(running.status, JobStatus::Processing);
        assert_eq!(running.progress, 40);

        h.provider.set_status(hosted_done());
        let done = h.orchestrator.poll(&created.job.id, &alice()).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result["processed"], "https://cdn.example/processed.png");
        assert_eq!(h.provider.released(), 1);
        assert_eq!(balance(&h.store).await, (10, 1));
    }

    #[tokio::test]
    async fn test_target_lost_requeues_with_retry() {
        let h = harness_with(ProviderKind::SelfHosted, OrchestratorConfig::default());
        h.provider.push_submission(Ok(Submission::Accepted {
            handle: ProviderHandle::new("prompt-1"),
            instance_id: Some(InstanceId::new("77")),
        }));
        let created = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Texture, "moss"))
            .await
            .unwrap();

        h.provider.push_status(Ok(ProviderStatus::TargetLost {
            reason: "Instance 77 is stopped".into(),
        }));
        let snapshot = h.orchestrator.poll(&created.job.id, &alice()).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert_eq!(snapshot.retry_count, 1);

        let job = h.store.get_job(&created.job.job_id).await.unwrap().unwrap();
        assert_eq!(job.handle, None);
        assert_eq!(job.instance_id, None);
        assert_eq!(h.provider.cancelled(), 1);
        // Tokens stay reserved across retries
        assert_eq!(balance(&h.store).await, (9, 0));

        // The next poll resubmits
        let resubmitted = h.orchestrator.poll(&created.job.id, &alice()).await.unwrap();
        assert_eq!(resubmitted.status, JobStatus::Queued);
        assert_eq!(h.provider.submitted(), 2);
    }

    #[tokio::test]
    async fn test_retry_bound_then_refund() {
        let h = harness();
        let created = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Sprite, "bat"))
            .await
            .unwrap();
        h.provider.set_status(ProviderStatus::Transient {
            reason: "503".into(),
        });

        // Each retry needs a resubmit poll and a status poll
        let mut last = None;
        for _ in 0..10 {
            let snapshot = h.orchestrator.poll(&created.job.id, &alice()).await.unwrap();
            let settled = snapshot.status == JobStatus::Failed;
            last = Some(snapshot);
            if settled {
                break;
            }
        }
        let last = last.unwrap();
        assert_eq!(last.status, JobStatus::Failed);
        assert_eq!(last.retry_count, 3);
        assert_eq!(last.error.as_deref(), Some("503"));
        assert_eq!(h.provider.submitted(), 4);
        assert_eq!(balance(&h.store).await, (10, 3));
    }

    #[tokio::test]
    async fn test_not_ready_target_waits_in_queue() {
        let h = harness_with(ProviderKind::SelfHosted, OrchestratorConfig::default());
        h.provider.push_submission(Ok(Submission::TargetNotReady {
            instance_id: Some(InstanceId::new("9")),
        }));
        let created = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Texture, "moss"))
            .await
            .unwrap();
        assert_eq!(created.job.status, JobStatus::Queued);
        let job = h.store.get_job(&created.job.job_id).await.unwrap().unwrap();
        assert!(!job.is_submitted());
        assert_eq!(job.instance_id, Some(InstanceId::new("9")));

        // Capacity shows up on the next poll
        let snapshot = h.orchestrator.poll(&created.job.id, &alice()).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Queued);
        let job = h.store.get_job(&created.job.job_id).await.unwrap().unwrap();
        assert!(job.is_submitted());
    }

    #[tokio::test]
    async fn test_budget_exceeded_counts_as_transient() {
        let h = harness_with(
            ProviderKind::Serverless,
            OrchestratorConfig::default().with_job_timeout(Duration::ZERO),
        );
        let created = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Sprite, "slime"))
            .await
            .unwrap();
        let snapshot = h.orchestrator.poll(&created.job.id, &alice()).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert_eq!(snapshot.retry_count, 1);
    }

    #[tokio::test]
    async fn test_ownership_mismatch_is_not_found() {
        let h = harness();
        let created = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Sprite, "knight"))
            .await
            .unwrap();
        let err = h
            .orchestrator
            .poll(&created.job.id, &OwnerRef::user("mallory"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));

        // Internal id works for the owner
        assert!(h
            .orchestrator
            .poll(created.job.job_id.as_str(), &alice())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_guest_rules() {
        let h = harness();
        let guest = OwnerRef::guest("sess-1");

        let err = h
            .orchestrator
            .create(guest.clone(), &CreateJobRequest::prompt(JobKind::Texture, "moss"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::GuestKindNotAllowed(_)));

        for remaining in [2, 1, 0] {
            let outcome = h
                .orchestrator
                .create(guest.clone(), &CreateJobRequest::prompt(JobKind::Sprite, "imp"))
                .await
                .unwrap();
            assert_eq!(outcome.generations_remaining, Some(remaining));
            assert_eq!(outcome.regular_tokens_used + outcome.bonus_tokens_used, 0);
        }
        let err = h
            .orchestrator
            .create(guest, &CreateJobRequest::prompt(JobKind::Sprite, "imp"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::GuestLimitReached { max: 3 }));
    }

    #[tokio::test]
    async fn test_guest_submission_failure_gives_generation_back() {
        let h = harness();
        let guest = OwnerRef::guest("sess-2");
        h.provider.push_submission(Err(provider_down()));
        assert!(h
            .orchestrator
            .create(guest, &CreateJobRequest::prompt(JobKind::Sprite, "imp"))
            .await
            .is_err());
        assert_eq!(
            h.orchestrator
                .ledger()
                .guest_generations_remaining("sess-2")
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let h = harness();
        let request = CreateJobRequest::prompt(JobKind::Sprite, "knight");

        // In flight: cancelled with refund
        let created = h.orchestrator.create(alice(), &request).await.unwrap();
        let outcome = h
            .orchestrator
            .cancel(&created.job.id, &alice(), false)
            .await
            .unwrap();
        assert_eq!(outcome.job.status, JobStatus::Failed);
        assert_eq!(outcome.job.error.as_deref(), Some(CANCELLED_BY_USER));
        assert_eq!(outcome.tokens_refunded, 2);
        assert_eq!(outcome.bonus_tokens_refunded, 2);
        assert_eq!(h.provider.cancelled(), 1);
        assert_eq!(balance(&h.store).await, (10, 3));

        // Failed jobs cannot be cancelled again
        assert!(matches!(
            h.orchestrator.cancel(&created.job.id, &alice(), true).await,
            Err(OrchestratorError::NotCancellable(_))
        ));

        // Completed with a result needs force, and force never refunds
        let created = h.orchestrator.create(alice(), &request).await.unwrap();
        h.provider.set_status(hosted_done());
        h.orchestrator.poll(&created.job.id, &alice()).await.unwrap();
        assert!(matches!(
            h.orchestrator.cancel(&created.job.id, &alice(), false).await,
            Err(OrchestratorError::NotCancellable(_))
        ));
        let forced = h
            .orchestrator
            .cancel(&created.job.id, &alice(), true)
            .await
            .unwrap();
        assert_eq!(forced.tokens_refunded, 0);
        assert_eq!(balance(&h.store).await, (10, 1));
    }

    #[tokio::test]
    async fn test_completed_without_result_is_refundable() {
        let h = harness();
        let created = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Sprite, "knight"))
            .await
            .unwrap();
        let job = h.store.get_job(&created.job.job_id).await.unwrap().unwrap();
        h.store
            .compare_and_update(
                &job.id,
                &JobGuard::status(JobStatus::Queued),
                &JobUpdate::to(JobStatus::Completed),
            )
            .await
            .unwrap()
            .unwrap();

        let outcome = h
            .orchestrator
            .cancel(&created.job.id, &alice(), false)
            .await
            .unwrap();
        assert_eq!(outcome.tokens_refunded, 2);
    }

    #[tokio::test]
    async fn test_webhook_completion_and_duplicate() {
        let h = harness();
        let created = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Sprite, "knight"))
            .await
            .unwrap();

        let body = format!(
            r#"{{"job_id":"{}","job_type":"sprite","status":"completed","result":{{"raw_url":"https://b/raw.png","processed_url":"https://b/p.png","seed":3}}}}"#,
            created.job.job_id
        );
        let signature = h.verifier.sign(body.as_bytes()).unwrap();

        let ack = h
            .orchestrator
            .webhook_update(body.as_bytes(), Some(&signature))
            .await
            .unwrap();
        assert!(ack.applied);
        assert_eq!(ack.status, JobStatus::Completed);

        let duplicate = h
            .orchestrator
            .webhook_update(body.as_bytes(), Some(&signature))
            .await
            .unwrap();
        assert!(!duplicate.applied);
        assert_eq!(h.provider.released(), 1);

        let job = h.store.get_job(&created.job.job_id).await.unwrap().unwrap();
        assert_eq!(job.result["raw"], "https://b/raw.png");
    }

    #[tokio::test]
    async fn test_webhook_by_handle_and_bad_signature() {
        let h = harness();
        let created = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Sprite, "knight"))
            .await
            .unwrap();

        let body = br#"{"job_id":"handle-1","status":"processing","progress":30,"current_stage":"Removing background..."}"#;
        assert!(matches!(
            h.orchestrator.webhook_update(body, Some("00ff")).await,
            Err(OrchestratorError::InvalidSignature)
        ));
        assert!(matches!(
            h.orchestrator.webhook_update(body, None).await,
            Err(OrchestratorError::InvalidSignature)
        ));
        let untouched = h.store.get_job(&created.job.job_id).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Queued);

        let signature = h.verifier.sign(body).unwrap();
        let ack = h
            .orchestrator
            .webhook_update(body, Some(&signature))
            .await
            .unwrap();
        assert_eq!(ack.status, JobStatus::Processing);
        let job = h.store.get_job(&created.job.job_id).await.unwrap().unwrap();
        assert_eq!(job.progress, 30);
        assert_eq!(job.stage.as_deref(), Some("Removing background..."));
    }

    #[tokio::test]
    async fn test_webhook_failure_refunds_once() {
        let h = harness();
        let created = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Sprite, "knight"))
            .await
            .unwrap();
        let body = format!(
            r#"{{"job_id":"{}","status":"failed","error":"Missing blob_token"}}"#,
            created.job.job_id
        );
        let signature = h.verifier.sign(body.as_bytes()).unwrap();
        for _ in 0..3 {
            h.orchestrator
                .webhook_update(body.as_bytes(), Some(&signature))
                .await
                .unwrap();
        }
        assert_eq!(balance(&h.store).await, (10, 3));
        let job = h.store.get_job(&created.job.job_id).await.unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some("Missing blob_token"));
    }

    #[tokio::test]
    async fn test_empty_completion_is_retried() {
        let h = harness();
        let created = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Sprite, "knight"))
            .await
            .unwrap();
        h.provider.push_status(Ok(ProviderStatus::Completed(Vec::new())));
        let snapshot = h.orchestrator.poll(&created.job.id, &alice()).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert_eq!(snapshot.retry_count, 1);
    }

    #[tokio::test]
    async fn test_stale_post_processing_is_reclaimed() {
        let h = harness_with(
            ProviderKind::Serverless,
            OrchestratorConfig::default().with_post_processing_lease(Duration::ZERO),
        );
        let created = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Sprite, "knight"))
            .await
            .unwrap();
        h.store
            .compare_and_update(
                &created.job.job_id,
                &JobGuard::status(JobStatus::Queued),
                &JobUpdate::to(JobStatus::PostProcessing),
            )
            .await
            .unwrap()
            .unwrap();

        h.provider.set_status(hosted_done());
        let snapshot = h.orchestrator.poll(&created.job.id, &alice()).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_sweep_reconciles_without_owner() {
        let h = harness();
        for prompt in ["a", "b"] {
            h.orchestrator
                .create(alice(), &CreateJobRequest::prompt(JobKind::Sprite, prompt))
                .await
                .unwrap();
        }
        h.provider.set_status(hosted_done());
        let report = h.orchestrator.sweep().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.completed, 2);
        assert_eq!(h.orchestrator.sweep().await.unwrap().checked, 0);
    }

    #[tokio::test]
    async fn test_outcome_of_replaced_attempt_is_ignored() {
        let h = harness();
        let created = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Sprite, "knight"))
            .await
            .unwrap();
        // A poller reads the row while it is still on handle-1
        let stale = h.store.get_job(&created.job.job_id).await.unwrap().unwrap();

        h.provider.push_status(Ok(ProviderStatus::Transient {
            reason: "503".into(),
        }));
        let requeued = h.orchestrator.poll(&created.job.id, &alice()).await.unwrap();
        assert_eq!(requeued.retry_count, 1);
        let resubmitted = h.orchestrator.poll(&created.job.id, &alice()).await.unwrap();
        assert_eq!(resubmitted.status, JobStatus::Queued);
        let released = h.provider.released();

        // The late answer for handle-1 must not touch handle-2
        h.provider.push_status(Ok(ProviderStatus::Cancelled));
        let after = h.orchestrator.reconcile(stale.clone()).await.unwrap();
        assert_eq!(after.status, JobStatus::Queued);
        assert_eq!(after.handle, Some(ProviderHandle::new("handle-2")));
        assert_eq!(h.provider.released(), released);
        assert_eq!(balance(&h.store).await, (10, 1));

        h.provider.push_status(Ok(ProviderStatus::Running {
            progress: Some(50),
            stage: None,
        }));
        let after = h.orchestrator.reconcile(stale).await.unwrap();
        assert_eq!(after.status, JobStatus::Queued);
        assert_eq!(after.progress, 0);
    }

    #[tokio::test]
    async fn test_lost_target_at_submit_is_retried() {
        let h = harness_with(ProviderKind::SelfHosted, OrchestratorConfig::default());
        h.provider.push_submission(Ok(Submission::TargetNotReady {
            instance_id: Some(InstanceId::new("9")),
        }));
        let created = h
            .orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Texture, "moss"))
            .await
            .unwrap();

        h.provider.push_submission(Ok(Submission::TargetLost {
            reason: "Instance 9 is failed".into(),
        }));
        let snapshot = h.orchestrator.poll(&created.job.id, &alice()).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert_eq!(snapshot.retry_count, 1);
        let job = h.store.get_job(&created.job.job_id).await.unwrap().unwrap();
        assert_eq!(job.instance_id, None);
        assert_eq!(balance(&h.store).await, (9, 0));
    }

    /// Job store whose updates fail while `broken` is set
    struct BrokenUpdates {
        inner: Arc<MemoryStore>,
        broken: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl JobStore for BrokenUpdates {
        async fn insert_job(&self, job: &Job) -> kiln_core::Result<()> {
            self.inner.insert_job(job).await
        }

        async fn get_job(&self, id: &JobId) -> kiln_core::Result<Option<Job>> {
            self.inner.get_job(id).await
        }

        async fn find_by_public_id(&self, public_id: &str) -> kiln_core::Result<Option<Job>> {
            self.inner.find_by_public_id(public_id).await
        }

        async fn find_by_handle(&self, handle: &ProviderHandle) -> kiln_core::Result<Option<Job>> {
            self.inner.find_by_handle(handle).await
        }

        async fn list_active(&self, limit: usize) -> kiln_core::Result<Vec<Job>> {
            self.inner.list_active(limit).await
        }

        async fn compare_and_update(
            &self,
            id: &JobId,
            guard: &JobGuard,
            update: &JobUpdate,
        ) -> kiln_core::Result<Option<Job>> {
            if self.broken.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(KilnError::database("connection reset"));
            }
            self.inner.compare_and_update(id, guard, update).await
        }
    }

    #[tokio::test]
    async fn test_unrecorded_submission_is_withdrawn() {
        let store = Arc::new(MemoryStore::new());
        store.put_user("alice", 10, 3);
        let jobs = Arc::new(BrokenUpdates {
            inner: store.clone(),
            broken: std::sync::atomic::AtomicBool::new(true),
        });
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Serverless));
        let orchestrator = Orchestrator::new(
            jobs,
            Ledger::new(store.clone()),
            Assembler::new(Arc::new(MemoryObjectStorage::new())),
            vec![provider.clone() as Arc<dyn ComputeProvider>],
            OrchestratorConfig::default().with_routing(
                RoutingTable::default().with_route(JobKind::Sprite, ProviderKind::Serverless),
            ),
        )
        .unwrap();

        let err = orchestrator
            .create(alice(), &CreateJobRequest::prompt(JobKind::Sprite, "knight"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Core(KilnError::Database(_))), "got {err:?}");
        assert_eq!(provider.submitted(), 1);
        assert_eq!(provider.cancelled(), 1);
        assert_eq!(provider.released(), 1);
    }

    #[test]
    fn test_unsupported_route_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let marketplace = crate::marketplace::MarketplaceProvider::new(
            crate::marketplace::MarketplaceConfig::new("http://127.0.0.1:9")
                .with_api_key("k")
                .with_credentials("u", "p"),
        )
        .unwrap();
        let routing = RoutingTable::default().with_route(JobKind::Rotation8, ProviderKind::Marketplace);
        let result = Orchestrator::new(
            store.clone(),
            Ledger::new(store),
            Assembler::new(Arc::new(MemoryObjectStorage::new())),
            vec![Arc::new(marketplace) as Arc<dyn ComputeProvider>],
            OrchestratorConfig::default().with_routing(routing),
        );
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }
}
