//! Self-hosted pool provider
//!
//! Jobs run on GPU machines the pool rents from the spot market. Each
//! submission claims a ready instance for the job; when none is ready the
//! submission reports `TargetNotReady` and the orchestrator parks the job in
//! `queued` until a later poll finds capacity.
//!
//! A job whose instance disappears (stopped, failed or unreachable) is
//! reported as `TargetLost`, which the orchestrator turns into a retry. That
//! holds for the warming instance a queued job waits on as well as for the
//! one it runs on.

use crate::comfy::{self, ComfyClient, QueuePosition, Workflow};
use crate::error::OrchestratorError;
use crate::pool::{Acquisition, InstancePool};
use async_trait::async_trait;
use kiln_core::{
    Artifact, ComputeInstance, ComputeProvider, InstanceId, InstanceState, InstanceStore, Job,
    JobKind, KilnError, ProviderHandle, ProviderKind, ProviderStatus, Result, Submission,
};
use tracing::{debug, info, warn};

/// Client id sent with prompts queued on pool workers
const CLIENT_ID: &str = "kiln-pool";

/// Provider backed by the instance pool
pub struct SelfHostedProvider {
    pool: InstancePool,
}

/// Where a job's instance stands when polled
enum Target {
    Serving(ComfyClient),
    Lost(String),
}

impl SelfHostedProvider {
    /// Create a provider over `pool`
    pub fn new(pool: InstancePool) -> Self {
        Self { pool }
    }

    /// The underlying pool
    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    fn client_for(&self, instance: &ComputeInstance) -> Option<ComfyClient> {
        instance
            .base_url()
            .map(|url| ComfyClient::new(self.pool.http().clone(), url))
    }

    /// The instance if it can still serve, otherwise why not
    async fn live_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<std::result::Result<ComputeInstance, String>> {
        let Some(instance) = self.pool.store().get_instance(instance_id).await? else {
            return Ok(Err(format!("Instance {} no longer exists", instance_id)));
        };
        if matches!(
            instance.state,
            InstanceState::Stopping | InstanceState::Stopped | InstanceState::Failed
        ) {
            return Ok(Err(format!("Instance {} is {}", instance_id, instance.state)));
        }
        Ok(Ok(instance))
    }

    async fn target(&self, job: &Job) -> Result<Target> {
        let Some(instance_id) = &job.instance_id else {
            return Ok(Target::Lost("no instance assigned".into()));
        };
        let instance = match self.live_instance(instance_id).await? {
            Ok(instance) => instance,
            Err(reason) => return Ok(Target::Lost(reason)),
        };
        match self.client_for(&instance) {
            Some(client) => Ok(Target::Serving(client)),
            None => Ok(Target::Lost(format!("Instance {} has no endpoint", instance_id))),
        }
    }

    fn handle<'a>(job: &'a Job) -> Result<&'a ProviderHandle> {
        job.handle
            .as_ref()
            .ok_or_else(|| KilnError::provider(format!("job {} has no prompt id", job.id)))
    }

    async fn read_status(
        client: &ComfyClient,
        kind: JobKind,
        prompt_id: &str,
    ) -> std::result::Result<ProviderStatus, OrchestratorError> {
        let history = client.history(prompt_id).await?;
        if let Some(status) = comfy::parse_history(kind, prompt_id, &history) {
            return Ok(status);
        }

        let queue = client.queue().await?;
        match comfy::parse_queue(prompt_id, &queue) {
            QueuePosition::Running => Ok(ProviderStatus::Running {
                progress: None,
                stage: None,
            }),
            QueuePosition::Pending => Ok(ProviderStatus::Queued),
            QueuePosition::Absent => {
                let history = client.history(prompt_id).await?;
                // A restarted worker forgets its queue
                Ok(comfy::parse_history(kind, prompt_id, &history).unwrap_or(
                    ProviderStatus::TargetLost {
                        reason: "prompt not found on instance".into(),
                    },
                ))
            }
        }
    }
}

/// Connection-level failures mean the machine is gone, not that the call was unlucky
fn is_unreachable(error: &OrchestratorError) -> bool {
    matches!(error, OrchestratorError::Http(e) if e.is_connect())
}

#[async_trait]
impl ComputeProvider for SelfHostedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SelfHosted
    }

    fn supports(&self, kind: JobKind) -> bool {
        comfy::supports(kind)
    }

    async fn submit(&self, job: &Job) -> Result<Submission> {
        let workflow = Workflow::for_job(job.kind, &job.params).ok_or_else(|| {
            KilnError::Unsupported(format!("self-hosted pool cannot run {} jobs", job.kind))
        })?;

        if let Some(awaited) = &job.instance_id {
            if let Err(reason) = self.live_instance(awaited).await? {
                warn!(job_id = %job.id, instance_id = %awaited, reason = %reason, "Awaited instance is gone");
                return Ok(Submission::TargetLost { reason });
            }
        }

        let instance = match self.pool.acquire(&job.id).await? {
            Acquisition::Ready(instance) => instance,
            Acquisition::Pending(instance_id) => {
                debug!(job_id = %job.id, instance_id = ?instance_id, "No ready instance yet");
                return Ok(Submission::TargetNotReady { instance_id });
            }
        };

        let Some(client) = self.client_for(&instance) else {
            self.pool
                .mark_failed(&instance.id, "ready instance without endpoint")
                .await;
            return Err(KilnError::provider(format!(
                "instance {} has no endpoint",
                instance.id
            )));
        };

        match client.queue_prompt(&workflow, CLIENT_ID).await {
            Ok(prompt_id) => {
                info!(
                    job_id = %job.id,
                    instance_id = %instance.id,
                    prompt_id = %prompt_id,
                    "Submitted to pool instance"
                );
                Ok(Submission::Accepted {
                    handle: ProviderHandle::new(prompt_id),
                    instance_id: Some(instance.id),
                })
            }
            Err(e) => {
                warn!(job_id = %job.id, instance_id = %instance.id, error = %e, "Pool submission failed");
                if is_unreachable(&e) {
                    self.pool.mark_failed(&instance.id, &e.to_string()).await;
                } else if let Err(release_err) = self.pool.release(&instance.id, &job.id).await {
                    warn!(instance_id = %instance.id, error = %release_err, "Failed to release instance");
                }
                Err(e.into())
            }
        }
    }

    async fn status(&self, job: &Job) -> Result<ProviderStatus> {
        let client = match self.target(job).await? {
            Target::Serving(client) => client,
            Target::Lost(reason) => return Ok(ProviderStatus::TargetLost { reason }),
        };
        let handle = Self::handle(job)?;

        match Self::read_status(&client, job.kind, handle.as_str()).await {
            Ok(status) => Ok(status),
            Err(e) if is_unreachable(&e) => Ok(ProviderStatus::TargetLost {
                reason: format!("Instance unreachable: {}", e),
            }),
            Err(e) => Ok(ProviderStatus::Transient {
                reason: e.to_string(),
            }),
        }
    }

    async fn fetch_artifact(&self, job: &Job, artifact: &Artifact) -> Result<Vec<u8>> {
        match self.target(job).await? {
            Target::Serving(client) => Ok(client.view(artifact).await?),
            Target::Lost(reason) => Err(KilnError::provider(reason)),
        }
    }

    async fn cancel(&self, job: &Job) -> Result<()> {
        if let (Target::Serving(client), Some(handle)) = (self.target(job).await?, &job.handle) {
            if let Err(e) = client.cancel(handle.as_str()).await {
                warn!(job_id = %job.id, error = %e, "Failed to interrupt pool worker");
            }
        }
        self.release(job).await
    }

    async fn health(&self) -> Result<()> {
        let serving = self
            .pool
            .instances(&[InstanceState::Ready, InstanceState::Busy])
            .await?;
        // An empty pool is healthy: capacity is rented on demand
        let Some(instance) = serving.first() else {
            return Ok(());
        };
        match self.client_for(instance) {
            Some(client) if client.health_check().await => Ok(()),
            _ => Err(KilnError::network(format!(
                "pool instance {} failed its health check",
                instance.id
            ))),
        }
    }

    async fn release(&self, job: &Job) -> Result<()> {
        if let Some(instance_id) = &job.instance_id {
            self.pool.release(instance_id, &job.id).await?;
        }
        Ok(())
    }
}
