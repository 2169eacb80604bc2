//! Elastic pool of self-hosted GPU instances
//!
//! ```text
//!              acquire(job)
//!                   │
//!      ┌── claim ready ──► Ready(instance)            (ready -> busy)
//!      ├── one warming ──► Pending(id)                (creating/starting)
//!      ├── slot reserved ► rent cheapest offer ──► Pending(id)
//!      │                        │
//!      │                        └─ spawn: wait running ─► starting ─► health ─► ready
//!      └── at cap ───────► Pending(None)
//! ```
//!
//! Capacity is claimed before renting: the store inserts a `creating`
//! placeholder slot only while nothing else is warming and the pool is under
//! its cap, as one atomic step. The slot is swapped for the rented machine
//! once the market answers. A slot orphaned by a crash is absent from the
//! market and `sync` stops it after the grace period.
//!
//! The pool only reports instance state; it never fails a job. Idle and
//! failed instances are reaped by [`InstancePool::destroy_idle`] and
//! [`InstancePool::cleanup_failed`], and [`InstancePool::sync`] reconciles
//! the local view with what the market reports.

use crate::comfy::{ComfyClient, DEFAULT_WORKER_PORT};
use crate::error::{OrchestratorError, Result};
use crate::poll::{poll_until, PollOutcome, PollPolicy};
use chrono::Utc;
use kiln_core::{
    ComputeInstance, InstanceId, InstanceState, InstanceStore, InstanceUpdate, JobId,
    LaunchRequest, OfferQuery, RemoteStatus, SpotMarket,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Instances younger than this are left alone by `sync` (the market may not list them yet)
const SYNC_GRACE: Duration = Duration::from_secs(60);

/// Id prefix of capacity placeholders that have no rented machine yet
const SLOT_PREFIX: &str = "slot-";

fn is_slot(id: &InstanceId) -> bool {
    id.as_str().starts_with(SLOT_PREFIX)
}

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum live instances (creating through busy)
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Ready instances idle longer than this are destroyed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: Duration,

    /// Wait for the market to report the machine running
    #[serde(default = "default_startup")]
    pub startup: PollPolicy,

    /// Wait for the worker's health endpoint
    #[serde(default = "default_health")]
    pub health: PollPolicy,

    /// Offer constraints
    #[serde(default)]
    pub offer_query: OfferQuery,

    /// Container port the worker listens on
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,
}

fn default_max_instances() -> usize {
    3
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_startup() -> PollPolicy {
    PollPolicy::fixed(Duration::from_secs(10), Duration::from_secs(300))
}

fn default_health() -> PollPolicy {
    PollPolicy::fixed(Duration::from_secs(5), Duration::from_secs(180))
}

fn default_worker_port() -> u16 {
    DEFAULT_WORKER_PORT
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            idle_timeout: default_idle_timeout(),
            startup: default_startup(),
            health: default_health(),
            offer_query: OfferQuery::default(),
            worker_port: default_worker_port(),
        }
    }
}

impl PoolConfig {
    /// Set instance cap
    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set startup and health polling
    pub fn with_polling(mut self, startup: PollPolicy, health: PollPolicy) -> Self {
        self.startup = startup;
        self.health = health;
        self
    }

    /// Set offer constraints
    pub fn with_offer_query(mut self, query: OfferQuery) -> Self {
        self.offer_query = query;
        self
    }
}

/// Result of asking the pool for compute
#[derive(Debug, Clone, PartialEq)]
pub enum Acquisition {
    /// Instance now busy for the job
    Ready(ComputeInstance),
    /// Nothing free yet; the id is the instance being brought up, if any
    Pending(Option<InstanceId>),
}

/// One instance whose state `sync` changed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChange {
    pub instance_id: InstanceId,
    pub from: InstanceState,
    pub to: InstanceState,
    pub reason: String,
}

/// Outcome of reconciling local instances with the market
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub checked: usize,
    pub changes: Vec<SyncChange>,
}

/// Counts from a cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub idle_destroyed: usize,
    pub failed_cleaned: usize,
}

/// Self-hosted instance pool manager
#[derive(Clone)]
pub struct InstancePool {
    store: Arc<dyn InstanceStore>,
    market: Arc<dyn SpotMarket>,
    launch: LaunchRequest,
    config: PoolConfig,
    http: reqwest::Client,
}

impl InstancePool {
    /// Create a new pool
    pub fn new(
        store: Arc<dyn InstanceStore>,
        market: Arc<dyn SpotMarket>,
        launch: LaunchRequest,
        config: PoolConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            store,
            market,
            launch,
            config,
            http,
        })
    }

    /// Instance store backing the pool
    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Shared HTTP client for worker calls
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// All locally known instances in the given states
    pub async fn instances(&self, states: &[InstanceState]) -> Result<Vec<ComputeInstance>> {
        Ok(self.store.list_instances(states).await?)
    }

    /// Get compute for `job_id`, renting a new machine when below the cap
    pub async fn acquire(&self, job_id: &JobId) -> Result<Acquisition> {
        if let Some(instance) = self.store.claim_ready(job_id).await? {
            info!(job_id = %job_id, instance_id = %instance.id, "Claimed ready instance");
            return Ok(Acquisition::Ready(instance));
        }
        if let Some(id) = self.warming_instance().await? {
            debug!(job_id = %job_id, instance_id = %id, "Waiting on warming instance");
            // A slot still being rented has no machine to wait on yet
            return Ok(Acquisition::Pending((!is_slot(&id)).then_some(id)));
        }

        let slot = ComputeInstance::creating(
            InstanceId::new(format!("{}{}", SLOT_PREFIX, uuid::Uuid::new_v4())),
            None,
            None,
        );
        if !self
            .store
            .reserve_slot(&slot, self.config.max_instances)
            .await?
        {
            debug!(max = self.config.max_instances, "Instance pool at capacity");
            return Ok(Acquisition::Pending(None));
        }

        let id = self.provision(&slot.id).await?;
        Ok(Acquisition::Pending(Some(id)))
    }

    async fn warming_instance(&self) -> Result<Option<InstanceId>> {
        Ok(self
            .store
            .list_instances(&[InstanceState::Creating, InstanceState::Starting])
            .await?
            .into_iter()
            .next()
            .map(|i| i.id))
    }

    /// Rent the cheapest matching offer into `slot` and start bringing it up
    /// in the background
    async fn provision(&self, slot: &InstanceId) -> Result<InstanceId> {
        let instance = match self.rent().await {
            Ok(instance) => instance,
            Err(e) => {
                self.abandon_slot(slot, &e.to_string()).await;
                return Err(e);
            }
        };
        let id = instance.id.clone();
        if let Err(e) = self.store.fill_slot(slot, &instance).await {
            error!(instance_id = %id, error = %e, "Failed to record rented instance, destroying it");
            if let Err(e) = self.market.destroy_instance(&id).await {
                warn!(instance_id = %id, error = %e, "Failed to destroy untracked instance");
            }
            return Err(e.into());
        }
        info!(
            instance_id = %id,
            gpu = ?instance.gpu_name,
            dph = ?instance.cost_per_hour,
            "Provisioning instance"
        );

        let pool = self.clone();
        let startup_id = id.clone();
        tokio::spawn(async move {
            pool.bring_up(&startup_id).await;
        });
        Ok(id)
    }

    async fn rent(&self) -> Result<ComputeInstance> {
        let offers = self.market.search_offers(&self.config.offer_query).await?;
        let offer = offers
            .into_iter()
            .min_by(|a, b| a.dph_total.total_cmp(&b.dph_total))
            .ok_or_else(|| {
                OrchestratorError::Core(kiln_core::KilnError::provider(
                    "no GPU offers match the configured constraints",
                ))
            })?;
        let id = self.market.create_instance(&offer, &self.launch).await?;
        Ok(ComputeInstance::creating(
            id,
            Some(offer.gpu_name),
            Some(offer.dph_total),
        ))
    }

    async fn abandon_slot(&self, slot: &InstanceId, reason: &str) {
        let update = InstanceUpdate::to(InstanceState::Stopped).with_error(reason);
        if let Err(e) = self
            .store
            .transition(slot, &[InstanceState::Creating], &update)
            .await
        {
            warn!(slot = %slot, error = %e, "Failed to free capacity slot");
        }
    }

    /// Background startup: wait running, record endpoint, wait healthy, mark ready
    pub async fn bring_up(&self, id: &InstanceId) {
        match self.wait_until_serving(id).await {
            Ok(instance) => {
                info!(
                    instance_id = %id,
                    endpoint = ?instance.base_url(),
                    "Instance ready"
                );
            }
            Err(e) => {
                error!(instance_id = %id, error = %e, "Instance failed to start");
                self.mark_failed(id, &e.to_string()).await;
            }
        }
    }

    async fn wait_until_serving(&self, id: &InstanceId) -> Result<ComputeInstance> {
        let market = &self.market;
        let worker_port = self.config.worker_port;

        let endpoint = poll_until(&self.config.startup, || async move {
            match market.get_instance(id).await? {
                Some(remote) if remote.status.is_dead() => Err(OrchestratorError::Core(
                    kiln_core::KilnError::provider(format!(
                        "instance {} reported {:?} while starting",
                        id, remote.status
                    )),
                )),
                Some(remote) if remote.status == RemoteStatus::Running => {
                    Ok(remote.endpoint(worker_port))
                }
                _ => Ok(None),
            }
        })
        .await?;
        let PollOutcome::Ready((host, port)) = endpoint else {
            return Err(OrchestratorError::Timeout(self.config.startup.timeout));
        };

        let starting = InstanceUpdate::to(InstanceState::Starting).with_endpoint(host, port);
        let instance = self
            .store
            .transition(id, &[InstanceState::Creating], &starting)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("creating instance {}", id)))?;
        let base_url = instance
            .base_url()
            .ok_or_else(|| OrchestratorError::not_found(format!("endpoint of instance {}", id)))?;

        let client = ComfyClient::new(self.http.clone(), base_url);
        let client = &client;
        let healthy = poll_until(&self.config.health, || async move {
            Ok::<_, OrchestratorError>(client.health_check().await.then_some(()))
        })
        .await?;
        if healthy == PollOutcome::TimedOut {
            return Err(OrchestratorError::Timeout(self.config.health.timeout));
        }

        let ready = InstanceUpdate::to(InstanceState::Ready).touched(Utc::now());
        self.store
            .transition(id, &[InstanceState::Starting], &ready)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("starting instance {}", id)))
    }

    /// Mark an instance failed and destroy it remotely (best-effort)
    pub async fn mark_failed(&self, id: &InstanceId, reason: &str) {
        let update = InstanceUpdate::to(InstanceState::Failed).with_error(reason);
        if let Err(e) = self.store.transition(id, &InstanceState::LIVE, &update).await {
            warn!(instance_id = %id, error = %e, "Failed to record instance failure");
        }
        if let Err(e) = self.market.destroy_instance(id).await {
            warn!(instance_id = %id, error = %e, "Failed to destroy failed instance");
        }
    }

    /// Return a busy instance to `ready` if `job_id` still holds it
    pub async fn release(&self, id: &InstanceId, job_id: &JobId) -> Result<bool> {
        let released = self.store.release_instance(id, job_id).await?;
        match &released {
            Some(_) => info!(instance_id = %id, job_id = %job_id, "Released instance"),
            None => debug!(instance_id = %id, job_id = %job_id, "Instance not held by job"),
        }
        Ok(released.is_some())
    }

    /// Destroy ready instances idle past the timeout. Returns how many were destroyed.
    pub async fn destroy_idle(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.idle_timeout)
                .map_err(|e| OrchestratorError::config(e.to_string()))?;
        let idle: Vec<ComputeInstance> = self
            .store
            .list_instances(&[InstanceState::Ready])
            .await?
            .into_iter()
            .filter(|i| i.last_activity_at.is_none_or(|at| at < cutoff))
            .collect();

        let mut destroyed = 0;
        for instance in idle {
            let stopping = InstanceUpdate::to(InstanceState::Stopping);
            match self
                .store
                .transition(&instance.id, &[InstanceState::Ready], &stopping)
                .await
            {
                Ok(Some(_)) => {}
                Ok(None) => continue, // claimed meanwhile
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "Failed to stop idle instance");
                    continue;
                }
            }

            match self.market.destroy_instance(&instance.id).await {
                Ok(()) => {
                    let stopped = InstanceUpdate::to(InstanceState::Stopped);
                    if let Err(e) = self
                        .store
                        .transition(&instance.id, &[InstanceState::Stopping], &stopped)
                        .await
                    {
                        warn!(instance_id = %instance.id, error = %e, "Failed to record stop");
                        continue;
                    }
                    info!(instance_id = %instance.id, "Destroyed idle instance");
                    destroyed += 1;
                }
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "Failed to destroy idle instance");
                    let failed = InstanceUpdate::to(InstanceState::Failed)
                        .with_error(format!("destroy failed: {}", e));
                    if let Err(e) = self
                        .store
                        .transition(&instance.id, &[InstanceState::Stopping], &failed)
                        .await
                    {
                        warn!(instance_id = %instance.id, error = %e, "Failed to record destroy failure");
                    }
                }
            }
        }
        Ok(destroyed)
    }

    /// Destroy lingering failed instances and mark them stopped
    pub async fn cleanup_failed(&self) -> Result<usize> {
        let failed = self.store.list_instances(&[InstanceState::Failed]).await?;
        let mut cleaned = 0;
        for instance in failed {
            if let Err(e) = self.market.destroy_instance(&instance.id).await {
                // Usually already gone
                debug!(instance_id = %instance.id, error = %e, "Destroy of failed instance errored");
            }
            match self
                .store
                .transition(
                    &instance.id,
                    &[InstanceState::Failed],
                    &InstanceUpdate::to(InstanceState::Stopped),
                )
                .await
            {
                Ok(Some(_)) => cleaned += 1,
                Ok(None) => {}
                Err(e) => warn!(instance_id = %instance.id, error = %e, "Failed to clean up instance"),
            }
        }
        Ok(cleaned)
    }

    /// Idle sweep followed by failed cleanup
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let idle_destroyed = self.destroy_idle().await?;
        let failed_cleaned = self.cleanup_failed().await?;
        if idle_destroyed + failed_cleaned > 0 {
            info!(idle_destroyed, failed_cleaned, "Instance cleanup finished");
        }
        Ok(CleanupReport {
            idle_destroyed,
            failed_cleaned,
        })
    }

    /// Reconcile local instance rows with the market's view
    pub async fn sync(&self) -> Result<SyncReport> {
        let remote: HashMap<InstanceId, RemoteStatus> = self
            .market
            .list_instances()
            .await?
            .into_iter()
            .map(|r| (r.id, r.status))
            .collect();
        let local = self.store.list_instances(&InstanceState::LIVE).await?;
        let grace_cutoff = Utc::now()
            - chrono::Duration::from_std(SYNC_GRACE)
                .map_err(|e| OrchestratorError::config(e.to_string()))?;

        let mut report = SyncReport {
            checked: local.len(),
            changes: Vec::new(),
        };
        for instance in local {
            let (to, reason) = match remote.get(&instance.id) {
                None if instance.created_at > grace_cutoff => continue,
                None => (
                    InstanceState::Stopped,
                    "Instance not found on provider (manually deleted?)".to_string(),
                ),
                Some(status) if status.is_dead() => (
                    InstanceState::Failed,
                    format!("Instance {:?} on provider", status).to_lowercase(),
                ),
                Some(_) => continue,
            };

            let update = InstanceUpdate::to(to).with_error(reason.clone());
            match self
                .store
                .transition(&instance.id, &[instance.state], &update)
                .await
            {
                Ok(Some(_)) => {
                    warn!(instance_id = %instance.id, from = %instance.state, to = %to, reason = %reason, "Instance state synced");
                    report.changes.push(SyncChange {
                        instance_id: instance.id,
                        from: instance.state,
                        to,
                        reason,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(instance_id = %instance.id, error = %e, "Failed to sync instance"),
            }
        }
        Ok(report)
    }

    /// Mark every live instance stopped locally (admin)
    pub async fn force_stop_all(&self) -> Result<usize> {
        let live = self.store.list_instances(&InstanceState::LIVE).await?;
        let mut stopped = 0;
        for instance in live {
            let update = InstanceUpdate::to(InstanceState::Stopped).with_error("Force stopped by admin");
            if self
                .store
                .transition(&instance.id, &InstanceState::LIVE, &update)
                .await?
                .is_some()
            {
                stopped += 1;
            }
        }
        warn!(stopped, "Force stopped all instances");
        Ok(stopped)
    }
}
