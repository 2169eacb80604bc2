//! Core traits for SpriteKiln
//!
//! The orchestrator works through these interfaces ONLY - never concrete
//! providers or databases. Every compute backend implements
//! [`ComputeProvider`]; every persistence backend implements the three store
//! traits.

use async_trait::async_trait;

use crate::error::KilnError;
use crate::types::*;

/// Result type for provider, store and storage operations
pub type Result<T> = std::result::Result<T, KilnError>;

/// All compute backends must implement this trait.
///
/// Calls take the whole job so adapters can read whatever they keyed the work
/// by (handle, bound instance, params). Adapters never mutate job state; they
/// only report what the backend says.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Provider identity
    fn kind(&self) -> ProviderKind;

    /// Whether this backend can run the given job kind at all
    fn supports(&self, kind: JobKind) -> bool;

    /// Hand the job to the backend
    async fn submit(&self, job: &Job) -> Result<Submission>;

    /// Current state of the submitted work
    async fn status(&self, job: &Job) -> Result<ProviderStatus>;

    /// Download an output the provider still holds
    async fn fetch_artifact(&self, job: &Job, artifact: &Artifact) -> Result<Vec<u8>>;

    /// Best-effort cancellation of the submitted work
    async fn cancel(&self, job: &Job) -> Result<()>;

    /// Reachability check
    async fn health(&self) -> Result<()>;

    /// Give back any compute target held for the job
    async fn release(&self, _job: &Job) -> Result<()> {
        Ok(())
    }
}

/// Durable job rows
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>>;

    async fn find_by_public_id(&self, public_id: &str) -> Result<Option<Job>>;

    /// Job whose current attempt holds `handle`
    async fn find_by_handle(&self, handle: &ProviderHandle) -> Result<Option<Job>>;

    /// Non-terminal jobs, oldest first
    async fn list_active(&self, limit: usize) -> Result<Vec<Job>>;

    /// Apply `update` only if `guard` matches the stored row.
    /// Returns the updated job, or `None` when the guard did not match.
    async fn compare_and_update(
        &self,
        id: &JobId,
        guard: &JobGuard,
        update: &JobUpdate,
    ) -> Result<Option<Job>>;
}

/// Token balances and guest generation counters
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn balance(&self, user_id: &str) -> Result<Option<Balance>>;

    /// Atomically debit `amount`, bonus first. `None` when the balances do not cover it.
    async fn try_debit(&self, user_id: &str, amount: i64) -> Result<Option<TokenSplit>>;

    /// Atomically add back both parts of a split
    async fn credit(&self, user_id: &str, split: TokenSplit) -> Result<()>;

    async fn grant_bonus(&self, user_id: &str, amount: i64) -> Result<()>;

    /// Atomically count one guest generation if fewer than `max` were used.
    /// Returns the generations remaining afterwards, or `None` at the limit.
    async fn consume_guest_generation(&self, session_id: &str, max: u32) -> Result<Option<u32>>;

    /// Give back one guest generation (never below zero)
    async fn restore_guest_generation(&self, session_id: &str) -> Result<()>;

    async fn guest_generations_used(&self, session_id: &str) -> Result<u32>;
}

/// Locally tracked compute instances
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert_instance(&self, instance: &ComputeInstance) -> Result<()>;

    async fn get_instance(&self, id: &InstanceId) -> Result<Option<ComputeInstance>>;

    async fn list_instances(&self, states: &[InstanceState]) -> Result<Vec<ComputeInstance>>;

    /// Atomically move one `ready` instance to `busy` for `job_id`
    async fn claim_ready(&self, job_id: &JobId) -> Result<Option<ComputeInstance>>;

    /// Move `busy -> ready` only while `job_id` still holds the instance
    async fn release_instance(
        &self,
        id: &InstanceId,
        job_id: &JobId,
    ) -> Result<Option<ComputeInstance>>;

    /// Apply `update` only if the instance is in one of `from`
    async fn transition(
        &self,
        id: &InstanceId,
        from: &[InstanceState],
        update: &InstanceUpdate,
    ) -> Result<Option<ComputeInstance>>;

    /// Insert the `creating` placeholder `slot` only if nothing is warming
    /// and fewer than `max_live` instances are live, as one atomic step
    async fn reserve_slot(&self, slot: &ComputeInstance, max_live: usize) -> Result<bool>;

    /// Replace the placeholder `slot` with the rented `instance`
    async fn fill_slot(&self, slot: &InstanceId, instance: &ComputeInstance) -> Result<()>;
}

/// GPU spot marketplace
#[async_trait]
pub trait SpotMarket: Send + Sync {
    /// Matching offers, cheapest first
    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>>;

    async fn create_instance(&self, offer: &Offer, launch: &LaunchRequest) -> Result<InstanceId>;

    async fn get_instance(&self, id: &InstanceId) -> Result<Option<RemoteInstance>>;

    async fn list_instances(&self) -> Result<Vec<RemoteInstance>>;

    async fn destroy_instance(&self, id: &InstanceId) -> Result<()>;
}

/// Public object storage for finished outputs
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` at `path` and return its public URL
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;
}
