//! In-process stores
//!
//! Used by tests and by `kiln serve` when no database URL is given. Each
//! operation takes the lock once and never awaits while holding it, so every
//! call is atomic the same way a single SQL statement is.

use async_trait::async_trait;
use chrono::Utc;
use kiln_core::{
    Balance, ComputeInstance, InstanceId, InstanceState, InstanceStore, InstanceUpdate, Job,
    JobGuard, JobId, JobStatus, JobStore, JobUpdate, KilnError, LedgerStore, ObjectStorage,
    ProviderHandle, Result, TokenSplit,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    users: HashMap<String, Balance>,
    guests: HashMap<String, u32>,
    instances: HashMap<InstanceId, ComputeInstance>,
}

/// Jobs, balances and instances held in memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| KilnError::Internal("memory store lock poisoned".into()))
    }

    /// Create or overwrite a user's balances
    pub fn put_user(&self, user_id: &str, tokens: i64, bonus_tokens: i64) {
        if let Ok(mut inner) = self.lock() {
            inner.users.insert(
                user_id.to_string(),
                Balance {
                    tokens,
                    bonus_tokens,
                },
            );
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.jobs.contains_key(&job.id)
            || inner.jobs.values().any(|j| j.public_id == job.public_id)
        {
            return Err(KilnError::database(format!("duplicate job {}", job.id)));
        }
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(id).cloned())
    }

    async fn find_by_public_id(&self, public_id: &str) -> Result<Option<Job>> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .find(|j| j.public_id == public_id)
            .cloned())
    }

    async fn find_by_handle(&self, handle: &ProviderHandle) -> Result<Option<Job>> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .find(|j| j.handle.as_ref() == Some(handle))
            .cloned())
    }

    async fn list_active(&self, limit: usize) -> Result<Vec<Job>> {
        let inner = self.lock()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| JobStatus::ACTIVE.contains(&j.status))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn compare_and_update(
        &self,
        id: &JobId,
        guard: &JobGuard,
        update: &JobUpdate,
    ) -> Result<Option<Job>> {
        let mut inner = self.lock()?;
        let Some(job) = inner.jobs.get_mut(id) else {
            return Ok(None);
        };
        if !guard.matches(job) {
            return Ok(None);
        }
        update.apply(job, Utc::now());
        Ok(Some(job.clone()))
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn balance(&self, user_id: &str) -> Result<Option<Balance>> {
        Ok(self.lock()?.users.get(user_id).copied())
    }

    async fn try_debit(&self, user_id: &str, amount: i64) -> Result<Option<TokenSplit>> {
        let mut inner = self.lock()?;
        let Some(balance) = inner.users.get_mut(user_id) else {
            return Ok(None);
        };
        let Some(split) = TokenSplit::bonus_first(amount, balance.tokens, balance.bonus_tokens)
        else {
            return Ok(None);
        };
        balance.tokens -= split.regular;
        balance.bonus_tokens -= split.bonus;
        Ok(Some(split))
    }

    async fn credit(&self, user_id: &str, split: TokenSplit) -> Result<()> {
        let mut inner = self.lock()?;
        let balance = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| KilnError::NotFound(format!("user {}", user_id)))?;
        balance.tokens += split.regular;
        balance.bonus_tokens += split.bonus;
        Ok(())
    }

    async fn grant_bonus(&self, user_id: &str, amount: i64) -> Result<()> {
        let mut inner = self.lock()?;
        let balance = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| KilnError::NotFound(format!("user {}", user_id)))?;
        balance.bonus_tokens += amount;
        Ok(())
    }

    async fn consume_guest_generation(&self, session_id: &str, max: u32) -> Result<Option<u32>> {
        let mut inner = self.lock()?;
        let used = inner.guests.entry(session_id.to_string()).or_insert(0);
        if *used >= max {
            return Ok(None);
        }
        *used += 1;
        Ok(Some(max - *used))
    }

    async fn restore_guest_generation(&self, session_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(used) = inner.guests.get_mut(session_id) {
            *used = used.saturating_sub(1);
        }
        Ok(())
    }

    async fn guest_generations_used(&self, session_id: &str) -> Result<u32> {
        Ok(self.lock()?.guests.get(session_id).copied().unwrap_or(0))
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn insert_instance(&self, instance: &ComputeInstance) -> Result<()> {
        self.lock()?
            .instances
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &InstanceId) -> Result<Option<ComputeInstance>> {
        Ok(self.lock()?.instances.get(id).cloned())
    }

    async fn list_instances(&self, states: &[InstanceState]) -> Result<Vec<ComputeInstance>> {
        let inner = self.lock()?;
        let mut instances: Vec<ComputeInstance> = inner
            .instances
            .values()
            .filter(|i| states.contains(&i.state))
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    async fn claim_ready(&self, job_id: &JobId) -> Result<Option<ComputeInstance>> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let candidate = inner
            .instances
            .values_mut()
            .filter(|i| i.state == InstanceState::Ready)
            .min_by_key(|i| i.last_activity_at);
        let Some(instance) = candidate else {
            return Ok(None);
        };
        InstanceUpdate::to(InstanceState::Busy)
            .with_job(Some(job_id.clone()))
            .touched(now)
            .apply(instance, now);
        Ok(Some(instance.clone()))
    }

    async fn release_instance(
        &self,
        id: &InstanceId,
        job_id: &JobId,
    ) -> Result<Option<ComputeInstance>> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        match inner.instances.get_mut(id) {
            Some(instance)
                if instance.state == InstanceState::Busy
                    && instance.current_job_id.as_ref() == Some(job_id) =>
            {
                InstanceUpdate::to(InstanceState::Ready)
                    .with_job(None)
                    .touched(now)
                    .apply(instance, now);
                Ok(Some(instance.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn transition(
        &self,
        id: &InstanceId,
        from: &[InstanceState],
        update: &InstanceUpdate,
    ) -> Result<Option<ComputeInstance>> {
        let mut inner = self.lock()?;
        match inner.instances.get_mut(id) {
            Some(instance) if from.contains(&instance.state) => {
                update.apply(instance, Utc::now());
                Ok(Some(instance.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn reserve_slot(&self, slot: &ComputeInstance, max_live: usize) -> Result<bool> {
        let mut inner = self.lock()?;
        let live: Vec<&ComputeInstance> =
            inner.instances.values().filter(|i| i.state.is_live()).collect();
        if live.len() >= max_live || live.iter().any(|i| i.state.is_warming()) {
            return Ok(false);
        }
        inner.instances.insert(slot.id.clone(), slot.clone());
        Ok(true)
    }

    async fn fill_slot(&self, slot: &InstanceId, instance: &ComputeInstance) -> Result<()> {
        let mut inner = self.lock()?;
        inner.instances.remove(slot);
        inner.instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }
}

/// Object storage that keeps bytes in memory and hands out `memory://` URLs
#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored bytes at `path`
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(path).map(|(bytes, _)| bytes.clone()))
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        self.objects
            .lock()
            .map_err(|_| KilnError::storage("object map lock poisoned"))?
            .insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(format!("memory://{}", path))
    }
}
