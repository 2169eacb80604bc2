//! PostgreSQL stores
//!
//! One [`PgStore`] implements the job, ledger and instance stores over a
//! shared pool. Every mutation the orchestrator relies on for exclusivity is a
//! single statement or a row-locked transaction:
//!
//! - job compare-and-set: `SELECT ... FOR UPDATE`, guard check, write back
//! - debit: one `UPDATE` that checks the total and spends bonus first
//! - instance claim: `FOR UPDATE SKIP LOCKED` so concurrent claimers never
//!   get the same row
//! - pool capacity: conditional insert under a transaction-scoped advisory lock

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::{
    Balance, ComputeInstance, InstanceId, InstanceState, InstanceStore, InstanceUpdate, Job,
    JobGuard, JobId, JobKind, JobParams, JobStatus, JobStore, JobUpdate, KilnError, LedgerStore,
    OwnerRef, ProviderHandle, ProviderKind, Result, TokenSplit,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use tracing::info;

const JOB_COLUMNS: &str = "id, public_id, user_id, guest_session_id, kind, params, provider, \
    status, handle, instance_id, retry_count, regular_tokens_used, bonus_tokens_used, result, \
    error, progress, current_stage, created_at, submitted_at, updated_at, completed_at";

const INSTANCE_COLUMNS: &str = "id, state, host, port, current_job_id, gpu_name, cost_per_hour, \
    error, last_activity_at, created_at, updated_at";

/// Advisory lock key serializing pool capacity checks across processes
const PROVISION_LOCK: i64 = 0x6b69_6c6e;

fn db(err: sqlx::Error) -> KilnError {
    KilnError::database(err)
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    public_id: String,
    user_id: Option<String>,
    guest_session_id: Option<String>,
    kind: String,
    params: Json<JobParams>,
    provider: String,
    status: String,
    handle: Option<String>,
    instance_id: Option<String>,
    retry_count: i32,
    regular_tokens_used: i64,
    bonus_tokens_used: i64,
    result: Json<BTreeMap<String, String>>,
    error: Option<String>,
    progress: i16,
    current_stage: Option<String>,
    created_at: DateTime<Utc>,
    submitted_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = KilnError;

    fn try_from(row: JobRow) -> Result<Self> {
        let owner = match (row.user_id, row.guest_session_id) {
            (Some(user), _) => OwnerRef::User(user),
            (None, Some(session)) => OwnerRef::Guest(session),
            (None, None) => {
                return Err(KilnError::database(format!("job {} has no owner", row.id)));
            }
        };
        let unknown = |what: &str, value: &str| {
            KilnError::database(format!("job {} has unknown {} '{}'", row.id, what, value))
        };

        Ok(Job {
            kind: JobKind::parse(&row.kind).ok_or_else(|| unknown("kind", &row.kind))?,
            provider: ProviderKind::parse(&row.provider)
                .ok_or_else(|| unknown("provider", &row.provider))?,
            status: JobStatus::parse(&row.status).ok_or_else(|| unknown("status", &row.status))?,
            public_id: row.public_id,
            owner,
            params: row.params.0,
            handle: row.handle.map(ProviderHandle::new),
            instance_id: row.instance_id.map(InstanceId::new),
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            cost: TokenSplit::new(row.regular_tokens_used, row.bonus_tokens_used),
            result: row.result.0,
            error: row.error,
            progress: u8::try_from(row.progress.clamp(0, 100)).unwrap_or(0),
            stage: row.current_stage,
            created_at: row.created_at,
            submitted_at: row.submitted_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            id: JobId::new(row.id),
        })
    }
}

#[derive(Debug, FromRow)]
struct InstanceRow {
    id: String,
    state: String,
    host: Option<String>,
    port: Option<i32>,
    current_job_id: Option<String>,
    gpu_name: Option<String>,
    cost_per_hour: Option<f64>,
    error: Option<String>,
    last_activity_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for ComputeInstance {
    type Error = KilnError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        let state = InstanceState::parse(&row.state).ok_or_else(|| {
            KilnError::database(format!("instance {} has unknown state '{}'", row.id, row.state))
        })?;
        Ok(ComputeInstance {
            id: InstanceId::new(row.id),
            state,
            host: row.host,
            port: row.port.and_then(|p| u16::try_from(p).ok()),
            current_job_id: row.current_job_id.map(JobId::new),
            gpu_name: row.gpu_name,
            cost_per_hour: row.cost_per_hour,
            error: row.error,
            last_activity_at: row.last_activity_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Jobs, balances and instances in PostgreSQL
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and apply pending migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(KilnError::database)?;
        info!(max_connections, "Connected to database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create a user with starting balances, or overwrite them
    pub async fn upsert_user(&self, user_id: &str, tokens: i64, bonus_tokens: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, tokens, bonus_tokens) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET tokens = EXCLUDED.tokens, bonus_tokens = EXCLUDED.bonus_tokens",
        )
        .bind(user_id)
        .bind(tokens)
        .bind(bonus_tokens)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn fetch_job(&self, clause: &str, value: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE {} = $1", JOB_COLUMNS, clause);
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .map(Job::try_from)
            .transpose()
    }
}

fn status_names(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        let sql = format!(
            "INSERT INTO jobs ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)",
            JOB_COLUMNS
        );
        sqlx::query(&sql)
            .bind(job.id.as_str())
            .bind(&job.public_id)
            .bind(job.owner.user_id())
            .bind(job.owner.guest_session())
            .bind(job.kind.as_str())
            .bind(Json(&job.params))
            .bind(job.provider.as_str())
            .bind(job.status.as_str())
            .bind(job.handle.as_ref().map(|h| h.as_str()))
            .bind(job.instance_id.as_ref().map(|i| i.as_str()))
            .bind(job.retry_count as i32)
            .bind(job.cost.regular)
            .bind(job.cost.bonus)
            .bind(Json(&job.result))
            .bind(job.error.as_deref())
            .bind(i16::from(job.progress))
            .bind(job.stage.as_deref())
            .bind(job.created_at)
            .bind(job.submitted_at)
            .bind(job.updated_at)
            .bind(job.completed_at)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.fetch_job("id", id.as_str()).await
    }

    async fn find_by_public_id(&self, public_id: &str) -> Result<Option<Job>> {
        self.fetch_job("public_id", public_id).await
    }

    async fn find_by_handle(&self, handle: &ProviderHandle) -> Result<Option<Job>> {
        self.fetch_job("handle", handle.as_str()).await
    }

    async fn list_active(&self, limit: usize) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE status = ANY($1) ORDER BY created_at LIMIT $2",
            JOB_COLUMNS
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(status_names(&JobStatus::ACTIVE))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(db)?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    async fn compare_and_update(
        &self,
        id: &JobId,
        guard: &JobGuard,
        update: &JobUpdate,
    ) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let sql = format!("SELECT {} FROM jobs WHERE id = $1 FOR UPDATE", JOB_COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = Job::try_from(row)?;
        if !guard.matches(&job) {
            return Ok(None);
        }
        update.apply(&mut job, Utc::now());

        sqlx::query(
            "UPDATE jobs SET status = $2, handle = $3, instance_id = $4, retry_count = $5, \
             result = $6, error = $7, progress = $8, current_stage = $9, submitted_at = $10, \
             updated_at = $11, completed_at = $12 WHERE id = $1",
        )
        .bind(job.id.as_str())
        .bind(job.status.as_str())
        .bind(job.handle.as_ref().map(|h| h.as_str()))
        .bind(job.instance_id.as_ref().map(|i| i.as_str()))
        .bind(job.retry_count as i32)
        .bind(Json(&job.result))
        .bind(job.error.as_deref())
        .bind(i16::from(job.progress))
        .bind(job.stage.as_deref())
        .bind(job.submitted_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(Some(job))
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn balance(&self, user_id: &str) -> Result<Option<Balance>> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT tokens, bonus_tokens FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?;
        Ok(row.map(|(tokens, bonus_tokens)| Balance {
            tokens,
            bonus_tokens,
        }))
    }

    async fn try_debit(&self, user_id: &str, amount: i64) -> Result<Option<TokenSplit>> {
        let bonus: Option<(i64,)> = sqlx::query_as(
            "WITH current AS ( \
                 SELECT id, LEAST(bonus_tokens, $2) AS bonus_used FROM users \
                 WHERE id = $1 AND tokens + bonus_tokens >= $2 FOR UPDATE \
             ) \
             UPDATE users u SET bonus_tokens = u.bonus_tokens - c.bonus_used, \
                 tokens = u.tokens - ($2 - c.bonus_used) \
             FROM current c WHERE u.id = c.id \
             RETURNING c.bonus_used",
        )
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        Ok(bonus.map(|(bonus,)| TokenSplit::new(amount - bonus, bonus)))
    }

    async fn credit(&self, user_id: &str, split: TokenSplit) -> Result<()> {
        let done = sqlx::query(
            "UPDATE users SET tokens = tokens + $2, bonus_tokens = bonus_tokens + $3 WHERE id = $1",
        )
        .bind(user_id)
        .bind(split.regular)
        .bind(split.bonus)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        if done.rows_affected() == 0 {
            return Err(KilnError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    async fn grant_bonus(&self, user_id: &str, amount: i64) -> Result<()> {
        let done = sqlx::query("UPDATE users SET bonus_tokens = bonus_tokens + $2 WHERE id = $1")
            .bind(user_id)
            .bind(amount)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        if done.rows_affected() == 0 {
            return Err(KilnError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    async fn consume_guest_generation(&self, session_id: &str, max: u32) -> Result<Option<u32>> {
        if max == 0 {
            return Ok(None);
        }
        let used: Option<(i32,)> = sqlx::query_as(
            "INSERT INTO guest_sessions (session_id, generations_used) VALUES ($1, 1) \
             ON CONFLICT (session_id) DO UPDATE \
                 SET generations_used = guest_sessions.generations_used + 1 \
                 WHERE guest_sessions.generations_used < $2 \
             RETURNING generations_used",
        )
        .bind(session_id)
        .bind(max as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        Ok(used.map(|(used,)| max.saturating_sub(u32::try_from(used).unwrap_or(max))))
    }

    async fn restore_guest_generation(&self, session_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE guest_sessions SET generations_used = GREATEST(generations_used - 1, 0) \
             WHERE session_id = $1",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn guest_generations_used(&self, session_id: &str) -> Result<u32> {
        let used: Option<(i32,)> =
            sqlx::query_as("SELECT generations_used FROM guest_sessions WHERE session_id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?;
        Ok(used.map_or(0, |(used,)| u32::try_from(used).unwrap_or(0)))
    }
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn insert_instance(&self, instance: &ComputeInstance) -> Result<()> {
        let sql = format!(
            "INSERT INTO compute_instances ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (id) DO NOTHING",
            INSTANCE_COLUMNS
        );
        bind_instance(sqlx::query(&sql), instance)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn get_instance(&self, id: &InstanceId) -> Result<Option<ComputeInstance>> {
        let sql = format!("SELECT {} FROM compute_instances WHERE id = $1", INSTANCE_COLUMNS);
        sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .map(ComputeInstance::try_from)
            .transpose()
    }

    async fn list_instances(&self, states: &[InstanceState]) -> Result<Vec<ComputeInstance>> {
        let sql = format!(
            "SELECT {} FROM compute_instances WHERE state = ANY($1) ORDER BY created_at",
            INSTANCE_COLUMNS
        );
        let names: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
        sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(names)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?
            .into_iter()
            .map(ComputeInstance::try_from)
            .collect()
    }

    async fn claim_ready(&self, job_id: &JobId) -> Result<Option<ComputeInstance>> {
        let sql = format!(
            "UPDATE compute_instances \
             SET state = 'busy', current_job_id = $1, last_activity_at = NOW(), updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM compute_instances WHERE state = 'ready' \
                 ORDER BY last_activity_at NULLS FIRST LIMIT 1 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {}",
            INSTANCE_COLUMNS
        );
        sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .map(ComputeInstance::try_from)
            .transpose()
    }

    async fn release_instance(
        &self,
        id: &InstanceId,
        job_id: &JobId,
    ) -> Result<Option<ComputeInstance>> {
        let sql = format!(
            "UPDATE compute_instances \
             SET state = 'ready', current_job_id = NULL, last_activity_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND state = 'busy' AND current_job_id = $2 \
             RETURNING {}",
            INSTANCE_COLUMNS
        );
        sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(id.as_str())
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .map(ComputeInstance::try_from)
            .transpose()
    }

    async fn transition(
        &self,
        id: &InstanceId,
        from: &[InstanceState],
        update: &InstanceUpdate,
    ) -> Result<Option<ComputeInstance>> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let sql = format!(
            "SELECT {} FROM compute_instances WHERE id = $1 FOR UPDATE",
            INSTANCE_COLUMNS
        );
        let row = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut instance = ComputeInstance::try_from(row)?;
        if !from.contains(&instance.state) {
            return Ok(None);
        }
        update.apply(&mut instance, Utc::now());

        sqlx::query(
            "UPDATE compute_instances SET state = $2, host = $3, port = $4, current_job_id = $5, \
             error = $6, last_activity_at = $7, updated_at = $8 WHERE id = $1",
        )
        .bind(instance.id.as_str())
        .bind(instance.state.as_str())
        .bind(instance.host.as_deref())
        .bind(instance.port.map(i32::from))
        .bind(instance.current_job_id.as_ref().map(|j| j.as_str()))
        .bind(instance.error.as_deref())
        .bind(instance.last_activity_at)
        .bind(instance.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(Some(instance))
    }

    async fn reserve_slot(&self, slot: &ComputeInstance, max_live: usize) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(PROVISION_LOCK)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        let sql = format!(
            "INSERT INTO compute_instances ({}) \
             SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11 \
             WHERE (SELECT COUNT(*) FROM compute_instances WHERE state = ANY($12)) < $13 \
             AND NOT EXISTS ( \
                 SELECT 1 FROM compute_instances WHERE state IN ('creating', 'starting') \
             )",
            INSTANCE_COLUMNS
        );
        let live: Vec<String> = InstanceState::LIVE
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let inserted = bind_instance(sqlx::query(&sql), slot)
            .bind(live)
            .bind(i64::try_from(max_live).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await
            .map_err(db)?
            .rows_affected();
        tx.commit().await.map_err(db)?;
        Ok(inserted == 1)
    }

    async fn fill_slot(&self, slot: &InstanceId, instance: &ComputeInstance) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        sqlx::query("DELETE FROM compute_instances WHERE id = $1")
            .bind(slot.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        let sql = format!(
            "INSERT INTO compute_instances ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            INSTANCE_COLUMNS
        );
        bind_instance(sqlx::query(&sql), instance)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(())
    }
}

fn bind_instance<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    instance: &'q ComputeInstance,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(instance.id.as_str())
        .bind(instance.state.as_str())
        .bind(instance.host.as_deref())
        .bind(instance.port.map(i32::from))
        .bind(instance.current_job_id.as_ref().map(|j| j.as_str()))
        .bind(instance.gpu_name.as_deref())
        .bind(instance.cost_per_hour)
        .bind(instance.error.as_deref())
        .bind(instance.last_activity_at)
        .bind(instance.created_at)
        .bind(instance.updated_at)
}
