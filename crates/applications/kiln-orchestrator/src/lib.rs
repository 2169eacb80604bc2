//! # SpriteKiln Orchestrator
//!
//! Job lifecycle orchestration for game-art generation on rented GPUs.
//!
//! ## Architecture
//!
//! ```text
//!  HTTP / CLI ──► Orchestrator ──► Ledger ──────────► LedgerStore
//!                    │    │
//!                    │    └──────► JobStore (compare-and-set)
//!                    ▼
//!            ComputeProvider ─┬─► marketplace queue (cookie auth)
//!                             ├─► serverless endpoint (bearer, webhooks)
//!                             └─► self-hosted ──► InstancePool ──► SpotMarket
//! ```
//!
//! Every job is paid for before it is submitted and refunded exactly once if
//! it fails. Poll, webhook and sweep race freely; compare-and-set on the job
//! row picks a single winner for each transition.
//!
//! ## Retry-or-fail
//!
//! Lost targets, transient provider errors and blown time budgets requeue the
//! job with a fresh attempt, up to `max_retries` times. After that the job
//! fails and its reservation is returned.
//!
//! See [`orchestrator`] and [`pool`] for details.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assembly;
pub mod blob_store;
pub mod comfy;
pub mod error;
pub mod http;
pub mod ledger;
pub mod logging;
pub mod marketplace;
pub mod memory_store;
pub mod orchestrator;
pub mod pg_store;
pub mod poll;
pub mod pool;
pub mod progress;
pub mod routing;
pub mod selfhosted;
pub mod serverless;
pub mod vast;
pub mod webhook;

#[cfg(test)]
mod testing;

// ============================================================================
// Public exports - Lifecycle
// ============================================================================

// Error handling
pub use error::{OrchestratorError, Result};

// Orchestration
pub use orchestrator::{
    CancelOutcome, CreateOutcome, JobSnapshot, Orchestrator, OrchestratorConfig, SweepReport,
    WebhookAck, CANCELLED_BY_USER, SUBMIT_FAILED,
};

// Requests, routing and pricing
pub use routing::{CreateJobRequest, Pricing, RoutingTable};

// Token accounting
pub use ledger::{Ledger, DEFAULT_GUEST_MAX_GENERATIONS};

// Worker callbacks
pub use webhook::{WebhookPayload, WebhookStatus, WebhookVerifier, SIGNATURE_HEADER};

// Result hosting
pub use assembly::Assembler;

// ============================================================================
// Public exports - Compute
// ============================================================================

// Provider adapters
pub use marketplace::{MarketplaceConfig, MarketplaceProvider};
pub use selfhosted::SelfHostedProvider;
pub use serverless::{ServerlessConfig, ServerlessProvider};

// Instance pool
pub use pool::{Acquisition, CleanupReport, InstancePool, PoolConfig, SyncReport};
pub use vast::{VastClient, VastConfig};

// Bounded polling
pub use poll::{poll_until, PollOutcome, PollPolicy};

// ============================================================================
// Public exports - Storage
// ============================================================================

pub use blob_store::{BlobStoreConfig, HttpBlobStore};
pub use memory_store::{MemoryObjectStorage, MemoryStore};
pub use pg_store::PgStore;

// HTTP surface
pub use http::{router, AppState};
