//! SpriteKiln Core - Shared types and traits
//!
//! This crate defines the abstractions the orchestrator works through:
//! - ComputeProvider trait (marketplace, serverless and self-hosted backends)
//! - JobStore / LedgerStore / InstanceStore traits (Postgres and in-memory)
//! - SpotMarket and ObjectStorage traits
//! - Job, instance and ledger types
//! - Error types

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
