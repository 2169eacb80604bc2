//! Token ledger
//!
//! Every balance mutation goes through [`Ledger`]. The store performs each
//! change as one atomic statement; the ledger adds the owner rules on top:
//!
//! - users pay in tokens, bonus tokens first
//! - guests pay nothing but consume a capped generation counter
//! - a refund returns exactly the split recorded at reservation

use crate::error::{OrchestratorError, Result};
use kiln_core::{Balance, LedgerStore, OwnerRef, TokenSplit};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default free generations per guest session
pub const DEFAULT_GUEST_MAX_GENERATIONS: u32 = 3;

/// Reservation and settlement of token balances
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    guest_max_generations: u32,
}

impl Ledger {
    /// Create a ledger over a store
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            guest_max_generations: DEFAULT_GUEST_MAX_GENERATIONS,
        }
    }

    /// Set the guest generation cap
    pub fn with_guest_max_generations(mut self, max: u32) -> Self {
        self.guest_max_generations = max;
        self
    }

    /// Guest generation cap
    pub fn guest_max_generations(&self) -> u32 {
        self.guest_max_generations
    }

    /// Debit `amount` from a user, bonus first. Guests are never charged.
    pub async fn reserve(&self, owner: &OwnerRef, amount: i64) -> Result<TokenSplit> {
        let user_id = match owner {
            OwnerRef::Guest(_) => return Ok(TokenSplit::zero()),
            OwnerRef::User(id) => id,
        };
        if amount < 0 {
            return Err(OrchestratorError::validation("cost cannot be negative"));
        }
        if amount == 0 {
            return Ok(TokenSplit::zero());
        }

        match self.store.try_debit(user_id, amount).await? {
            Some(split) => {
                debug!(
                    user_id = %user_id,
                    regular = split.regular,
                    bonus = split.bonus,
                    "Reserved tokens"
                );
                Ok(split)
            }
            None => {
                let available = self
                    .store
                    .balance(user_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::not_found(format!("user {}", user_id)))?
                    .total();
                Err(OrchestratorError::InsufficientBalance {
                    required: amount,
                    available,
                })
            }
        }
    }

    /// Return exactly `split` to the owner's sub-balances
    pub async fn refund(&self, owner: &OwnerRef, split: TokenSplit) -> Result<()> {
        let Some(user_id) = owner.user_id() else {
            return Ok(());
        };
        if split.is_zero() {
            return Ok(());
        }
        self.store.credit(user_id, split).await?;
        info!(
            user_id = %user_id,
            regular = split.regular,
            bonus = split.bonus,
            "Refunded tokens"
        );
        Ok(())
    }

    /// Add bonus tokens (payment completion)
    pub async fn grant(&self, user_id: &str, amount: i64) -> Result<()> {
        if amount <= 0 {
            return Err(OrchestratorError::validation("grant must be positive"));
        }
        self.store.grant_bonus(user_id, amount).await?;
        info!(user_id = %user_id, amount, "Granted bonus tokens");
        Ok(())
    }

    /// Current balances of a user
    pub async fn balance(&self, user_id: &str) -> Result<Balance> {
        self.store
            .balance(user_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("user {}", user_id)))
    }

    /// Count one free generation for a guest. Returns how many remain.
    pub async fn consume_guest_generation(&self, session_id: &str) -> Result<u32> {
        self.store
            .consume_guest_generation(session_id, self.guest_max_generations)
            .await?
            .ok_or(OrchestratorError::GuestLimitReached {
                max: self.guest_max_generations,
            })
    }

    /// Give back a guest generation after a failed submission
    pub async fn restore_guest_generation(&self, session_id: &str) {
        if let Err(e) = self.store.restore_guest_generation(session_id).await {
            warn!(session_id = %session_id, error = %e, "Failed to restore guest generation");
        }
    }

    /// Free generations left for a guest
    pub async fn guest_generations_remaining(&self, session_id: &str) -> Result<u32> {
        let used = self.store.guest_generations_used(session_id).await?;
        Ok(self.guest_max_generations.saturating_sub(used))
    }
}
