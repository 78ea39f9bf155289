//! Duplicate-delivery screening keyed by the provider reference.
//!
//! The guard is the cheap first line. The unique index on
//! `transactions.provider_ref` is the second: the provider-referenced append
//! is the first mutation of every settlement, so a duplicate that slips past
//! the lookup still stops before any side effect.

use std::sync::Arc;

use tracing::info;

use crate::store::{LedgerStore, StoreResult};

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn LedgerStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// `true` if a completed transaction already carries `provider_ref`.
    pub async fn already_settled(&self, provider_ref: &str) -> StoreResult<bool> {
        let existing = self.store.find_completed_transaction(provider_ref).await?;
        if let Some(tx) = &existing {
            info!(
                provider_ref,
                transaction_id = tx.id,
                "Duplicate delivery for an already settled event"
            );
        }
        Ok(existing.is_some())
    }
}
