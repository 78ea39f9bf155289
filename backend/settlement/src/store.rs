//! The narrow ledger contract the settlement core needs from its store.
//!
//! Implementations must give single-document atomicity for every write and
//! compare-and-set semantics for [`LedgerStore::compare_and_set_project`]:
//! two writers racing on the same project must never both succeed against
//! the same expected state.

use async_trait::async_trait;

use crate::errors::SettlementError;
use crate::models::{
    NewInvestment, NewReconciliationItem, NewTransaction, Project, ReconciliationItem, SlotState,
    TransactionRecord, User, VerificationRequest,
};

pub type StoreResult<T> = std::result::Result<T, SettlementError>;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_user(&self, user_id: &str) -> StoreResult<Option<User>>;

    /// Set `is_active = true`. Re-applying is a no-op.
    async fn activate_user(&self, user_id: &str) -> StoreResult<()>;

    /// Atomically add `amount` to the user's wallet.
    async fn credit_wallet(&self, user_id: &str, amount: i64) -> StoreResult<()>;

    async fn get_project(&self, project_id: &str) -> StoreResult<Option<Project>>;

    /// Write `next` only if the project still holds `expected`.
    ///
    /// Returns `false` when another writer got there first.
    async fn compare_and_set_project(
        &self,
        project_id: &str,
        expected: SlotState,
        next: SlotState,
    ) -> StoreResult<bool>;

    /// Append a completed ledger entry.
    ///
    /// Fails with [`SettlementError::DuplicateEvent`] if `provider_ref` was
    /// already used.
    async fn append_transaction(&self, tx: NewTransaction) -> StoreResult<i64>;

    async fn append_investment(&self, investment: NewInvestment) -> StoreResult<i64>;

    /// Look up a completed transaction by its provider reference.
    async fn find_completed_transaction(
        &self,
        provider_ref: &str,
    ) -> StoreResult<Option<TransactionRecord>>;

    async fn get_verification_request(
        &self,
        request_id: &str,
    ) -> StoreResult<Option<VerificationRequest>>;

    /// Flip a request from `pending` to `approved`.
    ///
    /// Returns `false` if it was not pending (missing or already approved).
    async fn mark_request_approved(&self, request_id: &str) -> StoreResult<bool>;

    async fn append_reconciliation(&self, item: NewReconciliationItem) -> StoreResult<i64>;

    /// Newest first.
    async fn list_reconciliation(&self, limit: i64) -> StoreResult<Vec<ReconciliationItem>>;
}
