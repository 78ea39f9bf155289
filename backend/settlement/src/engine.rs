//! Settlement engine. Turns one verified, de-duplicated [`PaymentEvent`]
//! into ledger mutations.
//!
//! ## Procedures
//!
//! | Kind         | Writes, in order                                            |
//! |--------------|-------------------------------------------------------------|
//! | `reg_fee`    | fee transaction → activation → referral credit + transaction |
//! | `investment` | purchase transaction → investment → project slot update      |
//!
//! The provider-referenced transaction is always the first write, so a
//! duplicate delivery that races past the idempotency guard is stopped by the
//! store's uniqueness check before anything else changes.
//!
//! ## Partial completion
//!
//! Writes after the first are not rolled back. When one fails the engine
//! appends a [`ReconciliationItem`](crate::models::ReconciliationItem) and
//! carries on or reports, depending on whether the failed write is
//! authoritative (activation, slot count) or best-effort (referral bonus).

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::SettlementConfig;
use crate::errors::SettlementError;
use crate::models::{
    NewInvestment, NewReconciliationItem, NewTransaction, PaymentEvent, PaymentKind,
    ProjectStatus, ReconciliationKind, SettlementReceipt, SlotState, TransactionKind, User,
};
use crate::slots::{self, SlotPlan};
use crate::store::LedgerStore;

pub type SettlementResult = std::result::Result<SettlementReceipt, SettlementError>;

/// Slots actually applied by the project update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotCredit {
    slots: i64,
    status: ProjectStatus,
}

#[derive(Clone)]
pub struct SettlementEngine {
    store: Arc<dyn LedgerStore>,
    config: SettlementConfig,
}

impl SettlementEngine {
    pub fn new(store: Arc<dyn LedgerStore>, config: SettlementConfig) -> Self {
        Self { store, config }
    }

    /// Apply the settlement procedure matching `event.kind`.
    pub async fn settle(&self, event: &PaymentEvent) -> SettlementResult {
        debug!(
            provider_ref = %event.provider_ref,
            user_id = %event.user_id,
            kind = event.kind.as_str(),
            amount = event.amount,
            "Settling payment event"
        );
        match event.kind {
            PaymentKind::RegFee => self.settle_activation(event).await,
            PaymentKind::Investment => self.settle_investment(event).await,
        }
    }

    // ─────────────────────────────────────────────────────────
    // Activation
    // ─────────────────────────────────────────────────────────

    async fn settle_activation(&self, event: &PaymentEvent) -> SettlementResult {
        let fee = self.config.registration_fee;
        if event.amount < fee {
            warn!(
                user_id = %event.user_id,
                received = event.amount,
                expected = fee,
                "Registration fee amount mismatch"
            );
            return Err(SettlementError::AmountMismatch {
                received: event.amount,
                expected: fee,
            });
        }

        let user = self
            .store
            .get_user(&event.user_id)
            .await?
            .ok_or_else(|| SettlementError::UserNotFound(event.user_id.clone()))?;

        self.store
            .append_transaction(NewTransaction {
                user_id: user.id.clone(),
                kind: TransactionKind::RegFee,
                amount: fee,
                provider_ref: Some(event.provider_ref.clone()),
                referred_user_id: None,
                project_id: None,
                slots: None,
                method: event.source,
            })
            .await?;

        if let Err(e) = self.store.activate_user(&user.id).await {
            self.reconcile(NewReconciliationItem {
                kind: ReconciliationKind::ActivationFailed,
                user_id: user.id.clone(),
                project_id: None,
                provider_ref: Some(event.provider_ref.clone()),
                detail: format!("fee recorded, activation failed: {e}"),
            })
            .await;
            return Err(e);
        }
        info!(user_id = %user.id, provider_ref = %event.provider_ref, "User activated");

        let referral_paid = match user.referrer_id.as_deref() {
            None => false,
            Some(referrer_id) => match self.pay_referral_bonus(referrer_id, &user, event).await {
                Ok(paid) => paid,
                Err(e) => {
                    self.reconcile(NewReconciliationItem {
                        kind: ReconciliationKind::ReferralBonusFailed,
                        user_id: referrer_id.to_string(),
                        project_id: None,
                        provider_ref: Some(event.provider_ref.clone()),
                        detail: format!(
                            "bonus of {} for referring {} not settled: {e}",
                            self.config.referral_bonus, user.id
                        ),
                    })
                    .await;
                    false
                }
            },
        };

        Ok(SettlementReceipt::Activated {
            user_id: user.id,
            referral_paid,
        })
    }

    /// Credit the referrer if they exist and are active right now.
    ///
    /// `Ok(false)` means the referral was legitimately skipped.
    async fn pay_referral_bonus(
        &self,
        referrer_id: &str,
        referred: &User,
        event: &PaymentEvent,
    ) -> Result<bool, SettlementError> {
        if referrer_id == referred.id {
            warn!(user_id = %referred.id, "Self-referral ignored");
            return Ok(false);
        }

        let eligible = matches!(
            self.store.get_user(referrer_id).await?,
            Some(User { is_active: true, .. })
        );
        if !eligible {
            warn!(
                referrer_id,
                user_id = %referred.id,
                "Referrer does not exist or is not active. Bonus skipped."
            );
            return Ok(false);
        }

        let bonus = self.config.referral_bonus;
        self.store.credit_wallet(referrer_id, bonus).await?;
        self.store
            .append_transaction(NewTransaction {
                user_id: referrer_id.to_string(),
                kind: TransactionKind::ReferralBonus,
                amount: bonus,
                provider_ref: None,
                referred_user_id: Some(referred.id.clone()),
                project_id: None,
                slots: None,
                method: event.source,
            })
            .await?;

        info!(
            referrer_id,
            user_id = %referred.id,
            bonus,
            "Referral bonus paid"
        );
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────
    // Investment
    // ─────────────────────────────────────────────────────────

    async fn settle_investment(&self, event: &PaymentEvent) -> SettlementResult {
        let project_id = event.project_id.as_deref().ok_or_else(|| {
            SettlementError::InvalidRequest("investment event without a project id".to_string())
        })?;

        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| SettlementError::ProjectNotFound(project_id.to_string()))?;

        let plan = slots::plan_purchase(&project, event.amount).inspect_err(|e| {
            warn!(project_id, user_id = %event.user_id, amount = event.amount, "Investment rejected: {e}");
        })?;

        self.store
            .append_transaction(NewTransaction {
                user_id: event.user_id.clone(),
                kind: TransactionKind::SlotPurchase,
                amount: plan.amount_credited(),
                provider_ref: Some(event.provider_ref.clone()),
                referred_user_id: None,
                project_id: Some(project.id.clone()),
                slots: Some(plan.slots_to_credit),
                method: event.source,
            })
            .await?;

        if let Err(e) = self
            .store
            .append_investment(NewInvestment {
                user_id: event.user_id.clone(),
                project_id: project.id.clone(),
                amount: plan.amount_credited(),
                slots: plan.slots_to_credit,
                method: event.source,
            })
            .await
        {
            // The slots were paid for; keep going so the counter reflects it.
            self.reconcile(NewReconciliationItem {
                kind: ReconciliationKind::InvestmentRecordFailed,
                user_id: event.user_id.clone(),
                project_id: Some(project.id.clone()),
                provider_ref: Some(event.provider_ref.clone()),
                detail: format!("{} slot(s) purchased, investment record missing: {e}", plan.slots_to_credit),
            })
            .await;
        }

        let credit = match self.credit_slots(&project.id, &plan).await {
            Ok(credit) => credit,
            Err(e) => {
                self.reconcile(NewReconciliationItem {
                    kind: ReconciliationKind::SlotCreditFailed,
                    user_id: event.user_id.clone(),
                    project_id: Some(project.id.clone()),
                    provider_ref: Some(event.provider_ref.clone()),
                    detail: format!("{} slot(s) recorded but not credited: {e}", plan.slots_to_credit),
                })
                .await;
                return Err(e);
            }
        };

        if credit.slots < plan.slots_to_credit {
            self.reconcile(NewReconciliationItem {
                kind: ReconciliationKind::SlotShortfall,
                user_id: event.user_id.clone(),
                project_id: Some(project.id.clone()),
                provider_ref: Some(event.provider_ref.clone()),
                detail: format!(
                    "recorded {} slot(s), credited {} ({} owed back)",
                    plan.slots_to_credit,
                    credit.slots,
                    (plan.slots_to_credit - credit.slots) * plan.slot_price
                ),
            })
            .await;
        }

        // The purchase records stay; the rejection must not read as "nothing written".
        if credit.slots == 0 {
            return Err(SettlementError::CapacityLost {
                project_id: project.id,
                recorded_slots: plan.slots_to_credit,
            });
        }

        info!(
            user_id = %event.user_id,
            project_id = %project.id,
            slots_bought = plan.slots_bought,
            slots_credited = credit.slots,
            "Slots credited"
        );
        if credit.status == ProjectStatus::Building && project.status == ProjectStatus::Funding {
            info!(project_id = %project.id, "Project fully funded. Status changed to building.");
        }

        Ok(SettlementReceipt::Invested {
            project_id: project.id,
            slots_credited: credit.slots,
            amount_credited: credit.slots * plan.slot_price,
            project_status: credit.status,
        })
    }

    /// Optimistic read-modify-write of the project's slot state.
    ///
    /// Re-reads on every attempt and re-clamps to the capacity left at that
    /// moment, so concurrent buyers can never jointly overfill a project.
    async fn credit_slots(&self, project_id: &str, plan: &SlotPlan) -> Result<SlotCredit, SettlementError> {
        let max_attempts = self.config.project_txn_max_retries.saturating_add(1);

        for attempt in 1..=max_attempts {
            let current = self
                .store
                .get_project(project_id)
                .await?
                .ok_or_else(|| SettlementError::ProjectNotFound(project_id.to_string()))?;

            if current.status != ProjectStatus::Funding {
                return Ok(SlotCredit {
                    slots: 0,
                    status: current.status,
                });
            }

            let slots = plan.slots_to_credit.min(current.slots_remaining());
            if slots < 1 {
                return Ok(SlotCredit {
                    slots: 0,
                    status: current.status,
                });
            }

            let expected = SlotState::from(&current);
            let next = slots::advance(expected, current.total_slots, slots);
            debug_assert!(slots::is_valid_transition(expected.status, next.status));

            if self
                .store
                .compare_and_set_project(project_id, expected, next)
                .await?
            {
                return Ok(SlotCredit {
                    slots,
                    status: next.status,
                });
            }
            debug!(project_id, attempt, "Project update conflicted, retrying");
        }

        Err(SettlementError::StoreUnavailable(format!(
            "project {project_id} update conflicted {max_attempts} times"
        )))
    }

    async fn reconcile(&self, item: NewReconciliationItem) {
        error!(
            kind = ?item.kind,
            user_id = %item.user_id,
            project_id = ?item.project_id,
            provider_ref = ?item.provider_ref,
            "Reconciliation needed: {}",
            item.detail
        );
        if let Err(e) = self.store.append_reconciliation(item).await {
            error!("Failed to record reconciliation item: {e}");
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use sqlx::SqlitePool;

    use super::*;
    use crate::db::fixtures::*;
    use crate::db::SqliteStore;
    use crate::invariants;
    use crate::models::{
        Project, ReconciliationItem, SettlementSource, TransactionRecord, VerificationRequest,
    };
    use crate::store::StoreResult;

    /// Delegates to SQLite but can be told to fail specific operations.
    pub(crate) struct FlakyStore {
        inner: SqliteStore,
        pub fail_credit_wallet: AtomicBool,
        pub fail_activation: AtomicBool,
        pub always_conflict: AtomicBool,
        /// Fails the next `get_user` only.
        pub fail_get_user_once: AtomicBool,
        /// Milliseconds `activate_user` stalls before writing.
        pub activation_delay_ms: AtomicU64,
        /// Another buyer fills the project just before the next slot update.
        pub steal_capacity_once: AtomicBool,
    }

    impl FlakyStore {
        pub fn new(pool: SqlitePool) -> Self {
            Self {
                inner: SqliteStore::new(pool),
                fail_credit_wallet: AtomicBool::new(false),
                fail_activation: AtomicBool::new(false),
                always_conflict: AtomicBool::new(false),
                fail_get_user_once: AtomicBool::new(false),
                activation_delay_ms: AtomicU64::new(0),
                steal_capacity_once: AtomicBool::new(false),
            }
        }
    }

    fn down() -> SettlementError {
        SettlementError::StoreUnavailable("injected fault".into())
    }

    #[async_trait]
    impl LedgerStore for FlakyStore {
        async fn get_user(&self, user_id: &str) -> StoreResult<Option<User>> {
            if self.fail_get_user_once.swap(false, Ordering::SeqCst) {
                return Err(down());
            }
            self.inner.get_user(user_id).await
        }
        async fn activate_user(&self, user_id: &str) -> StoreResult<()> {
            let delay = self.activation_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail_activation.load(Ordering::SeqCst) {
                return Err(down());
            }
            self.inner.activate_user(user_id).await
        }
        async fn credit_wallet(&self, user_id: &str, amount: i64) -> StoreResult<()> {
            if self.fail_credit_wallet.load(Ordering::SeqCst) {
                return Err(down());
            }
            self.inner.credit_wallet(user_id, amount).await
        }
        async fn get_project(&self, project_id: &str) -> StoreResult<Option<Project>> {
            self.inner.get_project(project_id).await
        }
        async fn compare_and_set_project(
            &self,
            project_id: &str,
            expected: SlotState,
            next: SlotState,
        ) -> StoreResult<bool> {
            if self.always_conflict.load(Ordering::SeqCst) {
                return Ok(false);
            }
            if self.steal_capacity_once.swap(false, Ordering::SeqCst) {
                if let Some(p) = self.inner.get_project(project_id).await? {
                    let full = SlotState {
                        filled_slots: p.total_slots,
                        status: ProjectStatus::Building,
                    };
                    self.inner
                        .compare_and_set_project(project_id, SlotState::from(&p), full)
                        .await?;
                }
                return Ok(false);
            }
            self.inner.compare_and_set_project(project_id, expected, next).await
        }
        async fn append_transaction(&self, tx: NewTransaction) -> StoreResult<i64> {
            self.inner.append_transaction(tx).await
        }
        async fn append_investment(&self, investment: NewInvestment) -> StoreResult<i64> {
            self.inner.append_investment(investment).await
        }
        async fn find_completed_transaction(
            &self,
            provider_ref: &str,
        ) -> StoreResult<Option<TransactionRecord>> {
            self.inner.find_completed_transaction(provider_ref).await
        }
        async fn get_verification_request(
            &self,
            request_id: &str,
        ) -> StoreResult<Option<VerificationRequest>> {
            self.inner.get_verification_request(request_id).await
        }
        async fn mark_request_approved(&self, request_id: &str) -> StoreResult<bool> {
            self.inner.mark_request_approved(request_id).await
        }
        async fn append_reconciliation(&self, item: NewReconciliationItem) -> StoreResult<i64> {
            self.inner.append_reconciliation(item).await
        }
        async fn list_reconciliation(&self, limit: i64) -> StoreResult<Vec<ReconciliationItem>> {
            self.inner.list_reconciliation(limit).await
        }
    }

    pub(crate) fn engine_for(pool: &SqlitePool) -> SettlementEngine {
        SettlementEngine::new(
            Arc::new(SqliteStore::new(pool.clone())),
            SettlementConfig::default(),
        )
    }

    fn reg_fee(user: &str, amount: i64, provider_ref: &str) -> PaymentEvent {
        PaymentEvent {
            user_id: user.into(),
            kind: PaymentKind::RegFee,
            amount,
            provider_ref: provider_ref.into(),
            project_id: None,
            source: SettlementSource::Webhook,
        }
    }

    fn invest(user: &str, project: &str, amount: i64, provider_ref: &str) -> PaymentEvent {
        PaymentEvent {
            user_id: user.into(),
            kind: PaymentKind::Investment,
            amount,
            provider_ref: provider_ref.into(),
            project_id: Some(project.into()),
            source: SettlementSource::Webhook,
        }
    }

    // ── Activation ──────────────────────────────────────────

    #[tokio::test]
    async fn activation_pays_active_referrer() {
        let pool = memory_pool().await;
        insert_user(&pool, "R1", true, None).await;
        insert_user(&pool, "U1", false, Some("R1")).await;
        let engine = engine_for(&pool);

        let receipt = engine.settle(&reg_fee("U1", 20_000, "ca_U1_1")).await.unwrap();

        assert_eq!(
            receipt,
            SettlementReceipt::Activated {
                user_id: "U1".into(),
                referral_paid: true
            }
        );
        assert_eq!(user(&pool, "U1").await, (true, 0));
        assert_eq!(user(&pool, "R1").await, (true, 4_000));
        assert_eq!(
            transactions(&pool).await,
            vec![
                ("reg_fee".to_string(), "U1".to_string(), 20_000),
                ("referral_bonus".to_string(), "R1".to_string(), 4_000),
            ]
        );
    }

    #[tokio::test]
    async fn activation_skips_inactive_referrer() {
        let pool = memory_pool().await;
        insert_user(&pool, "R1", false, None).await;
        insert_user(&pool, "U1", false, Some("R1")).await;
        let engine = engine_for(&pool);

        let receipt = engine.settle(&reg_fee("U1", 20_000, "ref")).await.unwrap();

        assert!(matches!(
            receipt,
            SettlementReceipt::Activated {
                referral_paid: false,
                ..
            }
        ));
        assert_eq!(user(&pool, "U1").await, (true, 0));
        assert_eq!(user(&pool, "R1").await, (false, 0));
        assert_eq!(count(&pool, "transactions").await, 1);
        assert_eq!(count(&pool, "reconciliation_items").await, 0);
    }

    #[tokio::test]
    async fn activation_skips_missing_referrer() {
        let pool = memory_pool().await;
        insert_user(&pool, "U1", false, Some("ghost")).await;
        let engine = engine_for(&pool);

        engine.settle(&reg_fee("U1", 20_000, "ref")).await.unwrap();

        assert_eq!(user(&pool, "U1").await, (true, 0));
        assert_eq!(transactions(&pool).await.len(), 1);
    }

    #[tokio::test]
    async fn activation_without_referrer() {
        let pool = memory_pool().await;
        insert_user(&pool, "U1", false, None).await;
        let engine = engine_for(&pool);

        let receipt = engine.settle(&reg_fee("U1", 25_000, "ref")).await.unwrap();

        assert!(matches!(
            receipt,
            SettlementReceipt::Activated {
                referral_paid: false,
                ..
            }
        ));
        // The ledger records the fee owed, not the overpayment.
        assert_eq!(
            transactions(&pool).await,
            vec![("reg_fee".to_string(), "U1".to_string(), 20_000)]
        );
    }

    #[tokio::test]
    async fn underpaid_fee_rejected_without_mutation() {
        let pool = memory_pool().await;
        insert_user(&pool, "R1", true, None).await;
        insert_user(&pool, "U1", false, Some("R1")).await;
        let engine = engine_for(&pool);

        let err = engine
            .settle(&reg_fee("U1", 19_999, "ref"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SettlementError::AmountMismatch {
                received: 19_999,
                expected: 20_000
            }
        ));
        assert_eq!(user(&pool, "U1").await, (false, 0));
        assert_eq!(user(&pool, "R1").await, (true, 0));
        assert_eq!(count(&pool, "transactions").await, 0);
    }

    #[tokio::test]
    async fn unknown_user_rejected_without_mutation() {
        let pool = memory_pool().await;
        let engine = engine_for(&pool);

        let err = engine
            .settle(&reg_fee("nobody", 20_000, "ref"))
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::UserNotFound(_)));
        assert_eq!(count(&pool, "transactions").await, 0);
    }

    #[tokio::test]
    async fn self_referral_pays_nothing() {
        let pool = memory_pool().await;
        insert_user(&pool, "U1", false, Some("U1")).await;
        let engine = engine_for(&pool);

        engine.settle(&reg_fee("U1", 20_000, "ref")).await.unwrap();

        assert_eq!(user(&pool, "U1").await, (true, 0));
        assert_eq!(count(&pool, "transactions").await, 1);
    }

    #[tokio::test]
    async fn referral_failure_keeps_activation_and_logs_reconciliation() {
        let pool = memory_pool().await;
        insert_user(&pool, "R1", true, None).await;
        insert_user(&pool, "U1", false, Some("R1")).await;
        let store = Arc::new(FlakyStore::new(pool.clone()));
        store.fail_credit_wallet.store(true, Ordering::SeqCst);
        let engine = SettlementEngine::new(store.clone(), SettlementConfig::default());

        let receipt = engine.settle(&reg_fee("U1", 20_000, "ref")).await.unwrap();

        assert!(matches!(
            receipt,
            SettlementReceipt::Activated {
                referral_paid: false,
                ..
            }
        ));
        assert_eq!(user(&pool, "U1").await, (true, 0));
        assert_eq!(user(&pool, "R1").await, (true, 0));

        let items = store.list_reconciliation(10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, ReconciliationKind::ReferralBonusFailed);
        assert_eq!(items[0].user_id, "R1");
        assert_eq!(items[0].provider_ref.as_deref(), Some("ref"));
    }

    #[tokio::test]
    async fn activation_failure_is_retryable_and_reconciled() {
        let pool = memory_pool().await;
        insert_user(&pool, "U1", false, None).await;
        let store = Arc::new(FlakyStore::new(pool.clone()));
        store.fail_activation.store(true, Ordering::SeqCst);
        let engine = SettlementEngine::new(store.clone(), SettlementConfig::default());

        let err = engine
            .settle(&reg_fee("U1", 20_000, "ref"))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        let items = store.list_reconciliation(10).await.unwrap();
        assert_eq!(items[0].kind, ReconciliationKind::ActivationFailed);
    }

    #[tokio::test]
    async fn duplicate_reference_settles_once() {
        let pool = memory_pool().await;
        insert_user(&pool, "R1", true, None).await;
        insert_user(&pool, "U1", false, Some("R1")).await;
        let engine = engine_for(&pool);

        engine.settle(&reg_fee("U1", 20_000, "dup")).await.unwrap();
        let err = engine
            .settle(&reg_fee("U1", 20_000, "dup"))
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::DuplicateEvent(_)));
        assert_eq!(user(&pool, "R1").await, (true, 4_000));
        assert_eq!(count(&pool, "transactions").await, 2);
    }

    #[tokio::test]
    async fn configured_amounts_are_honoured() {
        let pool = memory_pool().await;
        insert_user(&pool, "R1", true, None).await;
        insert_user(&pool, "U1", false, Some("R1")).await;
        let engine = SettlementEngine::new(
            Arc::new(SqliteStore::new(pool.clone())),
            SettlementConfig {
                registration_fee: 5_000,
                referral_bonus: 750,
                project_txn_max_retries: 5,
            },
        );

        engine.settle(&reg_fee("U1", 5_000, "ref")).await.unwrap();
        assert_eq!(user(&pool, "R1").await, (true, 750));
    }

    // ── Investment ──────────────────────────────────────────

    #[tokio::test]
    async fn last_slot_moves_project_to_building() {
        let pool = memory_pool().await;
        insert_project(&pool, "P1", 50_000, 10, 9, ProjectStatus::Funding).await;
        let engine = engine_for(&pool);

        let receipt = engine
            .settle(&invest("U1", "P1", 50_000, "inv-1"))
            .await
            .unwrap();

        assert_eq!(
            receipt,
            SettlementReceipt::Invested {
                project_id: "P1".into(),
                slots_credited: 1,
                amount_credited: 50_000,
                project_status: ProjectStatus::Building,
            }
        );
        let p = project(&pool, "P1").await;
        assert_eq!(p.filled_slots, 10);
        assert_eq!(p.status, ProjectStatus::Building);
        invariants::assert_all_project_invariants(&p);
        invariants::assert_valid_status_transition(ProjectStatus::Funding, p.status);
        assert_eq!(count(&pool, "investments").await, 1);
        assert_eq!(
            transactions(&pool).await,
            vec![("slot_purchase".to_string(), "U1".to_string(), 50_000)]
        );
    }

    #[tokio::test]
    async fn overpayment_credits_only_remaining_capacity() {
        let pool = memory_pool().await;
        insert_project(&pool, "P1", 50_000, 10, 9, ProjectStatus::Funding).await;
        let engine = engine_for(&pool);

        let receipt = engine
            .settle(&invest("U1", "P1", 150_000, "inv-1"))
            .await
            .unwrap();

        assert!(matches!(
            receipt,
            SettlementReceipt::Invested {
                slots_credited: 1,
                amount_credited: 50_000,
                ..
            }
        ));
        let p = project(&pool, "P1").await;
        assert_eq!(p.filled_slots, 10);
        assert_eq!(p.status, ProjectStatus::Building);
        assert_eq!(
            transactions(&pool).await,
            vec![("slot_purchase".to_string(), "U1".to_string(), 50_000)]
        );
        let (amount,): (i64,) = sqlx::query_as("SELECT amount FROM investments")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(amount, 50_000);
    }

    #[tokio::test]
    async fn multi_slot_purchase_stays_funding() {
        let pool = memory_pool().await;
        insert_project(&pool, "P1", 10_000, 10, 2, ProjectStatus::Funding).await;
        let engine = engine_for(&pool);

        engine
            .settle(&invest("U1", "P1", 35_000, "inv-1"))
            .await
            .unwrap();

        let p = project(&pool, "P1").await;
        assert_eq!(p.filled_slots, 5);
        assert_eq!(p.status, ProjectStatus::Funding);
    }

    #[tokio::test]
    async fn building_project_rejected_without_mutation() {
        let pool = memory_pool().await;
        insert_project(&pool, "P1", 50_000, 10, 10, ProjectStatus::Building).await;
        let engine = engine_for(&pool);

        let err = engine
            .settle(&invest("U1", "P1", 50_000, "inv-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::ProjectNotFunding { .. }));
        assert_eq!(count(&pool, "transactions").await, 0);
        assert_eq!(count(&pool, "investments").await, 0);
        assert_eq!(project(&pool, "P1").await.filled_slots, 10);
    }

    #[tokio::test]
    async fn investment_rejections() {
        let pool = memory_pool().await;
        insert_project(&pool, "P1", 50_000, 10, 0, ProjectStatus::Funding).await;
        insert_project(&pool, "FULL", 50_000, 10, 10, ProjectStatus::Funding).await;
        let engine = engine_for(&pool);

        let err = engine.settle(&invest("U1", "nope", 50_000, "a")).await.unwrap_err();
        assert!(matches!(err, SettlementError::ProjectNotFound(_)));

        let err = engine.settle(&invest("U1", "P1", 49_999, "b")).await.unwrap_err();
        assert!(matches!(err, SettlementError::BelowSlotPrice { .. }));

        let err = engine.settle(&invest("U1", "FULL", 50_000, "c")).await.unwrap_err();
        assert!(matches!(err, SettlementError::ProjectFull(_)));

        let mut missing = invest("U1", "P1", 50_000, "d");
        missing.project_id = None;
        let err = engine.settle(&missing).await.unwrap_err();
        assert!(matches!(err, SettlementError::InvalidRequest(_)));

        assert_eq!(count(&pool, "transactions").await, 0);
    }

    #[tokio::test]
    async fn conflict_exhaustion_is_transient_and_reconciled() {
        let pool = memory_pool().await;
        insert_project(&pool, "P1", 50_000, 10, 0, ProjectStatus::Funding).await;
        let store = Arc::new(FlakyStore::new(pool.clone()));
        store.always_conflict.store(true, Ordering::SeqCst);
        let engine = SettlementEngine::new(store.clone(), SettlementConfig::default());

        let err = engine
            .settle(&invest("U1", "P1", 50_000, "inv-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::StoreUnavailable(_)));
        assert_eq!(project(&pool, "P1").await.filled_slots, 0);
        let items = store.list_reconciliation(10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, ReconciliationKind::SlotCreditFailed);
    }

    #[tokio::test]
    async fn capacity_lost_after_records_written_is_reported_distinctly() {
        let pool = memory_pool().await;
        insert_project(&pool, "P1", 50_000, 10, 8, ProjectStatus::Funding).await;
        let store = Arc::new(FlakyStore::new(pool.clone()));
        store.steal_capacity_once.store(true, Ordering::SeqCst);
        let engine = SettlementEngine::new(store.clone(), SettlementConfig::default());

        let err = engine
            .settle(&invest("U1", "P1", 100_000, "inv-late"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SettlementError::CapacityLost { recorded_slots: 2, .. }
        ));
        assert_eq!(err.reason(), "capacity_lost");
        assert!(!err.is_retryable());

        let p = project(&pool, "P1").await;
        assert_eq!(p.filled_slots, 10);
        invariants::assert_all_project_invariants(&p);
        assert_eq!(count(&pool, "investments").await, 1);
        assert_eq!(
            transactions(&pool).await,
            vec![("slot_purchase".to_string(), "U1".to_string(), 100_000)]
        );
        let items = store.list_reconciliation(10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, ReconciliationKind::SlotShortfall);
        assert_eq!(items[0].provider_ref.as_deref(), Some("inv-late"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_buyers_never_overfill() {
        let pool = memory_pool().await;
        insert_project(&pool, "P1", 1_000, 10, 0, ProjectStatus::Funding).await;
        let engine = Arc::new(SettlementEngine::new(
            Arc::new(SqliteStore::new(pool.clone())),
            SettlementConfig {
                project_txn_max_retries: 1_000,
                ..SettlementConfig::default()
            },
        ));

        let mut handles = Vec::new();
        for i in 0..16 {
            let engine = engine.clone();
            // Mix of one-, two- and three-slot purchases.
            let amount = 1_000 * (1 + i % 3);
            handles.push(tokio::spawn(async move {
                engine
                    .settle(&invest(&format!("U{i}"), "P1", amount, &format!("inv-{i}")))
                    .await
            }));
        }

        let mut credited = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(SettlementReceipt::Invested { slots_credited, .. }) => credited += slots_credited,
                Ok(other) => panic!("unexpected receipt {other:?}"),
                Err(e) => assert!(
                    matches!(
                        e,
                        SettlementError::ProjectFull(_)
                            | SettlementError::ProjectNotFunding { .. }
                            | SettlementError::CapacityLost { .. }
                    ),
                    "unexpected error {e}"
                ),
            }
        }

        let p = project(&pool, "P1").await;
        invariants::assert_all_project_invariants(&p);
        assert_eq!(credited, p.filled_slots);
        assert_eq!(p.filled_slots, 10);
        assert_eq!(p.status, ProjectStatus::Building);
    }
}
