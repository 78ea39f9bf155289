//! Manual verification adapter.
//!
//! Turns an admin's approval of a [`VerificationRequest`] into the same
//! [`PaymentEvent`] the webhook produces and hands it to the one settlement
//! engine, so manual and automated payments can never compute different
//! outcomes.

use std::sync::Arc;

use tracing::{error, info};

use crate::engine::{SettlementEngine, SettlementResult};
use crate::errors::SettlementError;
use crate::idempotency::IdempotencyGuard;
use crate::models::{
    NewReconciliationItem, PaymentEvent, PaymentKind, ReconciliationKind, RequestStatus,
    SettlementSource, VerificationRequest,
};
use crate::store::LedgerStore;

#[derive(Clone)]
pub struct ManualVerifier {
    store: Arc<dyn LedgerStore>,
    guard: IdempotencyGuard,
    engine: SettlementEngine,
}

impl ManualVerifier {
    pub fn new(store: Arc<dyn LedgerStore>, engine: SettlementEngine) -> Self {
        Self {
            guard: IdempotencyGuard::new(store.clone()),
            store,
            engine,
        }
    }

    /// Approve a pending request and settle it.
    ///
    /// The request is marked approved before settlement runs, so it is never
    /// settled twice. A store fault after that point cannot be retried through
    /// this call and is recorded as an `approval_unsettled` reconciliation item.
    pub async fn approve(&self, request_id: &str) -> SettlementResult {
        let request = self
            .store
            .get_verification_request(request_id)
            .await?
            .ok_or_else(|| SettlementError::RequestNotFound(request_id.to_string()))?;

        if request.status != RequestStatus::Pending {
            return Err(SettlementError::AlreadyProcessed(request.id));
        }

        let event = to_payment_event(&request)?;

        // Conditional flip: of two racing approvals only one gets `true`.
        if !self.store.mark_request_approved(&request.id).await? {
            return Err(SettlementError::AlreadyProcessed(request.id));
        }
        info!(
            request_id = %request.id,
            user_id = %request.user_id,
            kind = request.kind.as_str(),
            "Verification request approved"
        );

        let outcome = match self.guard.already_settled(&event.provider_ref).await {
            Ok(true) => return Err(SettlementError::DuplicateEvent(event.provider_ref)),
            Ok(false) => self.engine.settle(&event).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            if e.is_retryable() {
                self.record_unsettled(&request, e).await;
            }
        }
        outcome
    }

    async fn record_unsettled(&self, request: &VerificationRequest, cause: &SettlementError) {
        let item = NewReconciliationItem {
            kind: ReconciliationKind::ApprovalUnsettled,
            user_id: request.user_id.clone(),
            project_id: request.project_id.clone(),
            provider_ref: Some(request.id.clone()),
            detail: format!(
                "request {} approved for {} {}, settlement failed: {cause}",
                request.id,
                request.kind.as_str(),
                request.amount
            ),
        };
        error!(
            request_id = %request.id,
            user_id = %request.user_id,
            "Approved request left unsettled: {cause}"
        );
        if let Err(e) = self.store.append_reconciliation(item).await {
            error!("Failed to record reconciliation item: {e}");
        }
    }
}

/// Build the settlement event for a manual claim.
///
/// There is no provider reference for a manual payment, so the request's own
/// id stands in as the idempotency key.
fn to_payment_event(request: &VerificationRequest) -> Result<PaymentEvent, SettlementError> {
    if request.kind == PaymentKind::Investment && request.project_id.is_none() {
        return Err(SettlementError::InvalidRequest(format!(
            "investment request {} has no project id",
            request.id
        )));
    }
    Ok(PaymentEvent {
        user_id: request.user_id.clone(),
        kind: request.kind,
        amount: request.amount,
        provider_ref: request.id.clone(),
        project_id: request.project_id.clone(),
        source: SettlementSource::Manual,
    })
}
