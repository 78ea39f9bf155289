//! Axum HTTP handlers.
//!
//! ## Routes
//!
//! | Method | Path                                | Purpose                          |
//! |--------|-------------------------------------|----------------------------------|
//! | GET    | `/health`                           | liveness                         |
//! | POST   | `/webhooks/payments`                | provider payment notifications   |
//! | POST   | `/admin/verifications/:id/approve`  | manual payment approval          |
//! | GET    | `/admin/reconciliation`             | partial settlements to follow up |
//!
//! Webhook status codes tell the provider whether to redeliver: anything the
//! provider cannot fix by retrying is acknowledged, and only transient store
//! failures return `500`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::engine::{SettlementEngine, SettlementResult};
use crate::errors::SettlementError;
use crate::idempotency::IdempotencyGuard;
use crate::manual::ManualVerifier;
use crate::models::{ReconciliationItem, SettlementReceipt};
use crate::signature::{SignatureVerifier, SIGNATURE_HEADER};
use crate::store::LedgerStore;
use crate::webhook::{self, Decoded};

const DEFAULT_RECONCILIATION_LIMIT: i64 = 100;
const MAX_RECONCILIATION_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn LedgerStore>,
    pub guard: IdempotencyGuard,
    pub engine: SettlementEngine,
    pub manual: ManualVerifier,
    pub signature: SignatureVerifier,
    pub admin_token_digest: [u8; 32],
    pub settlement_timeout: Duration,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        engine: SettlementEngine,
        signature: SignatureVerifier,
        admin_api_token: &str,
        settlement_timeout: Duration,
    ) -> Self {
        Self {
            guard: IdempotencyGuard::new(store.clone()),
            manual: ManualVerifier::new(store.clone(), engine.clone()),
            store,
            engine,
            signature,
            admin_token_digest: Sha256::digest(admin_api_token.as_bytes()).into(),
            settlement_timeout,
        }
    }

    fn is_admin(&self, headers: &HeaderMap) -> bool {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|token| <[u8; 32]>::from(Sha256::digest(token.trim().as_bytes())) == self.admin_token_digest)
            .unwrap_or(false)
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/payments", post(payment_webhook))
        .route("/admin/verifications/:id/approve", post(approve_verification))
        .route("/admin/reconciliation", get(list_reconciliation))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<SettlementReceipt>,
}

impl WebhookAck {
    fn unprocessed() -> Self {
        Self {
            received: true,
            ..Self::default()
        }
    }
}

#[derive(Serialize)]
pub struct ApprovalResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<SettlementReceipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct ReconciliationResponse {
    pub count: usize,
    pub items: Vec<ReconciliationItem>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct ReconciliationQuery {
    pub limit: Option<i64>,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /webhooks/payments`
///
/// Signature first, then decoding, then the idempotency guard, then the
/// engine. The raw body is never parsed before the signature matches.
pub async fn payment_webhook(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !state.signature.verify(&body, signature) {
        warn!("Webhook signature verification failed");
        return ack(
            StatusCode::UNAUTHORIZED,
            WebhookAck {
                error: Some("invalid signature".to_string()),
                ..WebhookAck::unprocessed()
            },
        );
    }

    let event = match webhook::decode(&body) {
        Ok(Decoded::Event(event)) => event,
        Ok(Decoded::NotSuccessful(status)) => {
            info!(status = %status, "Ignoring non-successful payment notification");
            return ack(StatusCode::OK, WebhookAck::unprocessed());
        }
        Ok(Decoded::UnknownPaymentType(payment_type)) => {
            warn!(payment_type = %payment_type, "Unknown payment type");
            return ack(
                StatusCode::OK,
                WebhookAck {
                    reason: Some("unknown_payment_type"),
                    ..WebhookAck::unprocessed()
                },
            );
        }
        Err(e) => {
            warn!("Rejected webhook: {e}");
            return ack(
                StatusCode::BAD_REQUEST,
                WebhookAck {
                    error: Some(e.to_string()),
                    ..WebhookAck::unprocessed()
                },
            );
        }
    };

    let provider_ref = event.provider_ref.clone();
    let guard = state.guard.clone();
    let engine = state.engine.clone();
    let outcome = settle_detached(state.settlement_timeout, async move {
        if guard.already_settled(&event.provider_ref).await? {
            return Err(SettlementError::DuplicateEvent(event.provider_ref.clone()));
        }
        engine.settle(&event).await
    })
    .await;

    match outcome {
        Ok(receipt) => ack(
            StatusCode::OK,
            WebhookAck {
                processed: true,
                receipt: Some(receipt),
                ..WebhookAck::unprocessed()
            },
        ),
        Err(SettlementError::DuplicateEvent(_)) => {
            info!(provider_ref = %provider_ref, "Duplicate webhook acknowledged");
            ack(
                StatusCode::OK,
                WebhookAck {
                    duplicate: Some(true),
                    ..WebhookAck::unprocessed()
                },
            )
        }
        Err(e) if e.is_retryable() => {
            error!(provider_ref = %provider_ref, "Webhook processing failed, provider will retry: {e}");
            ack(
                StatusCode::INTERNAL_SERVER_ERROR,
                WebhookAck {
                    error: Some("processing failed".to_string()),
                    ..WebhookAck::unprocessed()
                },
            )
        }
        Err(e) => {
            warn!(provider_ref = %provider_ref, reason = e.reason(), "Payment rejected: {e}");
            ack(
                StatusCode::OK,
                WebhookAck {
                    reason: Some(e.reason()),
                    error: Some(e.to_string()),
                    ..WebhookAck::unprocessed()
                },
            )
        }
    }
}

/// `POST /admin/verifications/:id/approve`
pub async fn approve_verification(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
) -> Response {
    if !state.is_admin(&headers) {
        return unauthorized();
    }

    let manual = state.manual.clone();
    let id = request_id.clone();
    let outcome = settle_detached(state.settlement_timeout, async move {
        manual.approve(&id).await
    })
    .await;

    let (status, body) = match outcome {
        Ok(receipt) => (
            StatusCode::OK,
            ApprovalResponse {
                success: true,
                receipt: Some(receipt),
                reason: None,
                error: None,
            },
        ),
        Err(e) => {
            let status = match &e {
                SettlementError::RequestNotFound(_) => StatusCode::NOT_FOUND,
                SettlementError::AlreadyProcessed(_) | SettlementError::DuplicateEvent(_) => {
                    StatusCode::CONFLICT
                }
                SettlementError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                e if e.is_retryable() => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            };
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!(request_id = %request_id, "Manual approval failed: {e}");
            } else {
                warn!(request_id = %request_id, reason = e.reason(), "Manual approval rejected: {e}");
            }
            (
                status,
                ApprovalResponse {
                    success: false,
                    receipt: None,
                    reason: Some(e.reason()),
                    error: Some(e.to_string()),
                },
            )
        }
    };
    (status, Json(body)).into_response()
}

/// `GET /admin/reconciliation?limit=N`
pub async fn list_reconciliation(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<ReconciliationQuery>,
) -> Response {
    if !state.is_admin(&headers) {
        return unauthorized();
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECONCILIATION_LIMIT)
        .clamp(1, MAX_RECONCILIATION_LIMIT);
    match state.store.list_reconciliation(limit).await {
        Ok(items) => (
            StatusCode::OK,
            Json(ReconciliationResponse {
                count: items.len(),
                items,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

// ─────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────

/// Run a settlement on its own task and bound only the wait for it.
///
/// A settlement is never cancelled part-way: when the wait elapses the caller
/// gets a retryable error while the task carries on, so its remaining writes
/// and reconciliation items still land.
async fn settle_detached<F>(limit: Duration, settlement: F) -> SettlementResult
where
    F: Future<Output = SettlementResult> + Send + 'static,
{
    let task = tokio::spawn(settlement);
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => Err(SettlementError::StoreUnavailable(format!(
            "settlement task failed: {e}"
        ))),
        Err(_) => {
            warn!(
                timeout_secs = limit.as_secs_f32(),
                "Settlement still running after timeout; answering with a retryable error"
            );
            Err(SettlementError::StoreUnavailable(format!(
                "settlement timed out after {}s",
                limit.as_secs_f32()
            )))
        }
    }
}

fn ack(status: StatusCode, body: WebhookAck) -> Response {
    (status, Json(body)).into_response()
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "Unauthorized".to_string(),
        }),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
