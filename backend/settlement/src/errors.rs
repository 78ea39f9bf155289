//! Application-wide error types.
//!
//! [`AppError`] covers startup and infrastructure faults. [`SettlementError`]
//! is the taxonomy the settlement engine and the manual adapter return to
//! their callers; [`SettlementError::is_retryable`] is the only signal the
//! HTTP layer uses to decide between "acknowledge" and "ask for a retry".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signature verifier error: {0}")]
    Signature(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("amount {received} is below the required {expected}")]
    AmountMismatch { received: i64, expected: i64 },

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("project {project_id} is not accepting investments (status: {status})")]
    ProjectNotFunding { project_id: String, status: String },

    #[error("amount {amount} is below the slot price {slot_price}")]
    BelowSlotPrice { amount: i64, slot_price: i64 },

    #[error("project {0} has no remaining slots")]
    ProjectFull(String),

    /// Purchase records were written, then the capacity went to another buyer.
    #[error(
        "project {project_id} filled up before {recorded_slots} recorded slot(s) could be \
         credited; the purchase is held for reconciliation"
    )]
    CapacityLost {
        project_id: String,
        recorded_slots: i64,
    },

    #[error("event already settled: {0}")]
    DuplicateEvent(String),

    #[error("verification request not found: {0}")]
    RequestNotFound(String),

    #[error("verification request already processed: {0}")]
    AlreadyProcessed(String),

    #[error("invalid verification request: {0}")]
    InvalidRequest(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl SettlementError {
    /// Transient infrastructure faults are the only retryable outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Stable snake_case identifier for API responses.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::UserNotFound(_) => "user_not_found",
            Self::ProjectNotFound(_) => "project_not_found",
            Self::ProjectNotFunding { .. } => "project_not_funding",
            Self::BelowSlotPrice { .. } => "below_slot_price",
            Self::ProjectFull(_) => "project_full",
            Self::CapacityLost { .. } => "capacity_lost",
            Self::DuplicateEvent(_) => "duplicate_event",
            Self::RequestNotFound(_) => "request_not_found",
            Self::AlreadyProcessed(_) => "already_processed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl From<sqlx::Error> for SettlementError {
    fn from(err: sqlx::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}
