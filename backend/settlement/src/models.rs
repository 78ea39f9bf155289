//! Ledger documents and the settlement event shape.
//!
//! Every enum here is stored as a snake_case `TEXT` column and serialised the
//! same way over JSON, so the database, the API and the logs agree on names.

use serde::{Deserialize, Serialize};

/// Funding lifecycle of a project.
///
/// ```text
/// Funding ──► Building ──► Active
/// ```
///
/// Only `Funding → Building` is driven by settlement; `Building → Active`
/// happens outside this service. No transition ever goes backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProjectStatus {
    Funding,
    Building,
    Active,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Funding => "funding",
            Self::Building => "building",
            Self::Active => "active",
        }
    }
}

/// What a payment was for, as declared by the payer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentKind {
    RegFee,
    Investment,
}

impl PaymentKind {
    /// Parse the `payment_type` metadata value attached at checkout.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "reg_fee" => Some(Self::RegFee),
            "investment" => Some(Self::Investment),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegFee => "reg_fee",
            Self::Investment => "investment",
        }
    }
}

/// Ledger entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TransactionKind {
    RegFee,
    ReferralBonus,
    SlotPurchase,
}

/// Which trigger produced a settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SettlementSource {
    Webhook,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ReconciliationKind {
    /// The fee was recorded but the account was not activated.
    ActivationFailed,
    /// Activation stood but the referrer was not credited.
    ReferralBonusFailed,
    /// The slot purchase was recorded but the investment record was not.
    InvestmentRecordFailed,
    /// Purchase records exist but the project counter was not advanced.
    SlotCreditFailed,
    /// Fewer slots were credited than the purchase record was planned for.
    SlotShortfall,
    /// A manual request was approved but its settlement hit a store fault.
    ApprovalUnsettled,
}

// ─────────────────────────────────────────────────────────
// Documents
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub is_active: bool,
    pub wallet_balance: i64,
    pub referrer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: String,
    pub slot_price: i64,
    pub total_slots: i64,
    pub filled_slots: i64,
    pub status: ProjectStatus,
}

impl Project {
    pub fn slots_remaining(&self) -> i64 {
        (self.total_slots - self.filled_slots).max(0)
    }
}

/// The mutable half of a project: the only fields settlement writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotState {
    pub filled_slots: i64,
    pub status: ProjectStatus,
}

impl From<&Project> for SlotState {
    fn from(project: &Project) -> Self {
        Self {
            filled_slots: project.filled_slots,
            status: project.status,
        }
    }
}

/// An append-only ledger entry about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub user_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    /// `None` for entries that are not the direct result of a payment.
    pub provider_ref: Option<String>,
    pub referred_user_id: Option<String>,
    pub project_id: Option<String>,
    pub slots: Option<i64>,
    pub method: SettlementSource,
}

/// A ledger entry as stored. Only completed entries are ever written.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TransactionRecord {
    pub id: i64,
    pub user_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub provider_ref: Option<String>,
    pub referred_user_id: Option<String>,
    pub project_id: Option<String>,
    pub slots: Option<i64>,
    pub method: SettlementSource,
    pub status: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvestment {
    pub user_id: String,
    pub project_id: String,
    pub amount: i64,
    pub slots: i64,
    pub method: SettlementSource,
}

/// A manual-payment claim awaiting admin review.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VerificationRequest {
    pub id: String,
    pub user_id: String,
    pub kind: PaymentKind,
    pub project_id: Option<String>,
    pub amount: i64,
    pub status: RequestStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReconciliationItem {
    pub kind: ReconciliationKind,
    pub user_id: String,
    pub project_id: Option<String>,
    pub provider_ref: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReconciliationItem {
    pub id: i64,
    pub kind: ReconciliationKind,
    pub user_id: String,
    pub project_id: Option<String>,
    pub provider_ref: Option<String>,
    pub detail: String,
    pub created_at: i64,
}

// ─────────────────────────────────────────────────────────
// Settlement input / output
// ─────────────────────────────────────────────────────────

/// A verified, source-agnostic payment ready for settlement.
///
/// Produced by the webhook decoder and by the manual adapter alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    pub user_id: String,
    pub kind: PaymentKind,
    pub amount: i64,
    pub provider_ref: String,
    pub project_id: Option<String>,
    pub source: SettlementSource,
}

/// What a successful settlement changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettlementReceipt {
    Activated {
        user_id: String,
        referral_paid: bool,
    },
    Invested {
        project_id: String,
        slots_credited: i64,
        amount_credited: i64,
        project_status: ProjectStatus,
    },
}
