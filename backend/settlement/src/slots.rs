//! Slot arithmetic and the project status transition.
//!
//! Pure functions; the engine feeds them store reads and writes whatever
//! they return.

use crate::errors::SettlementError;
use crate::models::{Project, ProjectStatus, SlotState};

/// How a purchase maps onto a project at a given moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPlan {
    /// Whole slots the payment covers.
    pub slots_bought: i64,
    /// Slots that will actually be credited (capped by remaining capacity).
    pub slots_to_credit: i64,
    pub slot_price: i64,
}

impl SlotPlan {
    pub fn amount_credited(&self) -> i64 {
        self.slots_to_credit * self.slot_price
    }
}

/// Reject projects that no longer take investments.
pub fn ensure_funding(project: &Project) -> Result<(), SettlementError> {
    if project.status != ProjectStatus::Funding {
        return Err(SettlementError::ProjectNotFunding {
            project_id: project.id.clone(),
            status: project.status.as_str().to_string(),
        });
    }
    Ok(())
}

/// Work out how many slots `amount` buys in `project`.
///
/// Overpayment beyond the remaining capacity is accepted; only what is left
/// is credited and the excess is not refunded here.
pub fn plan_purchase(project: &Project, amount: i64) -> Result<SlotPlan, SettlementError> {
    ensure_funding(project)?;

    let slots_bought = if project.slot_price > 0 {
        amount.max(0) / project.slot_price
    } else {
        0
    };
    if slots_bought < 1 {
        return Err(SettlementError::BelowSlotPrice {
            amount,
            slot_price: project.slot_price,
        });
    }

    let slots_to_credit = slots_bought.min(project.slots_remaining());
    if slots_to_credit < 1 {
        return Err(SettlementError::ProjectFull(project.id.clone()));
    }

    Ok(SlotPlan {
        slots_bought,
        slots_to_credit,
        slot_price: project.slot_price,
    })
}

/// State after crediting `slots` to `current`.
///
/// Reaching capacity moves `Funding` to `Building`; any other status is left
/// untouched so the lifecycle never regresses.
pub fn advance(current: SlotState, total_slots: i64, slots: i64) -> SlotState {
    let filled_slots = current.filled_slots + slots;
    let status = if current.status == ProjectStatus::Funding && filled_slots >= total_slots {
        ProjectStatus::Building
    } else {
        current.status
    };
    SlotState {
        filled_slots,
        status,
    }
}

/// Forward-only lifecycle check.
pub fn is_valid_transition(from: ProjectStatus, to: ProjectStatus) -> bool {
    matches!(
        (from, to),
        (ProjectStatus::Funding, ProjectStatus::Funding)
            | (ProjectStatus::Funding, ProjectStatus::Building)
            | (ProjectStatus::Building, ProjectStatus::Building)
            | (ProjectStatus::Building, ProjectStatus::Active)
            | (ProjectStatus::Active, ProjectStatus::Active)
    )
}
