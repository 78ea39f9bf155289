//! Ledger invariants asserted by the settlement tests.

use crate::models::{Project, ProjectStatus};
use crate::slots::is_valid_transition;

/// INV-1: `0 <= filled_slots <= total_slots`.
pub fn assert_slot_bounds(project: &Project) {
    assert!(
        project.filled_slots >= 0 && project.filled_slots <= project.total_slots,
        "INV-1 violated: project {} has {} of {} slots filled",
        project.id,
        project.filled_slots,
        project.total_slots
    );
}

/// INV-2: a funding project is never at capacity; a full one is never funding.
pub fn assert_status_matches_fill(project: &Project) {
    if project.filled_slots == project.total_slots {
        assert_ne!(
            project.status,
            ProjectStatus::Funding,
            "INV-2 violated: project {} is full but still funding",
            project.id
        );
    }
}

/// INV-3: status only moves forward.
pub fn assert_valid_status_transition(from: ProjectStatus, to: ProjectStatus) {
    assert!(
        is_valid_transition(from, to),
        "INV-3 violated: invalid status transition from {:?} to {:?}",
        from,
        to
    );
}

/// Run all stateless project invariants.
pub fn assert_all_project_invariants(project: &Project) {
    assert_slot_bounds(project);
    assert_status_matches_fill(project);
}
