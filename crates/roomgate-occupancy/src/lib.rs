//! Room occupancy aggregation over invitation records.

use roomgate_storage::{Invitation, InvitationStatus};
use serde::{Deserialize, Serialize};

/// Severity classification of current occupancy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OccupancyStatus {
    Low,
    Medium,
    High,
    Over,
}

/// Aggregated occupancy for one booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancySummary {
    pub present: u32,
    pub accepted: u32,
    pub capacity: u32,
    pub percentage: u32,
    pub status: OccupancyStatus,
}

/// Aggregate invitations into an occupancy summary.
///
/// `percentage` is `round(present / capacity * 100)` and 0 when capacity
/// is 0. `Over` takes precedence whenever present exceeds capacity,
/// independent of the percentage bands (high >= 90, medium >= 60).
pub fn compute(invitations: &[Invitation], capacity: u32) -> OccupancySummary {
    let present = invitations.iter().filter(|i| i.present).count() as u32;
    let accepted = invitations
        .iter()
        .filter(|i| i.status == InvitationStatus::Accepted)
        .count() as u32;

    let percentage = if capacity == 0 {
        0
    } else {
        ((present as f64 / capacity as f64) * 100.0).round() as u32
    };

    let status = if present > capacity {
        OccupancyStatus::Over
    } else if percentage >= 90 {
        OccupancyStatus::High
    } else if percentage >= 60 {
        OccupancyStatus::Medium
    } else {
        OccupancyStatus::Low
    };

    OccupancySummary {
        present,
        accepted,
        capacity,
        percentage,
        status,
    }
}
