//! Invitation types.

use chrono::{DateTime, Utc};

use super::{BookingId, InvitationId};

/// Invitation lifecycle status, distinct from attendance state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
}

impl std::fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Declined => "declined",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for InvitationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InvitationStatus::Pending),
            "accepted" => Ok(InvitationStatus::Accepted),
            "declined" => Ok(InvitationStatus::Declined),
            other => Err(format!("unknown invitation status: {}", other)),
        }
    }
}

/// Invitation record, one per (booking, invitee e-mail).
///
/// Verification state invariants: `code_hash` and `code_salt` are set or
/// cleared together; `checked_in_at` transitions null to non-null at most
/// once; `verify_attempt_count` resets only when a new code is issued.
#[derive(Clone, Debug)]
pub struct Invitation {
    pub id: InvitationId,
    pub booking_id: BookingId,
    pub email: String,
    pub display_name: Option<String>,
    pub status: InvitationStatus,
    pub present: bool,
    pub code_hash: Option<String>,
    pub code_salt: Option<String>,
    pub code_expires_at: Option<DateTime<Utc>>,
    pub code_send_count: i32,
    pub code_last_sent_at: Option<DateTime<Utc>>,
    pub verify_attempt_count: i32,
    pub verify_last_attempt_at: Option<DateTime<Utc>>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Invitation {
    /// True while a code digest is stored and not yet consumed.
    pub fn has_active_code(&self) -> bool {
        self.code_hash.is_some() && self.code_salt.is_some()
    }
}

/// Parameters for creating an invitation. E-mail is lowercased by the
/// store before persistence.
#[derive(Clone, Debug)]
pub struct CreateInvitationParams {
    pub booking_id: BookingId,
    pub email: String,
    pub display_name: Option<String>,
    pub status: InvitationStatus,
}

/// Fields written atomically when a freshly generated code is issued.
#[derive(Clone, Debug)]
pub struct IssuedCode {
    pub code_hash: String,
    pub code_salt: String,
    pub expires_at: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
}
