//! Pure rate-limit and time-window policies for attendance operations.
//!
//! Every function takes `now` as an explicit argument and performs no I/O,
//! so callers stay deterministic and unit-testable without clock mocking.
//! The policies only decide; counters live with the invitation row and are
//! mutated by the orchestrator at the storage boundary.

use chrono::{DateTime, Duration, Utc};

/// Hard cap on code requests per invitation. Never resets inside this
/// system; only the external re-invitation path starts a fresh budget.
pub const MAX_CODE_SENDS: i32 = 5;

/// Cooldown between consecutive code requests.
pub const SEND_COOLDOWN_SECS: i64 = 60;

/// Failed verification attempts allowed before the cooldown engages.
pub const MAX_VERIFY_ATTEMPTS: i32 = 5;

/// Cooldown after the attempt budget is exhausted.
pub const VERIFY_COOLDOWN_MINS: i64 = 15;

/// Extra time after meeting end during which attendance actions remain
/// valid.
pub const GRACE_MINUTES: i64 = 15;

/// Outcome of a rate-limit check. Denials carry the human-readable reason
/// that is surfaced verbatim to the end user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied { reason: String },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }

    /// Denial reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            RateDecision::Allowed => None,
            RateDecision::Denied { reason } => Some(reason),
        }
    }
}

/// Decide whether a new code may be requested.
///
/// Denies once `send_count` hits [`MAX_CODE_SENDS`] regardless of timing,
/// otherwise enforces the send cooldown. An absent `last_sent_at` is the
/// first-ever request and always permits.
pub fn can_request_code(
    last_sent_at: Option<DateTime<Utc>>,
    send_count: i32,
    now: DateTime<Utc>,
) -> RateDecision {
    if send_count >= MAX_CODE_SENDS {
        return RateDecision::Denied {
            reason: format!(
                "Maximum of {} code requests reached for this invitation.",
                MAX_CODE_SENDS
            ),
        };
    }

    let Some(last_sent_at) = last_sent_at else {
        return RateDecision::Allowed;
    };

    let ready_at = last_sent_at + Duration::seconds(SEND_COOLDOWN_SECS);
    if now < ready_at {
        let wait = (ready_at - now).num_seconds().max(1);
        return RateDecision::Denied {
            reason: format!("Please wait {} seconds before requesting another code.", wait),
        };
    }

    RateDecision::Allowed
}

/// Decide whether a verification attempt may proceed.
///
/// Blocks only while the attempt budget is exhausted *and* the cooldown
/// since the last attempt has not elapsed. Once the cooldown passes the
/// decision flips to allowed with the counter unchanged; resetting the
/// persisted counter is the orchestrator's job.
pub fn can_attempt_verify(
    attempt_count: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> RateDecision {
    if attempt_count < MAX_VERIFY_ATTEMPTS {
        return RateDecision::Allowed;
    }

    let Some(last_attempt_at) = last_attempt_at else {
        return RateDecision::Allowed;
    };

    let blocked_until = last_attempt_at + Duration::minutes(VERIFY_COOLDOWN_MINS);
    if now < blocked_until {
        let wait_mins = ((blocked_until - now).num_seconds() + 59) / 60;
        return RateDecision::Denied {
            reason: format!(
                "Too many failed attempts. Try again in {} minute{}.",
                wait_mins,
                if wait_mins == 1 { "" } else { "s" }
            ),
        };
    }

    RateDecision::Allowed
}

/// True iff `start <= now <= end + grace`.
pub fn attendance_window_open(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    grace_minutes: i64,
    now: DateTime<Utc>,
) -> bool {
    now >= start && now <= end + Duration::minutes(grace_minutes)
}

/// True iff the attendance window is open and the organizer has checked in.
///
/// The organizer check-in is the master gate: until the organizer is
/// physically present, no invitee can be verified and no QR path is shown,
/// so a no-show meeting cannot generate attendance records.
pub fn should_show_qr(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    organizer_checked_in_at: Option<DateTime<Utc>>,
    grace_minutes: i64,
    now: DateTime<Utc>,
) -> bool {
    organizer_checked_in_at.is_some() && attendance_window_open(start, end, grace_minutes, now)
}

/// Expiry timestamp for a code issued against a meeting ending at `end`.
///
/// A code is expired when `now > code_expiry(..)`, independent of the
/// window check.
pub fn code_expiry(end: DateTime<Utc>, grace_minutes: i64) -> DateTime<Utc> {
    end + Duration::minutes(grace_minutes)
}
