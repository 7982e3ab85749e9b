//! Storage abstraction for bookings and invitations.
//!
//! The [`Store`] trait is the only way attendance state is read or
//! mutated. Backends must make the compound updates atomic: issuing a
//! code, recording a failed attempt, and marking check-in each touch
//! several columns that move together, and check-in must be a conditional
//! write so exactly one concurrent verifier wins.

pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use types::{
    Booking, BookingId, BookingStatus, CreateBookingParams, CreateInvitationParams, Invitation,
    InvitationId, InvitationStatus, IssuedCode,
};

/// Errors returned by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    /// A conditional update found the precondition already violated, e.g.
    /// check-in raced with another verifier or the organizer already
    /// checked in.
    #[error("conflict")]
    Conflict,
    #[error("backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    // Bookings

    async fn create_booking(&self, params: CreateBookingParams) -> Result<Booking, StoreError>;

    async fn get_booking(&self, id: &BookingId) -> Result<Booking, StoreError>;

    /// Set `organizer_checked_in_at` once. Fails with [`StoreError::Conflict`]
    /// if it is already set.
    async fn set_organizer_checked_in(
        &self,
        id: &BookingId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // Invitations

    /// Create an invitation. The (booking, e-mail) pair is unique;
    /// duplicates fail with [`StoreError::AlreadyExists`].
    async fn create_invitation(
        &self,
        params: CreateInvitationParams,
    ) -> Result<Invitation, StoreError>;

    async fn get_invitation(&self, id: &InvitationId) -> Result<Invitation, StoreError>;

    async fn list_invitations(&self, booking_id: &BookingId)
        -> Result<Vec<Invitation>, StoreError>;

    async fn set_invitation_status(
        &self,
        id: &InvitationId,
        status: InvitationStatus,
    ) -> Result<(), StoreError>;

    /// Persist a freshly issued code in one write: digest, salt and expiry
    /// replace any previous code, `code_send_count` increments,
    /// `code_last_sent_at` is set, and the verify attempt state resets.
    /// The write is conditional on `code_send_count < max_send_count`, so
    /// concurrent requests racing a stale snapshot cannot push the counter
    /// past the cap; a saturated counter fails with [`StoreError::Conflict`].
    async fn store_issued_code(
        &self,
        id: &InvitationId,
        code: IssuedCode,
        max_send_count: i32,
    ) -> Result<Invitation, StoreError>;

    /// Record a failed verification attempt and return the new attempt
    /// count. Increment and timestamp move in the same write, conditional
    /// on `verify_attempt_count < max_attempts`; an already-spent budget
    /// fails with [`StoreError::Conflict`].
    async fn record_verify_failure(
        &self,
        id: &InvitationId,
        at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<i32, StoreError>;

    /// Zero the attempt counter after a cooldown has elapsed, leaving the
    /// stored code untouched.
    async fn reset_verify_attempts(&self, id: &InvitationId) -> Result<(), StoreError>;

    /// Conditionally mark the invitee checked in: only succeeds while
    /// `checked_in_at` is null, and in the same write sets `present` and
    /// clears the code digest and salt so the code is single-use. A lost
    /// race fails with [`StoreError::Conflict`].
    async fn mark_checked_in(
        &self,
        id: &InvitationId,
        at: DateTime<Utc>,
    ) -> Result<Invitation, StoreError>;
}
