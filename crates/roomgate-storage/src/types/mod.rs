//! Storage record types.

mod bookings;
mod ids;
mod invitations;

pub use bookings::{Booking, BookingStatus, CreateBookingParams};
pub use ids::{BookingId, InvitationId};
pub use invitations::{CreateInvitationParams, Invitation, InvitationStatus, IssuedCode};
