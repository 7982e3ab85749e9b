//! Booking types.

use chrono::{DateTime, Utc};

use super::BookingId;

/// Booking lifecycle status. Only confirmed bookings accept attendance
/// operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {}", other)),
        }
    }
}

/// Booking record. Read-only here except for the organizer check-in
/// timestamp, which this system sets exactly once.
#[derive(Clone, Debug)]
pub struct Booking {
    pub id: BookingId,
    pub title: String,
    pub room_name: String,
    pub room_capacity: i32,
    pub status: BookingStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub organizer_checked_in_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a booking.
#[derive(Clone, Debug)]
pub struct CreateBookingParams {
    pub title: String,
    pub room_name: String,
    pub room_capacity: i32,
    pub status: BookingStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}
