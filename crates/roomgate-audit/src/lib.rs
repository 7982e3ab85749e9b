//! Append-only attendance audit trail.
//!
//! This crate defines the `AuditLog` trait for persisting attendance
//! events and the types representing auditable actions. Events are never
//! updated or deleted; payloads are typed per action, with a generic
//! extension variant for forward compatibility. Payloads must never
//! contain a plaintext attendance code.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roomgate_storage::{BookingId, InvitationId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for an attendance event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttendanceEventId(pub Uuid);

impl AttendanceEventId {
    /// Generate a new event ID using UUID v7 (time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for AttendanceEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AttendanceEventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AttendanceEventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Categories of auditable attendance actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceAction {
    CodeSent,
    CodeVerified,
    CodeFailed,
    CheckIn,
}

impl std::fmt::Display for AttendanceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttendanceAction::CodeSent => "code_sent",
            AttendanceAction::CodeVerified => "code_verified",
            AttendanceAction::CodeFailed => "code_failed",
            AttendanceAction::CheckIn => "check_in",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AttendanceAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code_sent" => Ok(AttendanceAction::CodeSent),
            "code_verified" => Ok(AttendanceAction::CodeVerified),
            "code_failed" => Ok(AttendanceAction::CodeFailed),
            "check_in" => Ok(AttendanceAction::CheckIn),
            _ => Err(format!("Unknown attendance action: {}", s)),
        }
    }
}

/// Typed per-action payloads, plus a generic extension shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    CodeSent {
        send_count: i32,
        expires_at: DateTime<Utc>,
        delivered: bool,
    },
    CodeVerified {
        checked_in_at: DateTime<Utc>,
    },
    CodeFailed {
        attempt_count: i32,
        reason: String,
    },
    CheckIn {
        organizer: bool,
    },
    /// Extension fields for shapes introduced later.
    Other {
        data: serde_json::Value,
    },
}

/// Request metadata attached to events, sanitized before storage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

const MAX_IP_LEN: usize = 45; // full IPv6 textual form
const MAX_USER_AGENT_LEN: usize = 256;

impl RequestMeta {
    /// Sanitize raw header values: strip control characters, trim, and
    /// truncate to bounded lengths. Empty results become `None`.
    pub fn sanitized(client_ip: Option<&str>, user_agent: Option<&str>) -> Self {
        Self {
            client_ip: client_ip.and_then(|s| sanitize(s, MAX_IP_LEN)),
            user_agent: user_agent.and_then(|s| sanitize(s, MAX_USER_AGENT_LEN)),
        }
    }
}

fn sanitize(raw: &str, max_len: usize) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control())
        .take(max_len)
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// A single attendance audit record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttendanceEvent {
    /// Unique identifier for this event
    pub id: AttendanceEventId,
    /// When the action occurred
    pub timestamp: DateTime<Utc>,
    /// The action that was performed
    pub action: AttendanceAction,
    /// Booking the action applies to
    pub booking_id: Uuid,
    /// Invitation involved, if any (organizer check-in has none)
    pub invitation_id: Option<Uuid>,
    /// Sanitized request metadata
    pub meta: RequestMeta,
    /// Typed payload for this action
    pub payload: Option<EventPayload>,
}

impl AttendanceEvent {
    /// Create a new event builder.
    pub fn builder(booking_id: &BookingId, action: AttendanceAction) -> AttendanceEventBuilder {
        AttendanceEventBuilder::new(booking_id, action)
    }

    /// Get the booking ID as a typed ID.
    pub fn get_booking_id(&self) -> BookingId {
        BookingId(self.booking_id)
    }

    /// Get the invitation ID as a typed ID (if present).
    pub fn get_invitation_id(&self) -> Option<InvitationId> {
        self.invitation_id.map(InvitationId)
    }
}

/// Builder for constructing attendance events.
pub struct AttendanceEventBuilder {
    booking_id: Uuid,
    action: AttendanceAction,
    invitation_id: Option<Uuid>,
    meta: RequestMeta,
    payload: Option<EventPayload>,
}

impl AttendanceEventBuilder {
    pub fn new(booking_id: &BookingId, action: AttendanceAction) -> Self {
        Self {
            booking_id: booking_id.0,
            action,
            invitation_id: None,
            meta: RequestMeta::default(),
            payload: None,
        }
    }

    pub fn invitation_id(mut self, invitation_id: Option<&InvitationId>) -> Self {
        self.invitation_id = invitation_id.map(|i| i.0);
        self
    }

    pub fn meta(mut self, meta: RequestMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn payload(mut self, payload: EventPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn build(self) -> AttendanceEvent {
        AttendanceEvent {
            id: AttendanceEventId::new(),
            timestamp: Utc::now(),
            action: self.action,
            booking_id: self.booking_id,
            invitation_id: self.invitation_id,
            meta: self.meta,
            payload: self.payload,
        }
    }
}

/// Filter for querying attendance events.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// Filter by booking ID
    pub booking_id: Option<BookingId>,
    /// Filter by invitation ID
    pub invitation_id: Option<InvitationId>,
    /// Filter by action
    pub action: Option<AttendanceAction>,
    /// Filter by start timestamp (inclusive)
    pub from: Option<DateTime<Utc>>,
    /// Filter by end timestamp (exclusive)
    pub to: Option<DateTime<Utc>>,
    /// Maximum number of results to return
    pub limit: Option<u32>,
    /// Number of results to skip (for pagination)
    pub offset: Option<u32>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn booking_id(mut self, booking_id: BookingId) -> Self {
        self.booking_id = Some(booking_id);
        self
    }

    pub fn invitation_id(mut self, invitation_id: InvitationId) -> Self {
        self.invitation_id = Some(invitation_id);
        self
    }

    pub fn action(mut self, action: AttendanceAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Error type for audit log operations.
#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("database error: {0}")]
    Database(String),

    #[error("attendance event not found: {0}")]
    NotFound(AttendanceEventId),
}

/// Trait for attendance event persistence.
///
/// Recording is best-effort from the caller's point of view: a failure to
/// record must be logged but must never roll back or block the operation
/// that produced the event.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Record an attendance event.
    async fn record(&self, event: AttendanceEvent) -> Result<(), AuditLogError>;

    /// Query events matching the filter, ordered by timestamp descending.
    async fn query(&self, filter: EventFilter) -> Result<Vec<AttendanceEvent>, AuditLogError>;

    /// Get a specific event by ID.
    async fn get(&self, id: AttendanceEventId) -> Result<AttendanceEvent, AuditLogError>;

    /// Count events matching the filter.
    async fn count(&self, filter: EventFilter) -> Result<u64, AuditLogError>;
}
