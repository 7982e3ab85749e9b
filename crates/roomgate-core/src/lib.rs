//! Meeting attendance verification service.
//!
//! Orchestrates code issuance and verification, organizer check-in, the
//! QR occupancy view and the audit trail over pluggable [`Store`],
//! [`AuditLog`] and [`CodeDelivery`] backends.
//!
//! [`Store`]: roomgate_storage::Store
//! [`AuditLog`]: roomgate_audit::AuditLog

mod config;
mod delivery;
mod service;

pub use config::{AttendanceConfig, ConfigError};
pub use delivery::{CodeDelivery, CodeEmail, CodeEmailContent, DeliveryError};
pub use service::{
    AttendanceError, AttendanceService, CodeRequestOutcome, OccupancyContext,
};
