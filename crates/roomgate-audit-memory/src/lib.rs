//! In-memory audit log implementation.
//!
//! This implementation is suitable for:
//! - Single server deployments
//! - Development and testing
//!
//! Events live only as long as the process. For durable audit trails,
//! use the SQLite-backed implementation instead.

use async_trait::async_trait;
use roomgate_audit::{
    AttendanceEvent, AttendanceEventId, AuditLog, AuditLogError, EventFilter,
};
use tokio::sync::RwLock;

/// In-memory append-only audit log.
#[derive(Default)]
pub struct MemoryAuditLog {
    events: RwLock<Vec<AttendanceEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches(event: &AttendanceEvent, filter: &EventFilter) -> bool {
    if let Some(booking_id) = filter.booking_id {
        if event.booking_id != booking_id.0 {
            return false;
        }
    }
    if let Some(invitation_id) = filter.invitation_id {
        if event.invitation_id != Some(invitation_id.0) {
            return false;
        }
    }
    if let Some(action) = filter.action {
        if event.action != action {
            return false;
        }
    }
    if let Some(from) = filter.from {
        if event.timestamp < from {
            return false;
        }
    }
    if let Some(to) = filter.to {
        if event.timestamp >= to {
            return false;
        }
    }
    true
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record(&self, event: AttendanceEvent) -> Result<(), AuditLogError> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn query(&self, filter: EventFilter) -> Result<Vec<AttendanceEvent>, AuditLogError> {
        let events = self.events.read().await;
        let mut matched: Vec<AttendanceEvent> = events
            .iter()
            .filter(|e| matches(e, &filter))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let offset = filter.offset.unwrap_or(0) as usize;
        let matched: Vec<AttendanceEvent> = match filter.limit {
            Some(limit) => matched.into_iter().skip(offset).take(limit as usize).collect(),
            None => matched.into_iter().skip(offset).collect(),
        };
        Ok(matched)
    }

    async fn get(&self, id: AttendanceEventId) -> Result<AttendanceEvent, AuditLogError> {
        self.events
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(AuditLogError::NotFound(id))
    }

    async fn count(&self, filter: EventFilter) -> Result<u64, AuditLogError> {
        let events = self.events.read().await;
        Ok(events.iter().filter(|e| matches(e, &filter)).count() as u64)
    }
}
