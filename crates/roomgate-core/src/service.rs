//! Attendance orchestration over storage, policy, codes, tokens and audit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use roomgate_audit::{
    AttendanceAction, AttendanceEvent, AuditLog, EventPayload, RequestMeta,
};
use roomgate_occupancy::OccupancySummary;
use roomgate_policy::{
    can_attempt_verify, can_request_code, RateDecision, MAX_CODE_SENDS, MAX_VERIFY_ATTEMPTS,
};
use roomgate_storage::{
    Booking, BookingId, BookingStatus, Invitation, InvitationId, IssuedCode, Store, StoreError,
};
use roomgate_token::TokenClaims;

use crate::config::AttendanceConfig;
use crate::delivery::{CodeDelivery, CodeEmail};

/// Errors surfaced by attendance operations. Policy denials carry
/// user-presentable messages; storage failures stay opaque.
#[derive(Debug, thiserror::Error)]
pub enum AttendanceError {
    #[error("Not found.")]
    NotFound,
    #[error("This booking is not confirmed.")]
    BookingNotConfirmed,
    #[error("The attendance window for this meeting is closed.")]
    WindowClosed,
    #[error("{0}")]
    RateLimited(String),
    #[error("This code has expired. Please request a new one.")]
    CodeExpired,
    #[error("No code has been issued for this invitation yet.")]
    CodeNotIssued,
    #[error("Invalid code. {attempts_remaining} attempts remaining.")]
    CodeMismatch { attempts_remaining: i32 },
    #[error("Already marked present.")]
    AlreadyCheckedIn,
    #[error("A code must be exactly 4 digits.")]
    InvalidCodeFormat,
    #[error("QR access is not currently available for this meeting.")]
    QrUnavailable,
    #[error("storage error: {0}")]
    Storage(StoreError),
    #[error(transparent)]
    Token(#[from] roomgate_token::TokenError),
}

fn store_err(e: StoreError) -> AttendanceError {
    match e {
        StoreError::NotFound => AttendanceError::NotFound,
        other => AttendanceError::Storage(other),
    }
}

/// Result of a successful code request. The state change and the
/// delivery are reported separately: a persisted code whose e-mail
/// bounced shows up as `delivered: false`.
#[derive(Clone, Debug)]
pub struct CodeRequestOutcome {
    pub delivered: bool,
    pub expires_at: DateTime<Utc>,
    pub send_count: i32,
}

/// QR visibility plus the current occupancy summary for a booking.
#[derive(Clone, Debug)]
pub struct OccupancyContext {
    pub show_qr: bool,
    pub occupancy: OccupancySummary,
}

/// The attendance service. All operations take `now` explicitly so the
/// whole flow stays deterministic under test.
pub struct AttendanceService<S: Store> {
    store: Arc<S>,
    audit: Arc<dyn AuditLog>,
    delivery: Arc<dyn CodeDelivery>,
    config: AttendanceConfig,
}

impl<S: Store> AttendanceService<S> {
    pub fn new(
        store: Arc<S>,
        audit: Arc<dyn AuditLog>,
        delivery: Arc<dyn CodeDelivery>,
        config: AttendanceConfig,
    ) -> Self {
        Self {
            store,
            audit,
            delivery,
            config,
        }
    }

    /// Record an audit event, logging (never propagating) failures.
    async fn record_event(&self, event: AttendanceEvent) {
        if let Err(e) = self.audit.record(event).await {
            tracing::warn!(error = %e, "failed to record attendance event");
        }
    }

    async fn load_invitation(
        &self,
        invitation_id: &InvitationId,
    ) -> Result<(Invitation, Booking), AttendanceError> {
        let invitation = self
            .store
            .get_invitation(invitation_id)
            .await
            .map_err(store_err)?;
        let booking = self
            .store
            .get_booking(&invitation.booking_id)
            .await
            .map_err(store_err)?;
        Ok((invitation, booking))
    }

    fn window_open(&self, booking: &Booking, now: DateTime<Utc>) -> bool {
        roomgate_policy::attendance_window_open(
            booking.start_time,
            booking.end_time,
            self.config.grace_minutes,
            now,
        )
    }

    /// Issue a fresh code for an invitation and hand it to delivery.
    pub async fn request_code(
        &self,
        invitation_id: &InvitationId,
        meta: RequestMeta,
        now: DateTime<Utc>,
    ) -> Result<CodeRequestOutcome, AttendanceError> {
        let (invitation, booking) = self.load_invitation(invitation_id).await?;

        if booking.status != BookingStatus::Confirmed {
            return Err(AttendanceError::BookingNotConfirmed);
        }
        if !self.window_open(&booking, now) {
            return Err(AttendanceError::WindowClosed);
        }
        if let RateDecision::Denied { reason } = can_request_code(
            invitation.code_last_sent_at,
            invitation.code_send_count,
            now,
        ) {
            return Err(AttendanceError::RateLimited(reason));
        }

        let code = roomgate_codes::generate_code();
        let salt = roomgate_codes::generate_salt();
        let expires_at = roomgate_policy::code_expiry(booking.end_time, self.config.grace_minutes);

        // The store re-checks the cap in the same write, so a concurrent
        // request that already spent the last send loses here.
        let updated = match self
            .store
            .store_issued_code(
                invitation_id,
                IssuedCode {
                    code_hash: roomgate_codes::hash_code(&code, &salt),
                    code_salt: salt,
                    expires_at,
                    sent_at: now,
                },
                MAX_CODE_SENDS,
            )
            .await
        {
            Ok(inv) => inv,
            Err(StoreError::Conflict) => {
                return Err(AttendanceError::RateLimited(format!(
                    "Maximum of {} code requests reached for this invitation.",
                    MAX_CODE_SENDS
                )))
            }
            Err(e) => return Err(store_err(e)),
        };

        // The plaintext leaves the process here and nowhere else.
        let delivered = match self
            .delivery
            .send_code(&CodeEmail {
                to_address: updated.email.clone(),
                to_name: updated.display_name.clone(),
                meeting_title: booking.title.clone(),
                room_name: booking.room_name.clone(),
                starts_at: booking.start_time,
                ends_at: booking.end_time,
                code,
            })
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    invitation_id = %updated.id,
                    booking_id = %booking.id,
                    error = %e,
                    "code email delivery failed"
                );
                false
            }
        };

        tracing::info!(
            invitation_id = %updated.id,
            booking_id = %booking.id,
            send_count = updated.code_send_count,
            delivered,
            "attendance code issued"
        );
        self.record_event(
            AttendanceEvent::builder(&booking.id, AttendanceAction::CodeSent)
                .invitation_id(Some(&updated.id))
                .meta(meta)
                .payload(EventPayload::CodeSent {
                    send_count: updated.code_send_count,
                    expires_at,
                    delivered,
                })
                .build(),
        )
        .await;

        Ok(CodeRequestOutcome {
            delivered,
            expires_at,
            send_count: updated.code_send_count,
        })
    }

    /// Verify a submitted code and mark the invitee present.
    ///
    /// Returns the check-in timestamp. The stored digest is cleared on
    /// success, so a correct code works exactly once.
    pub async fn verify_code(
        &self,
        invitation_id: &InvitationId,
        submitted: &str,
        meta: RequestMeta,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, AttendanceError> {
        // Malformed input is rejected before it can spend attempt budget.
        if !roomgate_codes::is_valid_code_format(submitted) {
            return Err(AttendanceError::InvalidCodeFormat);
        }

        let (invitation, booking) = self.load_invitation(invitation_id).await?;

        if booking.status != BookingStatus::Confirmed {
            return Err(AttendanceError::BookingNotConfirmed);
        }
        if invitation.checked_in_at.is_some() {
            return Err(AttendanceError::AlreadyCheckedIn);
        }

        let (Some(code_hash), Some(code_salt), Some(code_expires_at)) = (
            invitation.code_hash.as_deref(),
            invitation.code_salt.as_deref(),
            invitation.code_expires_at,
        ) else {
            return Err(AttendanceError::CodeNotIssued);
        };

        // Expiry is reported ahead of the window state so the caller
        // learns a new code is needed, not just that time ran out.
        if now > code_expires_at {
            return Err(AttendanceError::CodeExpired);
        }
        if !self.window_open(&booking, now) {
            return Err(AttendanceError::WindowClosed);
        }

        match can_attempt_verify(
            invitation.verify_attempt_count,
            invitation.verify_last_attempt_at,
            now,
        ) {
            RateDecision::Denied { reason } => return Err(AttendanceError::RateLimited(reason)),
            RateDecision::Allowed => {
                // A saturated counter with an elapsed cooldown opens a
                // fresh attempt window.
                if invitation.verify_attempt_count >= MAX_VERIFY_ATTEMPTS {
                    self.store
                        .reset_verify_attempts(invitation_id)
                        .await
                        .map_err(store_err)?;
                }
            }
        }

        if !roomgate_codes::verify_code(submitted, code_hash, code_salt) {
            let attempts = match self
                .store
                .record_verify_failure(invitation_id, now, MAX_VERIFY_ATTEMPTS)
                .await
            {
                Ok(n) => n,
                // a concurrent mismatch spent the last attempt first
                Err(StoreError::Conflict) => {
                    return Err(AttendanceError::RateLimited(
                        "Too many failed attempts. Try again later.".to_string(),
                    ))
                }
                Err(e) => return Err(store_err(e)),
            };
            let attempts_remaining = (MAX_VERIFY_ATTEMPTS - attempts).max(0);

            tracing::info!(
                invitation_id = %invitation.id,
                booking_id = %booking.id,
                attempts,
                "attendance code mismatch"
            );
            self.record_event(
                AttendanceEvent::builder(&booking.id, AttendanceAction::CodeFailed)
                    .invitation_id(Some(&invitation.id))
                    .meta(meta)
                    .payload(EventPayload::CodeFailed {
                        attempt_count: attempts,
                        reason: "mismatch".to_string(),
                    })
                    .build(),
            )
            .await;
            return Err(AttendanceError::CodeMismatch { attempts_remaining });
        }

        let checked_in = match self.store.mark_checked_in(invitation_id, now).await {
            Ok(inv) => inv,
            // a concurrent verifier won the conditional write
            Err(StoreError::Conflict) => return Err(AttendanceError::AlreadyCheckedIn),
            Err(e) => return Err(store_err(e)),
        };
        let checked_in_at = checked_in.checked_in_at.unwrap_or(now);

        tracing::info!(
            invitation_id = %invitation.id,
            booking_id = %booking.id,
            "invitee checked in"
        );
        self.record_event(
            AttendanceEvent::builder(&booking.id, AttendanceAction::CodeVerified)
                .invitation_id(Some(&invitation.id))
                .meta(meta)
                .payload(EventPayload::CodeVerified { checked_in_at })
                .build(),
        )
        .await;

        Ok(checked_in_at)
    }

    /// Record the organizer's physical check-in, the master gate for the
    /// QR path.
    pub async fn organizer_check_in(
        &self,
        booking_id: &BookingId,
        meta: RequestMeta,
        now: DateTime<Utc>,
    ) -> Result<(), AttendanceError> {
        let booking = self.store.get_booking(booking_id).await.map_err(store_err)?;
        if booking.status != BookingStatus::Confirmed {
            return Err(AttendanceError::BookingNotConfirmed);
        }

        match self.store.set_organizer_checked_in(booking_id, now).await {
            Ok(()) => {}
            Err(StoreError::Conflict) => return Err(AttendanceError::AlreadyCheckedIn),
            Err(e) => return Err(store_err(e)),
        }

        tracing::info!(booking_id = %booking.id, "organizer checked in");
        self.record_event(
            AttendanceEvent::builder(&booking.id, AttendanceAction::CheckIn)
                .meta(meta)
                .payload(EventPayload::CheckIn { organizer: true })
                .build(),
        )
        .await;
        Ok(())
    }

    /// Occupancy plus whether the QR path should be shown right now.
    pub async fn get_occupancy_context(
        &self,
        booking_id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<OccupancyContext, AttendanceError> {
        let booking = self.store.get_booking(booking_id).await.map_err(store_err)?;
        let invitations = self
            .store
            .list_invitations(booking_id)
            .await
            .map_err(store_err)?;

        Ok(OccupancyContext {
            show_qr: self.should_show_qr(&booking, now),
            occupancy: roomgate_occupancy::compute(&invitations, capacity_of(&booking)),
        })
    }

    fn should_show_qr(&self, booking: &Booking, now: DateTime<Utc>) -> bool {
        roomgate_policy::should_show_qr(
            booking.start_time,
            booking.end_time,
            booking.organizer_checked_in_at,
            self.config.grace_minutes,
            now,
        )
    }

    /// Issue a short-lived attendance-view token. Only available while
    /// the QR gate is open.
    pub async fn issue_qr_token(
        &self,
        booking_id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<String, AttendanceError> {
        let booking = self.store.get_booking(booking_id).await.map_err(store_err)?;
        if !self.should_show_qr(&booking, now) {
            return Err(AttendanceError::QrUnavailable);
        }
        Ok(roomgate_token::issue_attendance_token(
            &self.config.signing_secret,
            booking.id.0,
            now,
            self.config.token_ttl_minutes,
        )?)
    }

    /// Verify a QR token. Any failure yields `None` uniformly.
    pub fn verify_qr_token(&self, token: &str, now: DateTime<Utc>) -> Option<TokenClaims> {
        roomgate_token::verify_attendance_token(&self.config.signing_secret, token, now)
    }

    /// Resolve a QR token into the current occupancy summary.
    ///
    /// Unauthorized requests get `None` with no reason attached: bad
    /// signature, expiry, an unknown booking and a closed QR gate are
    /// indistinguishable to the caller.
    pub async fn view_occupancy(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OccupancySummary>, AttendanceError> {
        let Some(claims) = self.verify_qr_token(token, now) else {
            return Ok(None);
        };
        let booking_id = BookingId(claims.booking_id);

        let booking = match self.store.get_booking(&booking_id).await {
            Ok(b) => b,
            Err(StoreError::NotFound) => return Ok(None),
            Err(e) => return Err(store_err(e)),
        };
        if !self.should_show_qr(&booking, now) {
            return Ok(None);
        }

        let invitations = self
            .store
            .list_invitations(&booking_id)
            .await
            .map_err(store_err)?;
        Ok(Some(roomgate_occupancy::compute(
            &invitations,
            capacity_of(&booking),
        )))
    }
}

fn capacity_of(booking: &Booking) -> u32 {
    booking.room_capacity.max(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use roomgate_audit::EventFilter;
    use roomgate_audit_memory::MemoryAuditLog;
    use roomgate_occupancy::OccupancyStatus;
    use roomgate_storage::{CreateBookingParams, CreateInvitationParams, InvitationStatus};
    use roomgate_store_sqlite::SqliteStore;
    use std::sync::Mutex;

    use crate::delivery::DeliveryError;

    struct RecordingDelivery {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingDelivery {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }

        fn last_code(&self) -> String {
            self.sent.lock().unwrap().last().unwrap().1.clone()
        }

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl CodeDelivery for RecordingDelivery {
        async fn send_code(&self, email: &CodeEmail) -> Result<(), DeliveryError> {
            self.sent
                .lock()
                .unwrap()
                .push((email.to_address.clone(), email.code.clone()));
            Ok(())
        }
    }

    struct FailingDelivery;

    #[async_trait::async_trait]
    impl CodeDelivery for FailingDelivery {
        async fn send_code(&self, _email: &CodeEmail) -> Result<(), DeliveryError> {
            Err(DeliveryError::SendFailed("smtp unreachable".to_string()))
        }
    }

    struct Fixture {
        service: AttendanceService<SqliteStore>,
        store: Arc<SqliteStore>,
        audit: Arc<MemoryAuditLog>,
        delivery: Arc<RecordingDelivery>,
        booking: Booking,
        invitation: Invitation,
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn meta() -> RequestMeta {
        RequestMeta::sanitized(Some("127.0.0.1"), Some("test"))
    }

    async fn seed_booking(store: &SqliteStore, status: BookingStatus) -> Booking {
        store
            .create_booking(CreateBookingParams {
                title: "Design review".to_string(),
                room_name: "Aurora".to_string(),
                room_capacity: 10,
                status,
                start_time: at(10, 0),
                end_time: at(11, 0),
            })
            .await
            .unwrap()
    }

    async fn seed_invitation(store: &SqliteStore, booking: &Booking, email: &str) -> Invitation {
        store
            .create_invitation(CreateInvitationParams {
                booking_id: booking.id,
                email: email.to_string(),
                display_name: Some("Sam".to_string()),
                status: InvitationStatus::Accepted,
            })
            .await
            .unwrap()
    }

    // Confirmed booking 10:00-11:00 with one accepted invitation.
    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let audit = Arc::new(MemoryAuditLog::new());
        let delivery = Arc::new(RecordingDelivery::new());
        let booking = seed_booking(&store, BookingStatus::Confirmed).await;
        let invitation = seed_invitation(&store, &booking, "sam@example.com").await;
        let service = AttendanceService::new(
            store.clone(),
            audit.clone(),
            delivery.clone(),
            AttendanceConfig::test(),
        );
        Fixture {
            service,
            store,
            audit,
            delivery,
            booking,
            invitation,
        }
    }

    #[tokio::test]
    async fn request_code_persists_digest_and_delivers() {
        let fx = fixture().await;
        let outcome = fx
            .service
            .request_code(&fx.invitation.id, meta(), at(10, 5))
            .await
            .unwrap();

        assert!(outcome.delivered);
        assert_eq!(outcome.send_count, 1);
        assert_eq!(outcome.expires_at, at(11, 15));

        let stored = fx.store.get_invitation(&fx.invitation.id).await.unwrap();
        assert!(stored.has_active_code());
        assert_eq!(stored.code_expires_at, Some(at(11, 15)));
        // the stored digest is not the plaintext that was delivered
        let code = fx.delivery.last_code();
        assert_ne!(stored.code_hash.as_deref(), Some(code.as_str()));

        let sent_events = fx
            .audit
            .count(
                EventFilter::new()
                    .booking_id(fx.booking.id)
                    .action(AttendanceAction::CodeSent),
            )
            .await
            .unwrap();
        assert_eq!(sent_events, 1);
    }

    #[tokio::test]
    async fn request_code_rejects_unconfirmed_booking() {
        let fx = fixture().await;
        let pending = seed_booking(&fx.store, BookingStatus::Pending).await;
        let invitation = seed_invitation(&fx.store, &pending, "p@example.com").await;

        let err = fx
            .service
            .request_code(&invitation.id, meta(), at(10, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::BookingNotConfirmed));
    }

    #[tokio::test]
    async fn request_code_outside_window_is_rejected() {
        let fx = fixture().await;
        for now in [at(9, 59), at(11, 16)] {
            let err = fx
                .service
                .request_code(&fx.invitation.id, meta(), now)
                .await
                .unwrap_err();
            assert!(matches!(err, AttendanceError::WindowClosed));
        }
        assert_eq!(fx.delivery.count(), 0);
    }

    #[tokio::test]
    async fn request_code_enforces_cooldown() {
        let fx = fixture().await;
        fx.service
            .request_code(&fx.invitation.id, meta(), at(10, 5))
            .await
            .unwrap();

        let err = fx
            .service
            .request_code(&fx.invitation.id, meta(), at(10, 5) + Duration::seconds(30))
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::RateLimited(_)));

        let outcome = fx
            .service
            .request_code(&fx.invitation.id, meta(), at(10, 6))
            .await
            .unwrap();
        assert_eq!(outcome.send_count, 2);
    }

    #[tokio::test]
    async fn request_code_send_cap_is_hard() {
        let fx = fixture().await;
        for i in 0..5 {
            fx.service
                .request_code(&fx.invitation.id, meta(), at(10, 1 + i * 2))
                .await
                .unwrap();
        }

        // long after the cooldown, the cap still denies
        let err = fx
            .service
            .request_code(&fx.invitation.id, meta(), at(10, 55))
            .await
            .unwrap_err();
        match err {
            AttendanceError::RateLimited(reason) => assert!(reason.contains("Maximum of 5")),
            other => panic!("expected RateLimited, got {:?}", other),
        }
        assert_eq!(fx.delivery.count(), 5);
    }

    #[tokio::test]
    async fn concurrent_requests_cannot_exceed_send_cap() {
        let fx = fixture().await;
        for i in 0..4 {
            fx.service
                .request_code(&fx.invitation.id, meta(), at(10, 1 + i * 2))
                .await
                .unwrap();
        }

        // one send left in the budget: of two simultaneous requests,
        // exactly one may take it
        let (a, b) = tokio::join!(
            fx.service.request_code(&fx.invitation.id, meta(), at(10, 9)),
            fx.service.request_code(&fx.invitation.id, meta(), at(10, 9)),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        for outcome in [a, b] {
            if let Err(err) = outcome {
                assert!(matches!(err, AttendanceError::RateLimited(_)));
            }
        }

        let stored = fx.store.get_invitation(&fx.invitation.id).await.unwrap();
        assert_eq!(stored.code_send_count, 5);
        assert_eq!(fx.delivery.count(), 5);
    }

    #[tokio::test]
    async fn concurrent_mismatches_cannot_exceed_attempt_budget() {
        let fx = fixture().await;
        fx.service
            .request_code(&fx.invitation.id, meta(), at(10, 1))
            .await
            .unwrap();
        let code = fx.delivery.last_code();
        let wrong = if code == "0000" { "0001" } else { "0000" };

        for _ in 0..4 {
            let err = fx
                .service
                .verify_code(&fx.invitation.id, wrong, meta(), at(10, 2))
                .await
                .unwrap_err();
            assert!(matches!(err, AttendanceError::CodeMismatch { .. }));
        }

        let (a, b) = tokio::join!(
            fx.service.verify_code(&fx.invitation.id, wrong, meta(), at(10, 3)),
            fx.service.verify_code(&fx.invitation.id, wrong, meta(), at(10, 3)),
        );
        let errs = [a.unwrap_err(), b.unwrap_err()];
        let mismatches = errs
            .iter()
            .filter(|e| matches!(e, AttendanceError::CodeMismatch { .. }))
            .count();
        let limited = errs
            .iter()
            .filter(|e| matches!(e, AttendanceError::RateLimited(_)))
            .count();
        assert_eq!((mismatches, limited), (1, 1));

        let stored = fx.store.get_invitation(&fx.invitation.id).await.unwrap();
        assert_eq!(stored.verify_attempt_count, 5);
    }

    #[tokio::test]
    async fn delivery_failure_keeps_state_change() {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let audit = Arc::new(MemoryAuditLog::new());
        let booking = seed_booking(&store, BookingStatus::Confirmed).await;
        let invitation = seed_invitation(&store, &booking, "x@example.com").await;
        let service = AttendanceService::new(
            store.clone(),
            audit.clone(),
            Arc::new(FailingDelivery),
            AttendanceConfig::test(),
        );

        let outcome = service
            .request_code(&invitation.id, meta(), at(10, 5))
            .await
            .unwrap();
        assert!(!outcome.delivered);

        let stored = store.get_invitation(&invitation.id).await.unwrap();
        assert!(stored.has_active_code());
        assert_eq!(stored.code_send_count, 1);
    }

    #[tokio::test]
    async fn verify_happy_path_then_replay_rejected() {
        let fx = fixture().await;
        fx.service
            .request_code(&fx.invitation.id, meta(), at(10, 5))
            .await
            .unwrap();
        let code = fx.delivery.last_code();

        let checked_in_at = fx
            .service
            .verify_code(&fx.invitation.id, &code, meta(), at(10, 10))
            .await
            .unwrap();
        assert_eq!(checked_in_at, at(10, 10));

        let stored = fx.store.get_invitation(&fx.invitation.id).await.unwrap();
        assert!(stored.present);
        assert_eq!(stored.checked_in_at, Some(at(10, 10)));
        assert!(!stored.has_active_code());

        // same code again: the digest is gone, so this is AlreadyCheckedIn
        let err = fx
            .service
            .verify_code(&fx.invitation.id, &code, meta(), at(10, 11))
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::AlreadyCheckedIn));

        let verified = fx
            .audit
            .count(
                EventFilter::new()
                    .invitation_id(fx.invitation.id)
                    .action(AttendanceAction::CodeVerified),
            )
            .await
            .unwrap();
        assert_eq!(verified, 1);
    }

    #[tokio::test]
    async fn verify_mismatch_spends_attempt_budget() {
        let fx = fixture().await;
        fx.service
            .request_code(&fx.invitation.id, meta(), at(10, 5))
            .await
            .unwrap();
        let code = fx.delivery.last_code();
        let wrong = if code == "0000" { "0001" } else { "0000" };

        let err = fx
            .service
            .verify_code(&fx.invitation.id, wrong, meta(), at(10, 6))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AttendanceError::CodeMismatch {
                attempts_remaining: 4
            }
        ));

        let stored = fx.store.get_invitation(&fx.invitation.id).await.unwrap();
        assert_eq!(stored.verify_attempt_count, 1);
        assert!(stored.checked_in_at.is_none());

        let failed = fx
            .audit
            .count(
                EventFilter::new()
                    .invitation_id(fx.invitation.id)
                    .action(AttendanceAction::CodeFailed),
            )
            .await
            .unwrap();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn verify_rate_limits_then_cooldown_reopens() {
        let fx = fixture().await;
        fx.service
            .request_code(&fx.invitation.id, meta(), at(10, 1))
            .await
            .unwrap();
        let code = fx.delivery.last_code();
        let wrong = if code == "0000" { "0001" } else { "0000" };

        for _ in 0..5 {
            let err = fx
                .service
                .verify_code(&fx.invitation.id, wrong, meta(), at(10, 2))
                .await
                .unwrap_err();
            assert!(matches!(err, AttendanceError::CodeMismatch { .. }));
        }

        // budget exhausted, still inside the cooldown
        let err = fx
            .service
            .verify_code(&fx.invitation.id, wrong, meta(), at(10, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::RateLimited(_)));

        // cooldown elapsed: counter resets and a fresh window opens
        let err = fx
            .service
            .verify_code(&fx.invitation.id, wrong, meta(), at(10, 17))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AttendanceError::CodeMismatch {
                attempts_remaining: 4
            }
        ));

        // and the right code still works
        fx.service
            .verify_code(&fx.invitation.id, &code, meta(), at(10, 18))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn verify_without_issued_code() {
        let fx = fixture().await;
        let err = fx
            .service
            .verify_code(&fx.invitation.id, "1234", meta(), at(10, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::CodeNotIssued));
    }

    #[tokio::test]
    async fn verify_expired_code() {
        let fx = fixture().await;
        fx.service
            .request_code(&fx.invitation.id, meta(), at(10, 5))
            .await
            .unwrap();
        let code = fx.delivery.last_code();

        let err = fx
            .service
            .verify_code(&fx.invitation.id, &code, meta(), at(11, 20))
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::CodeExpired));
    }

    #[tokio::test]
    async fn verify_rejects_malformed_input_without_spending_budget() {
        let fx = fixture().await;
        fx.service
            .request_code(&fx.invitation.id, meta(), at(10, 5))
            .await
            .unwrap();

        for bad in ["123", "12345", "12a4", ""] {
            let err = fx
                .service
                .verify_code(&fx.invitation.id, bad, meta(), at(10, 6))
                .await
                .unwrap_err();
            assert!(matches!(err, AttendanceError::InvalidCodeFormat));
        }

        let stored = fx.store.get_invitation(&fx.invitation.id).await.unwrap();
        assert_eq!(stored.verify_attempt_count, 0);
    }

    #[tokio::test]
    async fn organizer_check_in_is_recorded_once() {
        let fx = fixture().await;
        fx.service
            .organizer_check_in(&fx.booking.id, meta(), at(10, 2))
            .await
            .unwrap();

        let err = fx
            .service
            .organizer_check_in(&fx.booking.id, meta(), at(10, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::AlreadyCheckedIn));

        let events = fx
            .audit
            .count(
                EventFilter::new()
                    .booking_id(fx.booking.id)
                    .action(AttendanceAction::CheckIn),
            )
            .await
            .unwrap();
        assert_eq!(events, 1);
    }

    #[tokio::test]
    async fn qr_gate_requires_organizer() {
        let fx = fixture().await;
        let now = at(10, 10);

        let ctx = fx
            .service
            .get_occupancy_context(&fx.booking.id, now)
            .await
            .unwrap();
        assert!(!ctx.show_qr);
        let err = fx
            .service
            .issue_qr_token(&fx.booking.id, now)
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::QrUnavailable));

        fx.service
            .organizer_check_in(&fx.booking.id, meta(), at(10, 2))
            .await
            .unwrap();

        let ctx = fx
            .service
            .get_occupancy_context(&fx.booking.id, now)
            .await
            .unwrap();
        assert!(ctx.show_qr);
        let token = fx.service.issue_qr_token(&fx.booking.id, now).await.unwrap();
        assert!(fx.service.verify_qr_token(&token, at(10, 20)).is_some());

        // gate closes again with the window
        let err = fx
            .service
            .issue_qr_token(&fx.booking.id, at(12, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::QrUnavailable));
    }

    #[tokio::test]
    async fn qr_token_honors_configured_ttl() {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let audit = Arc::new(MemoryAuditLog::new());
        let booking = seed_booking(&store, BookingStatus::Confirmed).await;
        let mut config = AttendanceConfig::test();
        config.token_ttl_minutes = 2;
        let service = AttendanceService::new(
            store.clone(),
            audit,
            Arc::new(RecordingDelivery::new()),
            config,
        );

        service
            .organizer_check_in(&booking.id, meta(), at(10, 2))
            .await
            .unwrap();
        let token = service.issue_qr_token(&booking.id, at(10, 10)).await.unwrap();

        assert!(service.verify_qr_token(&token, at(10, 11)).is_some());
        assert!(service.verify_qr_token(&token, at(10, 12)).is_none());
    }

    #[tokio::test]
    async fn view_occupancy_via_token() {
        let fx = fixture().await;
        fx.service
            .organizer_check_in(&fx.booking.id, meta(), at(10, 2))
            .await
            .unwrap();
        for email in ["b@example.com", "c@example.com"] {
            seed_invitation(&fx.store, &fx.booking, email).await;
        }
        fx.service
            .request_code(&fx.invitation.id, meta(), at(10, 5))
            .await
            .unwrap();
        let code = fx.delivery.last_code();
        fx.service
            .verify_code(&fx.invitation.id, &code, meta(), at(10, 8))
            .await
            .unwrap();

        let token = fx
            .service
            .issue_qr_token(&fx.booking.id, at(10, 10))
            .await
            .unwrap();
        let summary = fx
            .service
            .view_occupancy(&token, at(10, 12))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.present, 1);
        assert_eq!(summary.accepted, 3);
        assert_eq!(summary.capacity, 10);
        assert_eq!(summary.percentage, 10);
        assert_eq!(summary.status, OccupancyStatus::Low);

        // garbage and expired tokens are uniformly unauthorized
        assert!(fx
            .service
            .view_occupancy("not-a-token", at(10, 12))
            .await
            .unwrap()
            .is_none());
        assert!(fx
            .service
            .view_occupancy(&token, at(10, 40))
            .await
            .unwrap()
            .is_none());
    }
}
