//! SQLite-backed [`Store`] and [`AuditLog`] implementation.
//!
//! Timestamps are persisted as unix seconds, UUIDs as text. The compound
//! invitation updates are single UPDATE statements so their columns move
//! together, and check-in is a conditional write on `checked_in_at IS
//! NULL` so exactly one concurrent verifier can win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roomgate_audit::{
    AttendanceEvent, AttendanceEventId, AuditLog, AuditLogError, EventFilter, EventPayload,
    RequestMeta,
};
use roomgate_storage::{
    Booking, BookingId, BookingStatus, CreateBookingParams, CreateInvitationParams, Invitation,
    InvitationId, InvitationStatus, IssuedCode, Store, StoreError,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::open("sqlite::memory:").await
    }

    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self { pool })
    }
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn unique_or_backend(e: sqlx::Error) -> StoreError {
    let s = e.to_string();
    if s.contains("UNIQUE") {
        StoreError::AlreadyExists
    } else {
        StoreError::Backend(s)
    }
}

fn ts(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| StoreError::Backend(format!("timestamp out of range: {}", secs)))
}

fn ts_opt(secs: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    secs.map(ts).transpose()
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::try_parse(s).map_err(backend)
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: String,
    title: String,
    room_name: String,
    room_capacity: i64,
    status: String,
    start_time: i64,
    end_time: i64,
    organizer_checked_in_at: Option<i64>,
    created_at: i64,
}

impl BookingRow {
    fn into_booking(self) -> Result<Booking, StoreError> {
        Ok(Booking {
            id: BookingId(parse_uuid(&self.id)?),
            title: self.title,
            room_name: self.room_name,
            room_capacity: self.room_capacity as i32,
            status: self.status.parse::<BookingStatus>().map_err(backend)?,
            start_time: ts(self.start_time)?,
            end_time: ts(self.end_time)?,
            organizer_checked_in_at: ts_opt(self.organizer_checked_in_at)?,
            created_at: ts(self.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InvitationRow {
    id: String,
    booking_id: String,
    email: String,
    display_name: Option<String>,
    status: String,
    present: i64,
    code_hash: Option<String>,
    code_salt: Option<String>,
    code_expires_at: Option<i64>,
    code_send_count: i64,
    code_last_sent_at: Option<i64>,
    verify_attempt_count: i64,
    verify_last_attempt_at: Option<i64>,
    checked_in_at: Option<i64>,
    created_at: i64,
}

impl InvitationRow {
    fn into_invitation(self) -> Result<Invitation, StoreError> {
        Ok(Invitation {
            id: InvitationId(parse_uuid(&self.id)?),
            booking_id: BookingId(parse_uuid(&self.booking_id)?),
            email: self.email,
            display_name: self.display_name,
            status: self.status.parse::<InvitationStatus>().map_err(backend)?,
            present: self.present != 0,
            code_hash: self.code_hash,
            code_salt: self.code_salt,
            code_expires_at: ts_opt(self.code_expires_at)?,
            code_send_count: self.code_send_count as i32,
            code_last_sent_at: ts_opt(self.code_last_sent_at)?,
            verify_attempt_count: self.verify_attempt_count as i32,
            verify_last_attempt_at: ts_opt(self.verify_last_attempt_at)?,
            checked_in_at: ts_opt(self.checked_in_at)?,
            created_at: ts(self.created_at)?,
        })
    }
}

const INVITATION_COLS: &str = "id,booking_id,email,display_name,status,present,\
     code_hash,code_salt,code_expires_at,code_send_count,code_last_sent_at,\
     verify_attempt_count,verify_last_attempt_at,checked_in_at,created_at";

impl SqliteStore {
    async fn fetch_invitation(&self, id: &InvitationId) -> Result<Invitation, StoreError> {
        let row = sqlx::query_as::<_, InvitationRow>(&format!(
            "SELECT {} FROM invitations WHERE id=?",
            INVITATION_COLS
        ))
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => row.into_invitation(),
            None => Err(StoreError::NotFound),
        }
    }

    async fn invitation_exists(&self, id: &InvitationId) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM invitations WHERE id=?")
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_booking(&self, params: CreateBookingParams) -> Result<Booking, StoreError> {
        let id = BookingId::new();
        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO bookings(id,title,room_name,room_capacity,status,start_time,end_time,created_at)
             VALUES(?,?,?,?,?,?,?,?)",
        )
        .bind(id.0.to_string())
        .bind(&params.title)
        .bind(&params.room_name)
        .bind(params.room_capacity as i64)
        .bind(params.status.to_string())
        .bind(params.start_time.timestamp())
        .bind(params.end_time.timestamp())
        .bind(created_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        self.get_booking(&id).await
    }

    async fn get_booking(&self, id: &BookingId) -> Result<Booking, StoreError> {
        let row = sqlx::query_as::<_, BookingRow>(
            "SELECT id,title,room_name,room_capacity,status,start_time,end_time,
                    organizer_checked_in_at,created_at
             FROM bookings WHERE id=?",
        )
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => row.into_booking(),
            None => Err(StoreError::NotFound),
        }
    }

    async fn set_organizer_checked_in(
        &self,
        id: &BookingId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE bookings SET organizer_checked_in_at=?
             WHERE id=? AND organizer_checked_in_at IS NULL",
        )
        .bind(at.timestamp())
        .bind(id.0.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            // Either the booking is missing or check-in already happened.
            self.get_booking(id).await?;
            return Err(StoreError::Conflict);
        }
        Ok(())
    }

    async fn create_invitation(
        &self,
        params: CreateInvitationParams,
    ) -> Result<Invitation, StoreError> {
        // FK enforcement is off by default in SQLite; check explicitly.
        self.get_booking(&params.booking_id).await?;

        let id = InvitationId::new();
        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO invitations(id,booking_id,email,display_name,status,created_at)
             VALUES(?,?,?,?,?,?)",
        )
        .bind(id.0.to_string())
        .bind(params.booking_id.0.to_string())
        .bind(params.email.trim().to_lowercase())
        .bind(&params.display_name)
        .bind(params.status.to_string())
        .bind(created_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(unique_or_backend)?;

        self.fetch_invitation(&id).await
    }

    async fn get_invitation(&self, id: &InvitationId) -> Result<Invitation, StoreError> {
        self.fetch_invitation(id).await
    }

    async fn list_invitations(
        &self,
        booking_id: &BookingId,
    ) -> Result<Vec<Invitation>, StoreError> {
        let rows = sqlx::query_as::<_, InvitationRow>(&format!(
            "SELECT {} FROM invitations WHERE booking_id=? ORDER BY created_at, id",
            INVITATION_COLS
        ))
        .bind(booking_id.0.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(|r| r.into_invitation()).collect()
    }

    async fn set_invitation_status(
        &self,
        id: &InvitationId,
        status: InvitationStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE invitations SET status=? WHERE id=?")
            .bind(status.to_string())
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn store_issued_code(
        &self,
        id: &InvitationId,
        code: IssuedCode,
        max_send_count: i32,
    ) -> Result<Invitation, StoreError> {
        // The cap lives in the WHERE clause so a stale snapshot read by a
        // concurrent caller cannot push the counter past it.
        let result = sqlx::query(
            "UPDATE invitations
             SET code_hash=?, code_salt=?, code_expires_at=?,
                 code_send_count=code_send_count+1, code_last_sent_at=?,
                 verify_attempt_count=0, verify_last_attempt_at=NULL
             WHERE id=? AND code_send_count < ?",
        )
        .bind(&code.code_hash)
        .bind(&code.code_salt)
        .bind(code.expires_at.timestamp())
        .bind(code.sent_at.timestamp())
        .bind(id.0.to_string())
        .bind(max_send_count as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            if self.invitation_exists(id).await? {
                return Err(StoreError::Conflict);
            }
            return Err(StoreError::NotFound);
        }
        self.fetch_invitation(id).await
    }

    async fn record_verify_failure(
        &self,
        id: &InvitationId,
        at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<i32, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE invitations
             SET verify_attempt_count=verify_attempt_count+1, verify_last_attempt_at=?
             WHERE id=? AND verify_attempt_count < ?
             RETURNING verify_attempt_count",
        )
        .bind(at.timestamp())
        .bind(id.0.to_string())
        .bind(max_attempts as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some((count,)) => Ok(count as i32),
            None => {
                if self.invitation_exists(id).await? {
                    Err(StoreError::Conflict)
                } else {
                    Err(StoreError::NotFound)
                }
            }
        }
    }

    async fn reset_verify_attempts(&self, id: &InvitationId) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE invitations SET verify_attempt_count=0 WHERE id=?")
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn mark_checked_in(
        &self,
        id: &InvitationId,
        at: DateTime<Utc>,
    ) -> Result<Invitation, StoreError> {
        let result = sqlx::query(
            "UPDATE invitations
             SET checked_in_at=?, present=1, code_hash=NULL, code_salt=NULL, code_expires_at=NULL
             WHERE id=? AND checked_in_at IS NULL",
        )
        .bind(at.timestamp())
        .bind(id.0.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            if self.invitation_exists(id).await? {
                return Err(StoreError::Conflict);
            }
            return Err(StoreError::NotFound);
        }
        self.fetch_invitation(id).await
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    action: String,
    booking_id: String,
    invitation_id: Option<String>,
    client_ip: Option<String>,
    user_agent: Option<String>,
    payload: Option<String>,
    created_at: i64,
}

impl EventRow {
    fn into_event(self) -> Result<AttendanceEvent, AuditLogError> {
        let db = |e: &dyn std::fmt::Display| AuditLogError::Database(e.to_string());
        let payload: Option<EventPayload> = self
            .payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| db(&e))?;
        Ok(AttendanceEvent {
            id: AttendanceEventId(Uuid::try_parse(&self.id).map_err(|e| db(&e))?),
            timestamp: DateTime::from_timestamp(self.created_at, 0)
                .ok_or_else(|| AuditLogError::Database("timestamp out of range".into()))?,
            action: self.action.parse().map_err(|e: String| db(&e))?,
            booking_id: Uuid::try_parse(&self.booking_id).map_err(|e| db(&e))?,
            invitation_id: self
                .invitation_id
                .as_deref()
                .map(Uuid::try_parse)
                .transpose()
                .map_err(|e| db(&e))?,
            meta: RequestMeta {
                client_ip: self.client_ip,
                user_agent: self.user_agent,
            },
            payload,
        })
    }
}

fn push_event_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &EventFilter) {
    if let Some(booking_id) = filter.booking_id {
        qb.push(" AND booking_id=").push_bind(booking_id.0.to_string());
    }
    if let Some(invitation_id) = filter.invitation_id {
        qb.push(" AND invitation_id=")
            .push_bind(invitation_id.0.to_string());
    }
    if let Some(action) = filter.action {
        qb.push(" AND action=").push_bind(action.to_string());
    }
    if let Some(from) = filter.from {
        qb.push(" AND created_at>=").push_bind(from.timestamp());
    }
    if let Some(to) = filter.to {
        qb.push(" AND created_at<").push_bind(to.timestamp());
    }
}

#[async_trait]
impl AuditLog for SqliteStore {
    async fn record(&self, event: AttendanceEvent) -> Result<(), AuditLogError> {
        let payload = event
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AuditLogError::Database(e.to_string()))?;

        sqlx::query(
            "INSERT INTO attendance_events(id,action,booking_id,invitation_id,client_ip,user_agent,payload,created_at)
             VALUES(?,?,?,?,?,?,?,?)",
        )
        .bind(event.id.0.to_string())
        .bind(event.action.to_string())
        .bind(event.booking_id.to_string())
        .bind(event.invitation_id.map(|i| i.to_string()))
        .bind(&event.meta.client_ip)
        .bind(&event.meta.user_agent)
        .bind(payload)
        .bind(event.timestamp.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| AuditLogError::Database(e.to_string()))?;

        Ok(())
    }

    async fn query(&self, filter: EventFilter) -> Result<Vec<AttendanceEvent>, AuditLogError> {
        let mut qb = QueryBuilder::new(
            "SELECT id,action,booking_id,invitation_id,client_ip,user_agent,payload,created_at
             FROM attendance_events WHERE 1=1",
        );
        push_event_filters(&mut qb, &filter);
        // UUIDv7 ids break ties within the same second
        qb.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
            if let Some(offset) = filter.offset {
                qb.push(" OFFSET ").push_bind(offset as i64);
            }
        } else if let Some(offset) = filter.offset {
            qb.push(" LIMIT -1 OFFSET ").push_bind(offset as i64);
        }

        let rows: Vec<EventRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AuditLogError::Database(e.to_string()))?;

        rows.into_iter().map(|r| r.into_event()).collect()
    }

    async fn get(&self, id: AttendanceEventId) -> Result<AttendanceEvent, AuditLogError> {
        let row = sqlx::query_as::<_, EventRow>(
            "SELECT id,action,booking_id,invitation_id,client_ip,user_agent,payload,created_at
             FROM attendance_events WHERE id=?",
        )
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AuditLogError::Database(e.to_string()))?;

        match row {
            Some(row) => row.into_event(),
            None => Err(AuditLogError::NotFound(id)),
        }
    }

    async fn count(&self, filter: EventFilter) -> Result<u64, AuditLogError> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM attendance_events WHERE 1=1");
        push_event_filters(&mut qb, &filter);

        let (n,): (i64,) = qb
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AuditLogError::Database(e.to_string()))?;
        Ok(n as u64)
    }
}
