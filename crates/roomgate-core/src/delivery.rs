//! Code delivery abstraction and e-mail content.
//!
//! The service hands the plaintext code to a [`CodeDelivery`]
//! implementation exactly once, right after the digest is persisted. The
//! plaintext never appears in logs or audit payloads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Delivery error.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Failed to send code email: {0}")]
    SendFailed(String),
}

/// A code e-mail ready for delivery.
pub struct CodeEmail {
    pub to_address: String,
    pub to_name: Option<String>,
    pub meeting_title: String,
    pub room_name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub code: String,
}

impl std::fmt::Debug for CodeEmail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeEmail")
            .field("to_address", &self.to_address)
            .field("meeting_title", &self.meeting_title)
            .field("room_name", &self.room_name)
            .field("code", &"[redacted]")
            .finish_non_exhaustive()
    }
}

/// Trait for code delivery providers.
#[async_trait]
pub trait CodeDelivery: Send + Sync {
    /// Send an attendance code e-mail.
    async fn send_code(&self, email: &CodeEmail) -> Result<(), DeliveryError>;
}

/// Rendered content for code e-mails.
pub struct CodeEmailContent {
    pub subject: String,
    pub text: String,
}

impl CodeEmailContent {
    /// Render the code e-mail for the given message.
    pub fn new(email: &CodeEmail) -> Self {
        let greeting = match &email.to_name {
            Some(name) => format!("Hi {},", name),
            None => "Hi,".to_string(),
        };
        Self {
            subject: format!("Your attendance code for {}", email.meeting_title),
            text: format!(
                r#"{greeting}

Your attendance code for "{title}" in {room} is: {code}

The meeting runs from {start} to {end} (UTC). The code stops working
shortly after the meeting ends.

If you didn't request this code, please ignore this email."#,
                greeting = greeting,
                title = email.meeting_title,
                room = email.room_name,
                code = email.code,
                start = email.starts_at.format("%Y-%m-%d %H:%M"),
                end = email.ends_at.format("%H:%M"),
            ),
        }
    }
}
