//! Service configuration.
//!
//! Supports configuration via environment variables:
//!
//! ```bash
//! # Token signing secret, at least 32 bytes (required)
//! ROOMGATE_TOKEN_SECRET=...
//!
//! # Grace period after meeting end, in minutes (default 15)
//! # Negative values are rejected at startup.
//! ROOMGATE_GRACE_MINUTES=15
//!
//! # Attendance-view token lifetime, in minutes (default 15)
//! ROOMGATE_TOKEN_TTL_MINUTES=15
//! ```

use std::env;

use roomgate_token::{SigningSecret, TokenError};
use thiserror::Error;

/// Configuration errors. All are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid signing secret: {0}")]
    InvalidSecret(#[from] TokenError),

    #[error("Invalid grace minutes: {0}")]
    InvalidGraceMinutes(String),

    #[error("Invalid token ttl minutes: {0}")]
    InvalidTokenTtl(String),
}

/// Attendance service configuration.
#[derive(Clone, Debug)]
pub struct AttendanceConfig {
    /// Process-wide token signing secret.
    pub signing_secret: SigningSecret,
    /// Minutes after meeting end during which attendance stays open.
    pub grace_minutes: i64,
    /// Lifetime of issued attendance-view tokens, in minutes.
    pub token_ttl_minutes: i64,
}

impl AttendanceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let secret = env::var("ROOMGATE_TOKEN_SECRET")
            .map_err(|_| ConfigError::MissingEnvVar("ROOMGATE_TOKEN_SECRET".to_string()))?;
        let signing_secret = SigningSecret::new(secret.into_bytes())?;

        let grace_minutes = match env::var("ROOMGATE_GRACE_MINUTES") {
            Ok(v) => v
                .parse::<i64>()
                .ok()
                .filter(|m| *m >= 0)
                .ok_or(ConfigError::InvalidGraceMinutes(v))?,
            Err(_) => roomgate_policy::GRACE_MINUTES,
        };

        let token_ttl_minutes = match env::var("ROOMGATE_TOKEN_TTL_MINUTES") {
            Ok(v) => v
                .parse::<i64>()
                .ok()
                .filter(|m| *m > 0)
                .ok_or(ConfigError::InvalidTokenTtl(v))?,
            Err(_) => roomgate_token::TOKEN_TTL_MINS,
        };

        Ok(Self {
            signing_secret,
            grace_minutes,
            token_ttl_minutes,
        })
    }

    /// Fixed configuration for tests.
    pub fn test() -> Self {
        Self {
            signing_secret: SigningSecret::new(*b"roomgate-test-secret-0123456789abc")
                .unwrap_or_else(|_| unreachable!()),
            grace_minutes: roomgate_policy::GRACE_MINUTES,
            token_ttl_minutes: roomgate_token::TOKEN_TTL_MINS,
        }
    }
}
