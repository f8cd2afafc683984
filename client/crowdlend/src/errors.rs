//! Application-wide error types.

use reqwest::StatusCode;
use thiserror::Error;

use crate::payment::PaymentKind;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Bad local input. Raised before any request is sent.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The backend answered with a non-2xx status.
    #[error("HTTP {status}: {}", .message.as_deref().unwrap_or("no message"))]
    Http {
        status: StatusCode,
        message: Option<String>,
    },

    /// A 2xx payload was missing the fields we depend on.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("A {kind} for campaign {campaign_id} is already in progress")]
    PaymentInFlight { campaign_id: u64, kind: PaymentKind },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// `true` when the backend rejected the session credential.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Http { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The message the backend sent with a non-2xx response, if any.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Http {
                message: Some(m), ..
            } if !m.trim().is_empty() => Some(m.as_str()),
            _ => None,
        }
    }

    /// Text to show a person: the server's own message when it sent one,
    /// the validation text for local input errors, `fallback` otherwise.
    pub fn user_message(&self, fallback: &str) -> String {
        if let Some(m) = self.server_message() {
            return m.to_string();
        }
        match self {
            Self::Validation(m) => m.clone(),
            Self::PaymentInFlight { .. } => self.to_string(),
            _ => fallback.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
