use std::fmt;
use thiserror::Error;

/// Phase of the chunked media upload a failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Init,
    Append,
    Finalize,
    Status,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadPhase::Init => "INIT",
            UploadPhase::Append => "APPEND",
            UploadPhase::Finalize => "FINALIZE",
            UploadPhase::Status => "STATUS",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Object storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing fields in config: {}", .fields.join(", "))]
    MissingConfigFields { fields: Vec<String> },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Caption is too long: {length} characters (limit {limit})")]
    CaptionTooLong { length: usize, limit: usize },

    #[error("Payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Invalid file type: {name}. Only .png, .jpg and .jpeg are supported.")]
    UnsupportedMediaType { name: String },

    #[error("Payload declared {declared} bytes but {streamed} bytes were read")]
    PayloadSizeMismatch { declared: u64, streamed: u64 },

    #[error("Upload failed during {phase}{}: {reason}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    UploadFailed {
        phase: UploadPhase,
        status: Option<u16>,
        reason: String,
    },

    #[error("Media {media_id} failed server-side processing: {reason}")]
    ProcessingFailed { media_id: String, reason: String },

    #[error("Media {media_id} still '{state}' after the {budget_secs}s processing budget")]
    ProcessingTimedOut {
        media_id: String,
        state: String,
        budget_secs: u64,
    },

    #[error("Publish failed{}: {reason}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    PublishFailed { status: Option<u16>, reason: String },

    /// The endpoint accepted the announcement but its reply names no id.
    #[error("Announcement accepted (HTTP {status}) but no reference came back: {reason}")]
    AnnouncementUnconfirmed { status: u16, reason: String },

    #[error("Invalid upload session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Upload cancelled during {phase} for session {session_id}")]
    UploadCancelled { phase: String, session_id: String },

    #[error("Catalog item {id} does not exist")]
    UnknownItem { id: i64 },

    #[error("Another dispatch is already running (PID {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Custom result type
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(field: &str, message: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn unsupported_media_type(name: &str) -> Self {
        Self::UnsupportedMediaType {
            name: name.to_string(),
        }
    }

    pub fn upload_failed(phase: UploadPhase, status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::UploadFailed {
            phase,
            status,
            reason: reason.into(),
        }
    }

    pub fn upload_cancelled(phase: &str, session_id: &str) -> Self {
        Self::UploadCancelled {
            phase: phase.to_string(),
            session_id: session_id.to_string(),
        }
    }

    /// Errors tied to the item's own data. Rerunning on the same item
    /// reproduces them.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AppError::Validation { .. }
                | AppError::CaptionTooLong { .. }
                | AppError::PayloadTooLarge { .. }
                | AppError::UnsupportedMediaType { .. }
                | AppError::PayloadSizeMismatch { .. }
        )
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AppError::Config(_) | AppError::MissingConfigFields { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_are_listed_together() {
        let err = AppError::MissingConfigFields {
            fields: vec!["api_key".to_string(), "db_path".to_string()],
        };
        assert_eq!(err.to_string(), "Missing fields in config: api_key, db_path");
        assert!(err.is_configuration());
    }

    #[test]
    fn upload_failure_mentions_phase_and_status() {
        let err = AppError::upload_failed(UploadPhase::Append, Some(503), "unavailable");
        assert_eq!(
            err.to_string(),
            "Upload failed during APPEND (HTTP 503): unavailable"
        );

        let err = AppError::upload_failed(UploadPhase::Init, None, "no media id");
        assert_eq!(err.to_string(), "Upload failed during INIT: no media id");
    }

    #[test]
    fn validation_errors_are_permanent() {
        assert!(AppError::CaptionTooLong { length: 281, limit: 280 }.is_permanent());
        assert!(AppError::unsupported_media_type("a.gif").is_permanent());
        assert!(!AppError::upload_failed(UploadPhase::Finalize, Some(500), "x").is_permanent());
    }
}
