use rusqlite::ffi;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INVALID_MEASURE: {0}")]
    InvalidMeasure(String),
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),
    #[error("CONFLICT: {0}")]
    Conflict(String),
    #[error("STALE_METRICS: {0}")]
    StaleMetrics(String),
    #[error("SCORING_POLICY_ERROR: {0}")]
    ScoringPolicy(String),
    #[error("MIGRATION_STATE_ERROR: {0}")]
    MigrationState(String),
    #[error("DESTRUCTIVE_ACTION_REQUIRES_CONFIRMATION: {0}")]
    DestructiveActionRequiresConfirmation(String),
    #[error("ACCESS_DENIED: {0}")]
    AccessDenied(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidMeasure(_) => "INVALID_MEASURE",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Conflict(_) => "CONFLICT",
            Self::StaleMetrics(_) => "STALE_METRICS",
            Self::ScoringPolicy(_) => "SCORING_POLICY_ERROR",
            Self::MigrationState(_) => "MIGRATION_STATE_ERROR",
            Self::DestructiveActionRequiresConfirmation(_) => "DESTRUCTIVE_ACTION_REQUIRES_CONFIRMATION",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::Io(_) => "IO_FAILURE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// "Nothing to do" rather than "failed".
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::StaleMetrics(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(format!("{value:#}"))
    }
}

/// Maps a raw store failure onto the caller-facing taxonomy. Constraint
/// violations keep the store's message; everything else stays `Internal`.
pub fn classify_store_error(error: rusqlite::Error, context: &str) -> AppError {
    if let rusqlite::Error::SqliteFailure(failure, message) = &error {
        let detail = message.clone().unwrap_or_else(|| failure.to_string());
        match failure.extended_code {
            ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                return AppError::Conflict(format!("{context}: {detail}"));
            }
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                return AppError::NotFound(format!("{context}: {detail}"));
            }
            ffi::SQLITE_CONSTRAINT_TRIGGER | ffi::SQLITE_CONSTRAINT_CHECK | ffi::SQLITE_CONSTRAINT_NOTNULL => {
                return AppError::InvalidInput(format!("{context}: {detail}"));
            }
            _ => {}
        }
    }
    AppError::Internal(format!("{context}: {error}"))
}

pub type AppResult<T> = Result<T, AppError>;
