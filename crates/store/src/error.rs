//! Error type shared by every backend

use sqlx::error::ErrorKind;
use tracing::error;

/// Error type for store operations
///
/// A missing row is not an error: point lookups return `Ok(None)` so callers
/// can tell "never existed" apart from "engine unreachable".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing engine could not be reached (pool creation, acquisition timeout, I/O)
    #[error("connection error: {0}")]
    Connection(String),

    /// A referential, not-null or check constraint rejected the write
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Any other failure reported by the backing engine
    #[error("database error: {0}")]
    Database(String),

    /// Structured payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Partial update with no assignments
    #[error("empty update for {entity} {id}")]
    EmptyUpdate { entity: &'static str, id: i64 },

    /// Column name that is unknown, reserved or given a value of the wrong type
    #[error("invalid column for {entity}: {reason}")]
    InvalidColumn { entity: &'static str, reason: String },

    /// Invalid store configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether the error means the backing engine is unreachable
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Whether the error is a rejected referential or integrity constraint
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Classify a sqlx error into the store taxonomy
pub(crate) fn classify(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Database(db) => match db.kind() {
            ErrorKind::ForeignKeyViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::CheckViolation => StoreError::ConstraintViolation(db.to_string()),
            _ => StoreError::Database(db.to_string()),
        },
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_) => StoreError::Connection(e.to_string()),
        other => StoreError::Database(other.to_string()),
    }
}

/// Log and classify a sqlx error raised while performing `action`
pub(crate) fn db_error(action: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| {
        error!("Failed to {}: {}", action, e);
        classify(e)
    }
}
