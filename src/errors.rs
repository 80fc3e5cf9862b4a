use sea_orm::error::DbErr;
use serde::Serialize;
use uuid::Uuid;

/// Error taxonomy for the order engine.
///
/// Money- and inventory-affecting errors are always propagated to the caller;
/// notification and audit failures are logged at the call site and never
/// surface through this type.
#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Gateway error: {message}")]
    GatewayError { message: String, retryable: bool },

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// Gateway failure that is safe to retry (timeouts, 5xx).
    pub fn gateway_retryable(message: impl Into<String>) -> Self {
        ServiceError::GatewayError {
            message: message.into(),
            retryable: true,
        }
    }

    /// Gateway failure that must not be retried blindly.
    pub fn gateway_rejected(message: impl Into<String>) -> Self {
        ServiceError::GatewayError {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether a caller may safely re-invoke the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::GatewayError { retryable: true, .. } | ServiceError::CacheError(_)
        )
    }
}
