use axum::http::StatusCode;
use sqlx::{error::DatabaseError, Error as SqlxError};
use tracing::error;

pub use common::api::ErrorKind;

/// Operation error crossing the service boundary.
///
/// Persistence stays on `anyhow::Result`; everything above it speaks
/// `OpResult` so the RPC serializer can map kinds to statuses mechanically.
#[derive(Debug)]
pub struct OpError {
    pub kind: ErrorKind,
    pub message: String,
}

pub type OpResult<T> = std::result::Result<T, OpError>;

const DB_UNAVAILABLE_MESSAGE: &str = "store temporarily unavailable";

impl OpError {
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidParameter,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            message: msg.into(),
        }
    }

    pub fn operation_in_progress(cluster: impl std::fmt::Display) -> Self {
        Self {
            kind: ErrorKind::OperationInProgress,
            message: format!("an operation on cluster {cluster} is already in progress"),
        }
    }

    pub fn resource_limit_exceeded(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ResourceLimitExceeded,
            message: msg.into(),
        }
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotSupported,
            message: msg.into(),
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: msg.into(),
        }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            message: msg.into(),
        }
    }

    /// HTTP status the RPC serializer answers with for this kind.
    pub fn http_status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::InvalidParameter => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::OperationInProgress => StatusCode::CONFLICT,
            ErrorKind::ResourceLimitExceeded => StatusCode::FORBIDDEN,
            ErrorKind::NotSupported => StatusCode::BAD_REQUEST,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for OpError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbErrorKind {
    UniqueViolation,
    ForeignKeyViolation,
    NotNullViolation,
    CheckViolation,
    Busy,
}

fn map_anyhow_error(err: &anyhow::Error) -> Option<OpError> {
    let sqlx_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())?;
    map_sqlx_error(sqlx_err)
}

fn map_sqlx_error(err: &SqlxError) -> Option<OpError> {
    match err {
        SqlxError::RowNotFound => Some(OpError::not_found("record not found")),
        SqlxError::Database(db_err) => map_database_error(db_err.as_ref()),
        SqlxError::PoolTimedOut | SqlxError::PoolClosed => {
            Some(OpError::transient(DB_UNAVAILABLE_MESSAGE))
        }
        SqlxError::Io(_) | SqlxError::Tls(_) => Some(OpError::transient(DB_UNAVAILABLE_MESSAGE)),
        _ => None,
    }
}

fn map_database_error(err: &dyn DatabaseError) -> Option<OpError> {
    let kind = classify_db_error(err.code().as_deref(), err.message())?;
    match kind {
        DbErrorKind::UniqueViolation => Some(OpError::conflict("record already exists")),
        DbErrorKind::ForeignKeyViolation => Some(OpError::invalid_parameter("invalid reference")),
        DbErrorKind::NotNullViolation => {
            Some(OpError::invalid_parameter("missing required field"))
        }
        DbErrorKind::CheckViolation => Some(OpError::invalid_parameter("invalid record")),
        DbErrorKind::Busy => Some(OpError::transient(DB_UNAVAILABLE_MESSAGE)),
    }
}

fn classify_db_error(code: Option<&str>, message: &str) -> Option<DbErrorKind> {
    let code = code.unwrap_or_default();
    let message = message.to_ascii_lowercase();

    if matches!(code, "2067" | "1555")
        || message.contains("unique constraint")
        || message.contains("duplicate key")
    {
        return Some(DbErrorKind::UniqueViolation);
    }

    if code == "787" || message.contains("foreign key constraint") {
        return Some(DbErrorKind::ForeignKeyViolation);
    }

    if message.contains("not null constraint") {
        return Some(DbErrorKind::NotNullViolation);
    }

    if message.contains("check constraint") {
        return Some(DbErrorKind::CheckViolation);
    }

    if message.contains("database is locked") || message.contains("database is busy") {
        return Some(DbErrorKind::Busy);
    }

    None
}

pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    let Some(sqlx_err) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())
    else {
        return false;
    };

    match sqlx_err {
        SqlxError::Database(db_err) => matches!(
            classify_db_error(db_err.code().as_deref(), db_err.message()),
            Some(DbErrorKind::UniqueViolation)
        ),
        _ => false,
    }
}

impl From<anyhow::Error> for OpError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(op_err) = err.downcast_ref::<OpError>() {
            return OpError {
                kind: op_err.kind,
                message: op_err.message.clone(),
            };
        }

        if let Some(mapped) = map_anyhow_error(&err) {
            if mapped.kind == ErrorKind::Transient {
                crate::telemetry::record_store_error(&err);
            }
            return mapped;
        }

        crate::telemetry::record_internal_error(&err);
        error!(?err, "internal error");
        OpError::transient("internal conductor error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_db_error_detects_unique_constraints() {
        assert_eq!(
            classify_db_error(Some("2067"), "UNIQUE constraint failed: clusters.uuid"),
            Some(DbErrorKind::UniqueViolation)
        );
        assert_eq!(
            classify_db_error(None, "UNIQUE constraint failed: federations.name"),
            Some(DbErrorKind::UniqueViolation)
        );
    }

    #[test]
    fn classify_db_error_detects_busy_database() {
        assert_eq!(
            classify_db_error(None, "database is locked"),
            Some(DbErrorKind::Busy)
        );
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = OpError::from(anyhow::Error::new(SqlxError::RowNotFound));
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn op_error_survives_anyhow_round_trip() {
        let original = OpError::operation_in_progress("c1");
        let err = OpError::from(anyhow::Error::new(original));
        assert_eq!(err.kind, ErrorKind::OperationInProgress);
        assert!(err.message.contains("c1"));
    }

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            OpError::operation_in_progress("c").http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            OpError::resource_limit_exceeded("q").http_status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            OpError::transient("t").http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
