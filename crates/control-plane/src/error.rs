use axum::http::{HeaderMap, StatusCode};
use sqlx::Error as SqlxError;
use sqlx::error::{DatabaseError, ErrorKind};
use tracing::error;

/// Error returned by HTTP handlers, rendered as `{"error", "code"}`.
///
/// `code` is the stable machine-readable part; agents and operator tooling
/// branch on it, never on `message`.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub headers: Option<Box<HeaderMap>>,
}

pub type ApiResult<T> = std::result::Result<T, AppError>;

const STORE_BUSY_MESSAGE: &str = "job and allocation store is busy, retry shortly";

// SQLITE_BUSY, SQLITE_LOCKED and their extended forms.
const SQLITE_BUSY_CODES: [&str; 5] = ["5", "6", "261", "262", "517"];

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            headers: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    }

    /// Bad operator token or agent signature.
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", msg)
    }

    /// Port allocation lost to concurrent allocators on every attempt.
    pub fn allocation_conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "allocation_conflict", msg)
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "unprocessable", msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
    }

    /// The agent's port check endpoint could not be reached or answered badly.
    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "agent_unreachable", msg)
    }

    /// A waiting dispatch gave up before the agent finished the job.
    pub fn gateway_timeout(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, "timeout", msg)
    }

    pub fn internal(msg: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(Box::new(headers));
        self
    }
}

fn sqlx_cause(err: &anyhow::Error) -> Option<&SqlxError> {
    err.chain().find_map(|cause| cause.downcast_ref::<SqlxError>())
}

fn is_busy(err: &dyn DatabaseError) -> bool {
    err.code()
        .is_some_and(|code| SQLITE_BUSY_CODES.contains(&code.as_ref()))
        || err.message().contains("database is locked")
}

fn map_sqlx_error(err: &SqlxError) -> Option<AppError> {
    match err {
        SqlxError::RowNotFound => Some(AppError::not_found("record not found")),
        SqlxError::Database(db_err) => map_database_error(db_err.as_ref()),
        SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) => {
            Some(AppError::service_unavailable(STORE_BUSY_MESSAGE))
        }
        _ => None,
    }
}

fn map_database_error(err: &dyn DatabaseError) -> Option<AppError> {
    match err.kind() {
        ErrorKind::UniqueViolation => {
            Some(AppError::conflict("conflicts with an existing record"))
        }
        ErrorKind::ForeignKeyViolation => Some(AppError::bad_request(
            "references an unknown agent, pool or instance",
        )),
        ErrorKind::NotNullViolation => Some(AppError::bad_request("missing required field")),
        ErrorKind::CheckViolation => Some(AppError::bad_request("value out of range")),
        _ if is_busy(err) => Some(AppError::service_unavailable(STORE_BUSY_MESSAGE)),
        _ => None,
    }
}

/// True when a `(agent_id, protocol, port)` style uniqueness constraint
/// rejected the write. Drives the allocator's retry loop.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    match sqlx_cause(err) {
        Some(SqlxError::Database(db_err)) => matches!(db_err.kind(), ErrorKind::UniqueViolation),
        _ => false,
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let mapped = sqlx_cause(&err).and_then(map_sqlx_error);
        match mapped {
            Some(mapped) if !mapped.status.is_server_error() => mapped,
            mapped => {
                crate::telemetry::record_internal_error_metrics(&err);
                error!(?err, "internal error");
                mapped.unwrap_or_else(|| AppError::internal("internal server error"))
            }
        }
    }
}
