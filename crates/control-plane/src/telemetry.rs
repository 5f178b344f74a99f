use axum::http::Request;
use metrics::counter;
use sqlx::Error as SqlxError;
use tower_http::request_id::RequestId;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

pub(crate) fn request_id_from_request<B>(req: &Request<B>) -> Option<String> {
    req.extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .map(str::to_string)
}

/// Span for one HTTP request, carrying the `x-request-id` value.
pub(crate) fn make_request_span<B>(req: &Request<B>) -> Span {
    let request_id = request_id_from_request(req).unwrap_or_default();
    tracing::info_span!(
        "http_request",
        method = %req.method(),
        path = %req.uri().path(),
        request_id = %request_id,
    )
}

pub(crate) fn record_internal_error_metrics(err: &anyhow::Error) {
    counter!("control_plane_internal_errors_total").increment(1);
    if let Some(db_err) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())
    {
        let kind = match db_err {
            SqlxError::RowNotFound => "row_not_found",
            SqlxError::Database(_) => "database",
            SqlxError::PoolTimedOut | SqlxError::PoolClosed => "pool",
            SqlxError::Io(_) => "io",
            _ => "other",
        };
        counter!("control_plane_db_errors_total", "kind" => kind).increment(1);
    }
}
