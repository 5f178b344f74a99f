use axum::{Json, response::IntoResponse};
use tracing::warn;

use crate::error::AppError;
use crate::services::{
    agents::AgentError, blocks::BlockError, jobs::JobError, liveness::LivenessError,
    ports::AllocationError,
};

/// Convert a service error into an HTTP error, recognising the domain
/// errors carried inside the `anyhow` chain.
pub(crate) fn map_service_error<E>(err: E) -> AppError
where
    E: Into<anyhow::Error>,
{
    let err = err.into();
    map_domain_error(&err).unwrap_or_else(|| err.into())
}

fn map_domain_error(err: &anyhow::Error) -> Option<AppError> {
    if let Some(job) = err.downcast_ref::<JobError>() {
        return Some(match job {
            JobError::AgentNotFound(_) | JobError::NotFound(_) => {
                AppError::not_found(job.to_string())
            }
            JobError::Conflict { .. } | JobError::DuplicateId(_) => {
                AppError::conflict(job.to_string())
            }
            JobError::InvalidStatus(_) => AppError::bad_request(job.to_string()),
            JobError::RemoteFailure { .. } => AppError::unprocessable(job.to_string()),
            JobError::WaitTimedOut { .. } => AppError::gateway_timeout(job.to_string()),
        });
    }

    if let Some(agent) = err.downcast_ref::<AgentError>() {
        return Some(match agent {
            AgentError::NotFound(_) => AppError::not_found(agent.to_string()),
            AgentError::AlreadyExists(_) => AppError::conflict(agent.to_string()),
        });
    }

    if let Some(alloc) = err.downcast_ref::<AllocationError>() {
        return Some(match alloc {
            AllocationError::AgentNotFound(_) | AllocationError::InstanceNotFound(_) => {
                AppError::not_found(alloc.to_string())
            }
            AllocationError::UnknownProfile(_)
            | AllocationError::RequiredRoleUnavailable { .. }
            | AllocationError::DerivedBaseMissing { .. } => {
                AppError::unprocessable(alloc.to_string())
            }
            AllocationError::RetriesExhausted { .. } => {
                AppError::allocation_conflict(alloc.to_string())
            }
        });
    }

    if let Some(block) = err.downcast_ref::<BlockError>() {
        return Some(match block {
            BlockError::PoolNotFound(_) => AppError::not_found(block.to_string()),
            BlockError::Validation { .. } => AppError::bad_request(block.to_string()),
            BlockError::Exhausted { .. } => AppError::conflict(block.to_string()),
            BlockError::Contended(_) => AppError::service_unavailable(block.to_string()),
        });
    }

    if let Some(liveness) = err.downcast_ref::<LivenessError>() {
        warn!(error = %liveness, "agent port check unavailable");
        return Some(AppError::bad_gateway(liveness.to_string()));
    }

    None
}

pub(crate) fn into_response(err: AppError) -> axum::response::Response {
    let body = Json(serde_json::json!({
        "error": err.message,
        "code": err.code,
    }));
    let mut response = (err.status, body).into_response();
    if let Some(headers) = err.headers.as_deref() {
        for (name, value) in headers.iter() {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
    response
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        into_response(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use common::api::JobStatus;
    use serde_json::json;

    #[test]
    fn unknown_errors_become_internal() {
        let err = map_service_error(anyhow::anyhow!("boom"));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, "internal_error");
        assert_eq!(err.message, "internal server error");
    }

    #[test]
    fn domain_errors_map_to_stable_codes() {
        let cases: Vec<(anyhow::Error, StatusCode, &str)> = vec![
            (
                JobError::Conflict {
                    job_id: "j1".into(),
                    status: JobStatus::Running,
                }
                .into(),
                StatusCode::CONFLICT,
                "conflict",
            ),
            (
                JobError::NotFound("j1".into()).into(),
                StatusCode::NOT_FOUND,
                "not_found",
            ),
            (
                JobError::InvalidStatus("done".into()).into(),
                StatusCode::BAD_REQUEST,
                "bad_request",
            ),
            (
                AllocationError::RetriesExhausted { attempts: 5 }.into(),
                StatusCode::CONFLICT,
                "allocation_conflict",
            ),
            (
                AllocationError::RequiredRoleUnavailable {
                    role: "voice".into(),
                    reason: "no free port".into(),
                }
                .into(),
                StatusCode::UNPROCESSABLE_ENTITY,
                "unprocessable",
            ),
            (
                BlockError::Validation {
                    field: "block_size",
                    reason: "must be at least 1".into(),
                }
                .into(),
                StatusCode::BAD_REQUEST,
                "bad_request",
            ),
            (
                LivenessError::Status(503).into(),
                StatusCode::BAD_GATEWAY,
                "agent_unreachable",
            ),
        ];
        for (err, status, code) in cases {
            let mapped = map_service_error(err.context("handling request"));
            assert_eq!(mapped.status, status, "{}", mapped.message);
            assert_eq!(mapped.code, code);
        }
    }

    #[tokio::test]
    async fn into_response_exposes_code_and_message() {
        let app_error = AppError {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: "nope".into(),
            headers: None,
        };
        let response = into_response(app_error);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload, json!({"error": "nope", "code": "bad_request"}));
    }
}
