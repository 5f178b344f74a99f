use std::{collections::HashMap, net::SocketAddr};

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, header, request::Parts},
    middleware::Next,
};
use chrono::Utc;
use common::signing::{AGENT_ID_HEADER, CUSTOMER_ID_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use tracing::warn;

use crate::{
    app_state::AppState,
    error::{ApiResult, AppError},
    metrics::record_auth_failure,
    services,
    signing::{SignatureError, SignedRequest},
    telemetry,
};

/// Path parameter naming the agent on agent-facing routes.
pub const AGENT_PATH_PARAM: &str = "node_id";

/// Agent identity established by a verified request signature.
#[derive(Clone, Debug)]
pub struct AuthenticatedAgent {
    pub agent_id: String,
    /// Peer address, when the server was started with connect info.
    pub remote_addr: Option<SocketAddr>,
}

pub async fn require_operator_auth(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> ApiResult<axum::response::Response> {
    let token = match extract_bearer_from_header(
        req.headers(),
        &state.operator_auth.header_name,
        "operator authorization header",
    ) {
        Ok(token) => token,
        Err(err) => {
            log_auth_failure(&req, "operator", err.code, &err.message);
            return Err(bearer_challenge(err));
        }
    };

    if !state.operator_auth.is_valid_token(&token) {
        log_auth_failure(&req, "operator", "invalid_token", "invalid operator token");
        return Err(bearer_challenge(AppError::unauthorized("invalid operator token")));
    }

    Ok(next.run(req).await)
}

fn bearer_challenge(err: AppError) -> AppError {
    let mut headers = HeaderMap::new();
    headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    err.with_headers(headers)
}

/// Verify the HMAC signature of an agent-facing request against the secret
/// of the agent named in the path.
pub async fn require_agent_signature(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> ApiResult<axum::response::Response> {
    let Some(agent_id) = params.get(AGENT_PATH_PARAM).cloned() else {
        return Err(AppError::not_found("agent not found"));
    };

    let (mut parts, body) = req.into_parts();
    let verified = verify_agent_request(&state, &agent_id, &parts).await;
    match verified {
        Ok(()) => {}
        Err(AgentAuthFailure::Rejected(err)) => {
            record_auth_failure(err.reason());
            let req = Request::from_parts(parts, ());
            log_auth_failure(&req, "agent", err.reason(), &err.to_string());
            return Err(AppError::unauthorized(err.to_string()));
        }
        Err(AgentAuthFailure::Internal(err)) => return Err(err.into()),
    }

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    parts.extensions.insert(AuthenticatedAgent {
        agent_id,
        remote_addr,
    });
    let req = Request::from_parts(parts, body);
    Ok(next.run(req).await)
}

enum AgentAuthFailure {
    Rejected(SignatureError),
    Internal(anyhow::Error),
}

impl From<SignatureError> for AgentAuthFailure {
    fn from(err: SignatureError) -> Self {
        AgentAuthFailure::Rejected(err)
    }
}

async fn verify_agent_request(
    state: &AppState,
    agent_id: &str,
    parts: &Parts,
) -> Result<(), AgentAuthFailure> {
    let headers = &parts.headers;
    let signed = SignedRequest {
        agent_id: header_str(headers, AGENT_ID_HEADER)?,
        signature: header_str(headers, SIGNATURE_HEADER)?,
        timestamp: header_str(headers, TIMESTAMP_HEADER)?,
        customer_id: header_str(headers, CUSTOMER_ID_HEADER)?,
        method: parts.method.as_str(),
        path: parts.uri.path(),
    };
    state.signature_verifier.check_identity(&signed, agent_id)?;

    let loaded =
        services::agents::load_agent_secret(&state.db, state.secrets.as_ref(), agent_id)
            .await
            .map_err(AgentAuthFailure::Internal)?;
    let Some((_, secret)) = loaded else {
        return Err(SignatureError::UnknownAgent.into());
    };
    state
        .signature_verifier
        .verify(&signed, agent_id, &secret, Utc::now())?;
    Ok(())
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<Option<&'a str>, SignatureError> {
    headers
        .get(name)
        .map(|value| value.to_str().map_err(|_| SignatureError::InvalidHeader(name)))
        .transpose()
}

pub fn extract_bearer_from_header(
    headers: &HeaderMap,
    header: &HeaderName,
    context: &str,
) -> ApiResult<String> {
    let value = headers
        .get(header)
        .ok_or_else(|| AppError::unauthorized(format!("missing {context}")))?;

    let value = value
        .to_str()
        .map_err(|_| AppError::unauthorized(format!("invalid {context}")))?;

    let prefix = "Bearer ";
    if !value.starts_with(prefix) {
        return Err(AppError::unauthorized(format!("invalid {context} scheme")));
    }

    Ok(value[prefix.len()..].to_string())
}

fn log_auth_failure<B>(
    req: &Request<B>,
    principal: &'static str,
    reason: &str,
    message: &str,
) {
    let request_id = telemetry::request_id_from_request(req);
    warn!(
        request_id = request_id.as_deref(),
        principal,
        reason,
        method = %req.method(),
        path = %req.uri().path(),
        message,
        "authentication failed"
    );
}
