//! Inbound agent request verification.

use chrono::{DateTime, Utc};
use common::signing::{SigningInput, signature_bytes};
use subtle::ConstantTimeEq;

use crate::config::SigningConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("invalid {0} header")]
    InvalidHeader(&'static str),
    #[error("agent id header does not match the requested agent")]
    AgentMismatch,
    #[error("unknown agent")]
    UnknownAgent,
    #[error("request timestamp outside the allowed window")]
    StaleTimestamp,
    #[error("signature mismatch")]
    Mismatch,
}

impl SignatureError {
    /// Stable label for the auth failure counter.
    pub fn reason(&self) -> &'static str {
        match self {
            SignatureError::MissingHeader(_) => "missing_header",
            SignatureError::InvalidHeader(_) => "invalid_header",
            SignatureError::AgentMismatch => "agent_mismatch",
            SignatureError::UnknownAgent => "unknown_agent",
            SignatureError::StaleTimestamp => "stale_timestamp",
            SignatureError::Mismatch => "signature_mismatch",
        }
    }
}

/// Raw signature material pulled off an inbound request.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignedRequest<'a> {
    pub agent_id: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub customer_id: Option<&'a str>,
    pub method: &'a str,
    pub path: &'a str,
}

#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    max_skew_secs: i64,
    require_timestamp: bool,
}

impl SignatureVerifier {
    pub fn new(max_skew_secs: u64, require_timestamp: bool) -> Self {
        Self {
            max_skew_secs: i64::try_from(max_skew_secs).unwrap_or(i64::MAX),
            require_timestamp,
        }
    }

    pub fn from_config(cfg: &SigningConfig) -> Self {
        Self::new(cfg.max_skew_secs, cfg.require_timestamp)
    }

    /// Check that the request identifies `claimed_agent_id` and carries a
    /// valid HMAC for `secret`.
    pub fn verify(
        &self,
        request: &SignedRequest<'_>,
        claimed_agent_id: &str,
        secret: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        self.check_identity(request, claimed_agent_id)?;
        let signature = request
            .signature
            .filter(|s| !s.trim().is_empty())
            .ok_or(SignatureError::MissingHeader(
                common::signing::SIGNATURE_HEADER,
            ))?;
        let timestamp = self.check_timestamp(request.timestamp, now)?;

        let provided = hex::decode(signature.trim()).map_err(|_| SignatureError::Mismatch)?;
        let expected = signature_bytes(
            secret,
            &SigningInput {
                agent_id: claimed_agent_id,
                customer_id: request.customer_id,
                method: request.method,
                path: request.path,
                timestamp,
            },
        );
        if provided.len() != expected.len()
            || !bool::from(provided.as_slice().ct_eq(expected.as_slice()))
        {
            return Err(SignatureError::Mismatch);
        }
        Ok(())
    }

    /// Header-level checks that need no secret.
    pub fn check_identity(
        &self,
        request: &SignedRequest<'_>,
        claimed_agent_id: &str,
    ) -> Result<(), SignatureError> {
        let header_agent = request
            .agent_id
            .ok_or(SignatureError::MissingHeader(
                common::signing::AGENT_ID_HEADER,
            ))?;
        if header_agent != claimed_agent_id {
            return Err(SignatureError::AgentMismatch);
        }
        Ok(())
    }

    fn check_timestamp(
        &self,
        raw: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, SignatureError> {
        let Some(raw) = raw else {
            if self.require_timestamp {
                return Err(SignatureError::MissingHeader(
                    common::signing::TIMESTAMP_HEADER,
                ));
            }
            return Ok(None);
        };
        let ts: i64 = raw
            .trim()
            .parse()
            .map_err(|_| SignatureError::InvalidHeader(common::signing::TIMESTAMP_HEADER))?;
        if now.timestamp().abs_diff(ts) > self.max_skew_secs.unsigned_abs() {
            return Err(SignatureError::StaleTimestamp);
        }
        Ok(Some(ts))
    }
}
