use std::sync::Arc;

use axum::http::HeaderName;
use metrics_exporter_prometheus::PrometheusHandle;
use subtle::ConstantTimeEq;

use crate::{
    config::{AppConfig, LimitsConfig},
    persistence,
    profiles::GameProfileCatalog,
    secrets::SecretCipher,
    services::{
        jobs::JobQueue, liveness::PortLivenessChecker, ports::PortAllocator,
        results::ResultApplierRegistry,
    },
    signing::SignatureVerifier,
};

/// Shared application state passed into handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: persistence::Db,
    pub operator_auth: OperatorAuth,
    pub signature_verifier: SignatureVerifier,
    pub secrets: Arc<dyn SecretCipher>,
    pub jobs: JobQueue,
    pub allocator: PortAllocator,
    pub profiles: Arc<GameProfileCatalog>,
    pub limits: LimitsConfig,
    pub metrics_handle: PrometheusHandle,
    pub schema: persistence::MigrationSnapshot,
}

impl AppState {
    /// Wire the services from configuration. The liveness checker is passed
    /// in so tests can substitute the node.
    pub fn from_config(
        cfg: &AppConfig,
        db: persistence::Db,
        secrets: Arc<dyn SecretCipher>,
        liveness: Arc<dyn PortLivenessChecker>,
        metrics_handle: PrometheusHandle,
        schema: persistence::MigrationSnapshot,
    ) -> anyhow::Result<Self> {
        let profiles = GameProfileCatalog::from_specs(cfg.profiles.clone())?;
        Ok(Self {
            operator_auth: OperatorAuth::from_config(&cfg.operator)?,
            signature_verifier: SignatureVerifier::from_config(&cfg.signing),
            jobs: JobQueue::new(
                db.clone(),
                ResultApplierRegistry::with_defaults(),
                cfg.jobs.clone(),
            ),
            allocator: PortAllocator::new(db.clone(), liveness, cfg.ports.max_attempts),
            profiles: Arc::new(profiles),
            limits: cfg.limits.clone(),
            secrets,
            metrics_handle,
            schema,
            db,
        })
    }
}

/// Operator authentication configuration.
#[derive(Clone)]
pub struct OperatorAuth {
    pub tokens: Vec<String>,
    pub header_name: HeaderName,
}

impl OperatorAuth {
    pub fn from_config(cfg: &crate::config::OperatorAuthConfig) -> anyhow::Result<Self> {
        let header_name = HeaderName::from_bytes(cfg.header_name.trim().as_bytes())
            .map_err(|err| anyhow::anyhow!("invalid operator.header_name: {err}"))?;
        Ok(Self {
            tokens: cfg.tokens.clone(),
            header_name,
        })
    }

    pub fn is_valid_token(&self, candidate: &str) -> bool {
        self.tokens.iter().any(|token| {
            if token.len() != candidate.len() {
                return false;
            }
            token.as_bytes().ct_eq(candidate.as_bytes()).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison_requires_exact_match() {
        let auth = OperatorAuth {
            tokens: vec!["op-token".into(), "second".into()],
            header_name: HeaderName::from_static("authorization"),
        };
        assert!(auth.is_valid_token("op-token"));
        assert!(auth.is_valid_token("second"));
        assert!(!auth.is_valid_token("op-toke"));
        assert!(!auth.is_valid_token("op-token2"));
        assert!(!auth.is_valid_token(""));
    }

    #[test]
    fn header_name_is_validated() {
        let cfg = crate::config::OperatorAuthConfig {
            tokens: vec!["t".into()],
            header_name: "bad header".into(),
        };
        assert!(OperatorAuth::from_config(&cfg).is_err());
    }
}
