use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::Result;
use crate::error::is_unique_violation;
use crate::persistence::{self as db, AgentRecord, Db};
use crate::secrets::{SecretCipher, generate_agent_secret};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent {0} not found")]
    NotFound(String),
    #[error("agent {0} already exists")]
    AlreadyExists(String),
}

/// A freshly registered agent. `secret` is the only copy of the plaintext.
pub struct AgentRegistration {
    pub agent: AgentRecord,
    pub secret: String,
}

impl std::fmt::Debug for AgentRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistration")
            .field("agent", &self.agent.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

pub async fn register_agent(
    db: &Db,
    cipher: &dyn SecretCipher,
    id: Option<String>,
    name: String,
    metadata: HashMap<String, String>,
) -> Result<AgentRegistration> {
    let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let secret = generate_agent_secret();
    let sealed = cipher.encrypt(secret.as_bytes())?;

    let agent = db::agents::create_agent(
        db,
        db::NewAgent {
            id: id.clone(),
            name,
            secret: sealed,
            metadata,
        },
    )
    .await
    .map_err(|err| {
        if is_unique_violation(&err) {
            AgentError::AlreadyExists(id.clone()).into()
        } else {
            err
        }
    })?;

    info!(agent_id = %agent.id, key_id = %agent.secret_key_id, "agent registered");
    Ok(AgentRegistration { agent, secret })
}

pub async fn get_agent(db: &Db, agent_id: &str) -> Result<AgentRecord> {
    db::agents::get_agent(db, agent_id)
        .await?
        .ok_or_else(|| AgentError::NotFound(agent_id.to_string()).into())
}

/// Load an agent together with its decrypted shared secret.
pub async fn load_agent_secret(
    db: &Db,
    cipher: &dyn SecretCipher,
    agent_id: &str,
) -> Result<Option<(AgentRecord, Vec<u8>)>> {
    let Some(agent) = db::agents::get_agent(db, agent_id).await? else {
        return Ok(None);
    };
    let secret = decrypt_agent_secret(cipher, &agent)?;
    Ok(Some((agent, secret)))
}

pub fn decrypt_agent_secret(cipher: &dyn SecretCipher, agent: &AgentRecord) -> Result<Vec<u8>> {
    let secret = cipher.decrypt(&agent.sealed_secret())?;
    Ok(secret)
}

pub async fn heartbeat(
    db: &Db,
    agent_id: &str,
    address: Option<&str>,
    metadata: &HashMap<String, String>,
    at: DateTime<Utc>,
) -> Result<AgentRecord> {
    if !db::agents::record_heartbeat(db, agent_id, address, metadata, at).await? {
        return Err(AgentError::NotFound(agent_id.to_string()).into());
    }
    get_agent(db, agent_id).await
}
