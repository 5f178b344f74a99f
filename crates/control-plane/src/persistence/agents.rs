use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::types::Json;

use super::Db;
use crate::Result;
use crate::secrets::SealedSecret;

#[derive(Debug, Clone, FromRow)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub secret_key_id: String,
    pub secret_nonce: String,
    pub secret_ciphertext: String,
    #[sqlx(rename = "metadata_json")]
    pub metadata: Json<HashMap<String, String>>,
    pub last_heartbeat_addr: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn sealed_secret(&self) -> SealedSecret {
        SealedSecret {
            key_id: self.secret_key_id.clone(),
            nonce: self.secret_nonce.clone(),
            ciphertext: self.secret_ciphertext.clone(),
        }
    }

    pub fn summary(&self) -> common::api::AgentSummary {
        common::api::AgentSummary {
            agent_id: self.id.clone(),
            name: self.name.clone(),
            metadata: self.metadata.0.clone(),
            last_heartbeat_addr: self.last_heartbeat_addr.clone(),
            last_heartbeat_at: self.last_heartbeat_at,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAgent {
    pub id: String,
    pub name: String,
    pub secret: SealedSecret,
    pub metadata: HashMap<String, String>,
}

const AGENT_COLUMNS: &str = r#"
    id, name, secret_key_id, secret_nonce, secret_ciphertext, metadata_json,
    last_heartbeat_addr, last_heartbeat_at, created_at, updated_at
"#;

pub async fn create_agent(pool: &Db, agent: NewAgent) -> Result<AgentRecord> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO agents (
            id, name, secret_key_id, secret_nonce, secret_ciphertext,
            metadata_json, created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
        "#,
    )
    .bind(&agent.id)
    .bind(&agent.name)
    .bind(&agent.secret.key_id)
    .bind(&agent.secret.nonce)
    .bind(&agent.secret.ciphertext)
    .bind(Json(&agent.metadata))
    .bind(now)
    .execute(pool)
    .await?;

    get_agent(pool, &agent.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("agent insert did not return row"))
}

pub async fn get_agent(pool: &Db, id: &str) -> Result<Option<AgentRecord>> {
    let record = sqlx::query_as::<_, AgentRecord>(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_agents(pool: &Db) -> Result<Vec<AgentRecord>> {
    let records = sqlx::query_as::<_, AgentRecord>(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents ORDER BY created_at ASC, id ASC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Record a heartbeat and merge `metadata` into the stored map.
///
/// Returns `false` when the agent does not exist.
pub async fn record_heartbeat(
    pool: &Db,
    id: &str,
    address: Option<&str>,
    metadata: &HashMap<String, String>,
    at: DateTime<Utc>,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let current: Option<Json<HashMap<String, String>>> =
        sqlx::query_scalar("SELECT metadata_json FROM agents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
    let Some(Json(mut merged)) = current else {
        return Ok(false);
    };
    merged.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));

    sqlx::query(
        r#"
        UPDATE agents
        SET last_heartbeat_addr = COALESCE(?2, last_heartbeat_addr),
            last_heartbeat_at = ?3,
            metadata_json = ?4,
            updated_at = ?3
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(address)
    .bind(at)
    .bind(Json(&merged))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations::{init_pool, run_migrations};

    async fn db() -> Db {
        let pool = init_pool("sqlite::memory:").await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        pool
    }

    fn new_agent(id: &str) -> NewAgent {
        NewAgent {
            id: id.to_string(),
            name: format!("{id}-name"),
            secret: SealedSecret {
                key_id: "k1".into(),
                nonce: "bm9uY2U=".into(),
                ciphertext: "Y2lwaGVy".into(),
            },
            metadata: HashMap::from([("region".to_string(), "eu".to_string())]),
        }
    }

    #[tokio::test]
    async fn create_and_fetch_agent() {
        let pool = db().await;
        let created = create_agent(&pool, new_agent("node-1")).await.expect("create");
        assert_eq!(created.name, "node-1-name");
        assert_eq!(created.sealed_secret().key_id, "k1");
        assert_eq!(created.metadata.0.get("region").map(String::as_str), Some("eu"));
        assert!(get_agent(&pool, "missing").await.expect("get").is_none());
        assert_eq!(list_agents(&pool).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_merges_metadata_and_keeps_address_when_absent() {
        let pool = db().await;
        create_agent(&pool, new_agent("node-1")).await.expect("create");

        let now = Utc::now();
        let extra = HashMap::from([("service_url".to_string(), "http://n1:8443".to_string())]);
        assert!(
            record_heartbeat(&pool, "node-1", Some("10.0.0.5"), &extra, now)
                .await
                .expect("heartbeat")
        );
        assert!(
            record_heartbeat(&pool, "node-1", None, &HashMap::new(), now)
                .await
                .expect("heartbeat")
        );

        let agent = get_agent(&pool, "node-1").await.expect("get").expect("agent");
        assert_eq!(agent.last_heartbeat_addr.as_deref(), Some("10.0.0.5"));
        assert_eq!(agent.metadata.0.len(), 2);
        assert!(agent.last_heartbeat_at.is_some());

        assert!(
            !record_heartbeat(&pool, "ghost", None, &HashMap::new(), now)
                .await
                .expect("heartbeat")
        );
    }
}
