use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use sqlx::migrate::{AppliedMigration, Migrate, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use uuid::Uuid;

use super::Db;
use crate::Result;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MigrationLabel {
    pub version: i64,
    pub description: String,
}

/// Applied and pending migrations as seen by this binary.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MigrationSnapshot {
    pub latest_applied: Option<i64>,
    pub latest_available: Option<i64>,
    pub applied: Vec<MigrationLabel>,
    pub pending: Vec<MigrationLabel>,
}

#[derive(Debug, Clone)]
pub struct MigrationRunOutcome {
    pub snapshot: MigrationSnapshot,
    pub applied: Vec<MigrationLabel>,
}

/// Open the SQLite pool.
///
/// `sqlite::memory:` is redirected to a throw-away file with a single shared
/// cache connection so every query in a test sees the same database.
pub async fn init_pool(database_url: &str) -> Result<Db> {
    let in_memory = database_url.starts_with("sqlite::memory");
    let url = if in_memory {
        let path =
            std::env::temp_dir().join(format!("agent-control-plane-{}.sqlite", Uuid::new_v4()));
        format!("sqlite://{}", path.display())
    } else {
        database_url.to_string()
    };
    ensure_db_dir(&url)?;

    let mut opts = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    let max_connections = if in_memory {
        opts = opts.shared_cache(true);
        1
    } else {
        opts = opts.journal_mode(SqliteJournalMode::Wal);
        5
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(opts)
        .await
        .with_context(|| format!("connecting to {database_url}"))?;
    Ok(pool)
}

fn ensure_db_dir(database_url: &str) -> Result<()> {
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    if let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    Ok(())
}

pub fn latest_migration_version() -> Option<i64> {
    MIGRATOR.iter().map(|m| m.version).max()
}

pub async fn migration_snapshot(pool: &Db) -> Result<MigrationSnapshot> {
    let applied = fetch_applied_migrations(pool).await?;
    let descriptions: HashMap<i64, &str> = MIGRATOR
        .iter()
        .map(|m| (m.version, m.description.as_ref()))
        .collect();
    let applied_versions: HashSet<i64> = applied.iter().map(|m| m.version).collect();

    Ok(MigrationSnapshot {
        latest_applied: applied.iter().map(|m| m.version).max(),
        latest_available: latest_migration_version(),
        applied: applied
            .iter()
            .map(|m| MigrationLabel {
                version: m.version,
                description: descriptions
                    .get(&m.version)
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            })
            .collect(),
        pending: MIGRATOR
            .iter()
            .filter(|m| !applied_versions.contains(&m.version))
            .map(|m| MigrationLabel {
                version: m.version,
                description: m.description.to_string(),
            })
            .collect(),
    })
}

/// Fail when the database carries migrations this binary does not know or
/// whose checksum differs from the embedded copy.
pub async fn validate_migrations(pool: &Db) -> Result<()> {
    let known: HashMap<i64, &sqlx::migrate::Migration> =
        MIGRATOR.iter().map(|m| (m.version, m)).collect();
    for applied in fetch_applied_migrations(pool).await? {
        let Some(defined) = known.get(&applied.version) else {
            anyhow::bail!("database has unknown migration version {}", applied.version);
        };
        if defined.checksum != applied.checksum {
            anyhow::bail!(
                "migration {} checksum mismatch between database and binary",
                applied.version
            );
        }
    }
    Ok(())
}

/// Validate the live schema and replay every migration against a scratch
/// database without touching `pool`.
pub async fn dry_run_migrations(pool: &Db) -> Result<MigrationSnapshot> {
    let snapshot = migration_snapshot(pool).await?;
    validate_migrations(pool).await?;

    let scratch = init_pool("sqlite::memory:").await?;
    MIGRATOR
        .run(&scratch)
        .await
        .context("dry-run execution of migrations failed")?;
    Ok(snapshot)
}

pub async fn run_migrations(pool: &Db) -> Result<MigrationRunOutcome> {
    let before = migration_snapshot(pool).await?;
    validate_migrations(pool).await?;
    if before.pending.is_empty() {
        return Ok(MigrationRunOutcome {
            snapshot: before,
            applied: Vec::new(),
        });
    }

    MIGRATOR
        .run(pool)
        .await
        .context("applying database migrations failed")?;

    let after = migration_snapshot(pool).await?;
    let applied = before.pending.clone();
    Ok(MigrationRunOutcome {
        snapshot: after,
        applied,
    })
}

async fn fetch_applied_migrations(pool: &Db) -> Result<Vec<AppliedMigration>> {
    let mut conn = pool.acquire().await?;
    conn.ensure_migrations_table()
        .await
        .context("ensure migrations table exists")?;
    if let Some(version) = conn.dirty_version().await? {
        anyhow::bail!("database is in a dirty migration state at version {version}");
    }
    let applied = conn
        .list_applied_migrations()
        .await
        .context("list applied migrations")?;
    Ok(applied)
}
