pub mod app_state;
pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod persistence;
pub mod profiles;
pub mod routes;
pub mod secrets;
pub mod services;
pub mod signing;
pub mod tasks;
pub mod telemetry;
pub mod validation;
pub mod version;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{env, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{error, info};

use crate::app_state::AppState;
use crate::metrics::{init_metrics_recorder, record_build_info};
use crate::secrets::{AesGcmCipher, SecretCipher};
use crate::services::liveness::{HttpLivenessChecker, PortLivenessChecker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    Serve,
    MigrationsDryRun,
}

pub fn parse_command() -> Result<CommandMode> {
    parse_args(env::args().skip(1))
}

fn parse_args<I>(args: I) -> Result<CommandMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let Some(first) = args.next() else {
        return Ok(CommandMode::Serve);
    };

    match first.as_str() {
        "--migrations-dry-run" | "migrations-dry-run" => Ok(CommandMode::MigrationsDryRun),
        "migrate" => match args.next().as_deref() {
            Some("--dry-run") | Some("dry-run") => Ok(CommandMode::MigrationsDryRun),
            _ => anyhow::bail!("unknown migrate option; use --dry-run"),
        },
        "--help" | "-h" => {
            println!(
                "Usage: agent-control-plane [--migrations-dry-run]|[migrate --dry-run]\n\
                 Run without arguments to start the server."
            );
            std::process::exit(0);
        }
        other => anyhow::bail!("unknown argument: {other}"),
    }
}

/// Boot the control plane using the provided command mode.
pub async fn run(mode: CommandMode) -> Result<()> {
    run_with_shutdown(mode, shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(mode: CommandMode, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let metrics_handle = init_metrics_recorder();

    let db_pool = persistence::migrations::init_pool(&app_config.database.url).await?;
    if mode == CommandMode::MigrationsDryRun {
        let snapshot = persistence::migrations::dry_run_migrations(&db_pool).await?;
        info!(
            current_version = snapshot.latest_applied,
            target_version = snapshot.latest_available,
            pending = snapshot.pending.len(),
            "migration dry-run completed"
        );
        return Ok(());
    }

    let migration_outcome = persistence::migrations::run_migrations(&db_pool).await?;
    if migration_outcome.applied.is_empty() {
        info!(
            current_version = migration_outcome.snapshot.latest_applied,
            target_version = migration_outcome.snapshot.latest_available,
            "database schema is up to date"
        );
    } else {
        for mig in &migration_outcome.applied {
            info!(
                version = mig.version,
                description = mig.description,
                "applied database migration"
            );
        }
    }
    record_build_info(&migration_outcome.snapshot);

    let secrets: Arc<dyn SecretCipher> = Arc::new(AesGcmCipher::from_config(&app_config.secrets)?);
    let liveness: Arc<dyn PortLivenessChecker> = Arc::new(HttpLivenessChecker::new(
        app_config.liveness.clone(),
        secrets.clone(),
    )?);
    let state = AppState::from_config(
        &app_config,
        db_pool.clone(),
        secrets,
        liveness,
        metrics_handle,
        migration_outcome.snapshot,
    )?;
    info!(
        game_profiles = state.profiles.len(),
        operator_tokens = state.operator_auth.tokens.len(),
        "control plane configured"
    );

    tokio::spawn(routes::job_reaper_loop(
        state.jobs.clone(),
        app_config.jobs.clone(),
    ));
    tokio::spawn(routes::job_retention_loop(
        state.db.clone(),
        app_config.jobs.clone(),
    ));

    let api_addr: SocketAddr = format!("{}:{}", app_config.server.host, app_config.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;
    let metrics_addr: SocketAddr =
        format!("{}:{}", app_config.metrics.host, app_config.metrics.port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {}", err))?;

    let app = routes::build_router(state.clone()).with_state(state.clone());
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let metrics_app = routes::build_metrics_router(state.clone()).with_state(state.clone());
    let metrics_service = metrics_app.into_make_service_with_connect_info::<SocketAddr>();

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%api_addr, "control plane listening");
    info!(%metrics_addr, "control plane metrics listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    let mut api_shutdown = shutdown_rx.clone();
    let mut metrics_shutdown = shutdown_rx.clone();

    let mut api_task = tokio::spawn(async move {
        axum::serve(api_listener, make_service)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await
    });

    let mut metrics_task = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_service)
            .with_graceful_shutdown(async move {
                let _ = metrics_shutdown.changed().await;
            })
            .await
    });

    let api_finished_first = tokio::select! {
        res = &mut api_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("control plane task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("control plane server failed: {err}"))?;
            true
        }
        res = &mut metrics_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("control plane metrics task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("control plane metrics server failed: {err}"))?;
            false
        }
    };

    if api_finished_first {
        metrics_task
            .await
            .map_err(|err| anyhow::anyhow!("control plane metrics task failed: {err}"))?
            .map_err(|err| anyhow::anyhow!("control plane metrics server failed: {err}"))?;
    } else {
        api_task
            .await
            .map_err(|err| anyhow::anyhow!("control plane task failed: {err}"))?
            .map_err(|err| anyhow::anyhow!("control plane server failed: {err}"))?;
    }

    db_pool.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<Option<()>>().await
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn command_parsing() {
        assert_eq!(parse_args(args(&[])).unwrap(), CommandMode::Serve);
        assert_eq!(
            parse_args(args(&["migrate", "--dry-run"])).unwrap(),
            CommandMode::MigrationsDryRun
        );
        assert_eq!(
            parse_args(args(&["--migrations-dry-run"])).unwrap(),
            CommandMode::MigrationsDryRun
        );
        assert!(parse_args(args(&["migrate"])).is_err());
        assert!(parse_args(args(&["--standalone"])).is_err());
    }
}
