pub mod app_state;
pub mod ca;
pub mod config;
pub mod driver;
pub mod error;
pub mod lock;
pub mod persistence;
pub mod poller;
pub mod quota;
pub mod rpc;
pub mod service_group;
pub mod services;
pub mod stack;
pub mod tasks;
pub mod telemetry;
pub mod validation;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app_state::{AppState, BINARY_NAME};
use crate::ca::{CertAuthority, InsecureDevCa};
use crate::error::OpError;
use crate::rpc::client::HttpPeerPinger;
use crate::service_group::ServiceGroup;
use crate::stack::{InMemoryStackEngine, StackAdapter};

/// Exit code for fatal configuration errors at startup.
pub const EXIT_CONFIG_ERROR: i32 = 1;
/// Exit code for an irrecoverable store failure in steady state.
pub const EXIT_STORE_FAILURE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandMode {
    Serve { config_path: Option<String> },
}

/// Injection points for the external capabilities. The defaults keep a
/// single-process dev deployment working without an IaaS engine or a CA
/// backend behind it.
#[derive(Clone, Default)]
pub struct ConductorHooks {
    pub stack: Option<Arc<dyn StackAdapter>>,
    pub ca: Option<Arc<dyn CertAuthority>>,
}

pub fn parse_command() -> Result<CommandMode> {
    let mut args = env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?,
                );
            }
            "--help" | "-h" => {
                println!(
                    "Usage: corral-conductor [--config <path>]\n\
                     Run without arguments to start the conductor with defaults."
                );
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    Ok(CommandMode::Serve { config_path })
}

pub async fn run(mode: CommandMode) -> Result<()> {
    run_with(mode, ConductorHooks::default()).await
}

pub async fn run_with(mode: CommandMode, hooks: ConductorHooks) -> Result<()> {
    run_with_shutdown(mode, hooks, shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(mode: CommandMode, hooks: ConductorHooks, shutdown: S) -> Result<()>
where
    S: std::future::Future<Output = ()> + Send + 'static,
{
    let CommandMode::Serve { config_path } = mode;
    let app_config =
        config::load_from(config_path.as_deref()).context("failed to load configuration")?;

    let metrics_handle = init_metrics_recorder();

    let db_pool = persistence::migrations::init_pool(&app_config.database.url).await?;
    persistence::migrations::run_migrations(&db_pool).await?;
    info!(
        schema_version = persistence::migrations::latest_migration_version(),
        "database schema ready"
    );

    let mut service_group = ServiceGroup::new(
        db_pool.clone(),
        BINARY_NAME,
        app_config.service_down_time(),
    );
    if app_config.conductor.enable_peer_ping {
        service_group = service_group
            .with_pinger(Arc::new(HttpPeerPinger::new(app_config.life_check_timeout())));
        info!(
            timeout_secs = app_config.conductor.life_check_timeout_secs,
            "peer liveness probing enabled"
        );
    }

    let stack: Arc<dyn StackAdapter> = match hooks.stack {
        Some(stack) => stack,
        None => {
            warn!("no stack adapter injected; using the in-memory dev engine");
            Arc::new(InMemoryStackEngine::new())
        }
    };
    let ca: Arc<dyn CertAuthority> = match hooks.ca {
        Some(ca) => ca,
        None => {
            warn!("no certificate authority injected; using the insecure dev CA");
            Arc::new(InsecureDevCa)
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    let mut state = AppState::build(
        db_pool.clone(),
        &app_config,
        stack,
        ca,
        Arc::new(service_group),
        shutdown_rx.clone(),
    );
    state.metrics_handle = Some(metrics_handle.clone());

    // Register before serving so peers and the service listing see this
    // conductor from the first request on.
    persistence::services::upsert_heartbeat(
        &db_pool,
        &state.conductor_id,
        BINARY_NAME,
        &state.endpoint,
    )
    .await?;

    let mut heartbeat_task = tokio::spawn(tasks::heartbeat::heartbeat_loop(
        db_pool.clone(),
        state.conductor_id.clone(),
        state.endpoint.clone(),
        Duration::from_secs(app_config.conductor.heartbeat_interval_secs),
        shutdown_rx.clone(),
    ));

    let bind_addr: SocketAddr = format!("0.0.0.0:{}", app_config.conductor.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {err}"))?;
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(
        %bind_addr,
        conductor_id = %state.conductor_id,
        topic = %state.topic,
        "conductor listening"
    );

    let router = rpc::server::build_router(state.metrics_handle.clone()).with_state(state.clone());
    let mut server_shutdown = shutdown_rx.clone();
    let mut server_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    tokio::select! {
        hb = &mut heartbeat_task => {
            let _ = shutdown_tx.send(true);
            let hb_result = hb.map_err(|err| anyhow::anyhow!("heartbeat task failed: {err}"))?;
            server_task
                .await
                .map_err(|err| anyhow::anyhow!("conductor server task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("conductor server failed: {err}"))?;
            hb_result?;
        }
        server = &mut server_task => {
            let _ = shutdown_tx.send(true);
            server
                .map_err(|err| anyhow::anyhow!("conductor server task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("conductor server failed: {err}"))?;
            heartbeat_task
                .await
                .map_err(|err| anyhow::anyhow!("heartbeat task failed: {err}"))??;
        }
    }

    info!("conductor shut down cleanly");
    Ok(())
}

/// Map a daemon error to its documented exit code.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    let is_fatal_store = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<OpError>())
        .any(|op_err| op_err.kind == common::api::ErrorKind::Fatal);

    if is_fatal_store {
        EXIT_STORE_FAILURE
    } else {
        EXIT_CONFIG_ERROR
    }
}

fn init_metrics_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    builder
        .install_recorder()
        .expect("failed to install metrics recorder")
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
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
}
