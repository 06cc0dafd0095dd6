use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use oci_monitor::config::{HostExec, MonitorConfig};
use oci_monitor::controller::{CommandRunner, DockerCli, HostRunner, KubeCluster};
use oci_monitor::error::StartupError;
use oci_monitor::host;
use oci_monitor::monitor::Monitor;
use oci_monitor::Error;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

/// Host and cluster checks that must pass before anything is touched
async fn bootstrap(cfg: &MonitorConfig) -> Result<Monitor, StartupError> {
    host::validate_mounts(&[&cfg.host_mount_ns, &cfg.docker_socket])
        .map_err(StartupError::MissingMounts)?;

    let id = host::own_container_id()
        .await
        .map_err(|e| StartupError::NotInContainer(e.to_string()))?;
    info!("Running in container {}", id);

    let docker = Arc::new(DockerCli::new(&cfg.docker_socket));
    let own = docker.inspect_container(&id).await?;

    let node_name = host::node_name(cfg)?;
    let client = kube::Client::try_default().await.map_err(Error::from)?;
    let cluster = Arc::new(KubeCluster::new(
        client,
        node_name,
        cfg.volume_plugin.clone(),
    ));

    let runner: Arc<dyn CommandRunner> = match cfg.host_exec {
        HostExec::Nsenter => Arc::new(HostRunner::nsenter(cfg.host_mount_ns.clone())),
        HostExec::Direct => Arc::new(HostRunner::direct()),
    };

    Ok(Monitor::new(cfg.clone(), cluster, docker, runner, own))
}

async fn shutdown_signal(tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for interrupt: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("Interrupted"),
        _ = terminate => info!("Terminated"),
    }
    let _ = tx.send(true);
}

#[tokio::main]
async fn main() -> ExitCode {
    let cfg = MonitorConfig::parse();
    init_tracing(cfg.debug);
    info!("Starting OCI monitor v{}", env!("CARGO_PKG_VERSION"));

    let (tx, rx) = watch::channel(false);
    tokio::spawn(shutdown_signal(tx));

    let started = async {
        let monitor = bootstrap(&cfg).await?;
        #[cfg(feature = "rest-api")]
        let server = Some(monitor.serve(rx.clone())?);
        #[cfg(not(feature = "rest-api"))]
        let server: Option<tokio::task::JoinHandle<()>> = None;
        let initial = monitor.startup().await?;
        Ok::<_, StartupError>((monitor, initial, server))
    }
    .await;
    let (monitor, initial, server) = match started {
        Ok(ready) => ready,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let result = monitor.run(initial, rx).await;
    if let Some(server) = server {
        if let Err(e) = server.await {
            warn!("REST API task ended abnormally: {}", e);
        }
    }
    match result {
        Ok(()) => {
            info!("OCI monitor stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("OCI monitor failed: {}", e);
            ExitCode::from(StartupError::Other(e).exit_code())
        }
    }
}
