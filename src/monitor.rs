//! Daemon supervisor
//!
//! Wires the controller components together from the configuration, runs
//! the one-time startup install or uninstall, then owns the label watch loop
//! until shutdown is signalled. The REST server is started before startup so
//! install progress is visible while it runs.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
#[cfg(feature = "rest-api")]
use tokio::task::JoinHandle;
#[cfg(feature = "rest-api")]
use tracing::error;
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::controller::drain::{DrainCoordinator, NodeCluster};
use crate::controller::image_installer::{ContainerConfig, ContainerRuntime, ImageInstaller};
use crate::controller::install_state::InstallStatus;
use crate::controller::orchestrator::{InstallOrchestrator, InstallPlan};
use crate::controller::service_control::{CommandRunner, ServiceControl};
use crate::controller::watch::LabelWatchLoop;
use crate::error::{Result, StartupError};
use crate::labels::{Enablement, NodeLabelState, DISABLED_VALUE, ENABLEMENT_LABEL};

pub struct Monitor {
    cfg: MonitorConfig,
    cluster: Arc<dyn NodeCluster>,
    orchestrator: Arc<InstallOrchestrator>,
    drain: Arc<DrainCoordinator>,
    op_lock: Arc<Mutex<()>>,
}

impl Monitor {
    /// `forwarded` carries the environment and mounts of this daemon's own
    /// container; its arguments are replaced by the configured install args.
    pub fn new(
        cfg: MonitorConfig,
        cluster: Arc<dyn NodeCluster>,
        runtime: Arc<dyn ContainerRuntime>,
        runner: Arc<dyn CommandRunner>,
        forwarded: ContainerConfig,
    ) -> Self {
        let op_lock = Arc::new(Mutex::new(()));
        let ctl = Arc::new(ServiceControl::new(
            runner,
            cfg.service_name.clone(),
            cfg.unit_dir.clone(),
            cfg.base_dir.clone(),
        ));
        let drain = Arc::new(DrainCoordinator::new(
            Arc::clone(&cluster),
            cfg.drain_timeout(),
        ));
        let installer = ImageInstaller::new(runtime)
            .with_credentials(cfg.registry_user.clone(), cfg.registry_pass.clone());
        let plan = InstallPlan {
            image: cfg.image.clone(),
            installer_name: cfg.installer_name.clone(),
            bundle: cfg.bundle_location(),
            persisted_config: cfg.persisted_config(),
            runtime_config: cfg.runtime_config.clone(),
            sync_before_swap: cfg.sync_before_swap,
            debug: cfg.debug,
            host_mount_ns: cfg.host_mount_ns.clone(),
            docker_socket: cfg.docker_socket.clone(),
            forwarded: ContainerConfig {
                args: cfg.install_args.clone(),
                ..forwarded
            },
        };
        let orchestrator = Arc::new(InstallOrchestrator::new(
            installer,
            Arc::clone(&drain),
            ctl,
            InstallStatus::new(),
            Arc::clone(&op_lock),
            plan,
        ));
        Self {
            cfg,
            cluster,
            orchestrator,
            drain,
            op_lock,
        }
    }

    pub fn orchestrator(&self) -> &Arc<InstallOrchestrator> {
        &self.orchestrator
    }

    /// Locates this node and acts once on its enablement label.
    ///
    /// Any disabled value uninstalls here; an explicit uninstall request
    /// is then reset to the canonical disabled value.
    pub async fn startup(&self) -> std::result::Result<Enablement, StartupError> {
        let node = self
            .cluster
            .get_node()
            .await
            .map_err(|e| StartupError::NodeNotFound(e.to_string()))?;
        let enablement = NodeLabelState::from_node(&node).enablement;

        if !enablement.is_disabled() {
            self.orchestrator
                .install()
                .await
                .map_err(|source| StartupError::InitialOperation {
                    operation: "install",
                    source,
                })?;
            info!("Install done");
            return Ok(enablement);
        }

        self.orchestrator
            .uninstall()
            .await
            .map_err(|source| StartupError::InitialOperation {
                operation: "uninstall",
                source,
            })?;
        if enablement == Enablement::UninstallRequested {
            warn!(
                "Resetting label '{}' to '{}' -- expect cleanup by the cluster",
                ENABLEMENT_LABEL, DISABLED_VALUE
            );
            self.cluster
                .set_label(ENABLEMENT_LABEL, DISABLED_VALUE)
                .await?;
        }
        info!("Uninstall done");
        Ok(enablement)
    }

    #[cfg(feature = "rest-api")]
    fn api_state(&self) -> Result<crate::rest_api::ApiState> {
        Ok(crate::rest_api::ApiState {
            ctl: Arc::clone(self.orchestrator.service()),
            drain: Arc::clone(&self.drain),
            status: self.orchestrator.status().clone(),
            op_lock: Arc::clone(&self.op_lock),
            health: crate::rest_api::HealthProxy::new(
                self.cfg.health_url.clone(),
                self.cfg.health_grace(),
            )?,
        })
    }

    /// Spawns the REST server; it stops once `shutdown` flips.
    #[cfg(feature = "rest-api")]
    pub fn serve(&self, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let state = Arc::new(self.api_state()?);
        let addr = self.cfg.listen;
        Ok(tokio::spawn(async move {
            if let Err(e) = crate::rest_api::run_server(state, addr, shutdown).await {
                error!("REST API server error: {:?}", e);
            }
        }))
    }

    /// Runs the label watch loop until `shutdown` flips.
    pub async fn run(self, initial: Enablement, shutdown: watch::Receiver<bool>) -> Result<()> {
        let updates = self.cluster.watch_node();
        let watch_loop = LabelWatchLoop::new(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.cluster),
            Arc::clone(&self.op_lock),
            initial,
        );
        watch_loop.run(updates, shutdown).await;
        Ok(())
    }
}
