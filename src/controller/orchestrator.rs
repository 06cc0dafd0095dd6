//! Install/upgrade decision engine
//!
//! One install attempt runs pull, identity comparison, optional staging and
//! swap, then decides from the collected evidence whether the host service
//! has to be touched at all.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::controller::bundle::{BundleLocation, BundleSwapper, SelfCheck};
use crate::controller::drain::DrainCoordinator;
use crate::controller::image_installer::{
    staging_binds, ContainerConfig, ContainerSpec, ImageInstaller, InstallEvent, IMAGE_ID_KEY,
    IMAGE_KEY,
};
use crate::controller::install_state::{InstallState, InstallStatus};
use crate::controller::restart;
use crate::controller::service_control::ServiceControl;
use crate::error::Result;

/// Entrypoint of the installer container inside the bundle image
pub const INSTALLER_ENTRYPOINT: &str = "/runc-entry-point.sh";

/// Evidence gathered by one install attempt
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstallDecision {
    pub need_install: bool,
    pub need_restart: bool,
    pub need_cordon: bool,
}

impl InstallDecision {
    pub fn any(&self) -> bool {
        self.need_install || self.need_restart || self.need_cordon
    }
}

/// Static inputs of every install attempt
#[derive(Clone, Debug)]
pub struct InstallPlan {
    pub image: String,
    pub installer_name: String,
    pub bundle: BundleLocation,
    /// Persisted OCI config of the live bundle, as seen by this process
    pub persisted_config: PathBuf,
    /// Runtime config the bundle writes on the host
    pub runtime_config: PathBuf,
    pub sync_before_swap: bool,
    pub debug: bool,
    pub host_mount_ns: PathBuf,
    pub docker_socket: PathBuf,
    /// Arguments, environment and mounts forwarded to the bundle installer
    pub forwarded: ContainerConfig,
}

impl InstallPlan {
    fn staging_spec(&self) -> ContainerSpec {
        let config_dir = self
            .runtime_config
            .parent()
            .unwrap_or_else(|| Path::new("/etc/pwx"));
        let mut args = vec!["--upgrade".to_string()];
        if self.debug {
            args.push("--debug".to_string());
        }
        ContainerSpec {
            name: self.installer_name.clone(),
            image: self.image.clone(),
            binds: staging_binds(&self.bundle.staging, &self.bundle.live, config_dir),
            entrypoint: vec![INSTALLER_ENTRYPOINT.to_string()],
            args,
        }
    }

    /// Mounts this daemon needs for itself are not forwarded
    fn is_internal_mount(&self, mount: &str) -> bool {
        let mut parts = mount.split(':');
        let source = parts.next().unwrap_or_default();
        let dest = parts.next().unwrap_or_default();
        let ns_mount = !dest.is_empty() && dest != "/" && self.host_mount_ns.starts_with(dest);
        let socket = Path::new(dest) == self.docker_socket || Path::new(source) == self.docker_socket;
        ns_mount || socket
    }

    /// The live bundle's `px-runc install` invocation
    pub fn install_command(&self, pulled_id: Option<&str>) -> SelfCheck {
        let mut args = vec!["install".to_string()];
        let forwarded = &self.forwarded.args;
        match forwarded.first() {
            Some(first) if first.to_ascii_lowercase().ends_with("install") => {
                args.extend(forwarded[1..].iter().cloned())
            }
            _ => args.extend(forwarded.iter().cloned()),
        }

        for mount in &self.forwarded.mounts {
            if self.is_internal_mount(mount) {
                continue;
            }
            args.push("-v".to_string());
            args.push(mount.clone());
        }

        let image_prefix = format!("{IMAGE_KEY}=");
        let id_prefix = format!("{IMAGE_ID_KEY}=");
        let mut env: Vec<String> = self
            .forwarded
            .env
            .iter()
            .filter(|e| !e.starts_with(&id_prefix))
            .cloned()
            .collect();
        if !env.iter().any(|e| e.starts_with(&image_prefix)) {
            env.push(format!("{image_prefix}{}", self.image));
        }
        if let Some(id) = pulled_id {
            env.push(format!("{id_prefix}{id}"));
        }
        for e in env {
            args.push("-e".to_string());
            args.push(e);
        }

        SelfCheck {
            program: self.bundle.live.join("bin").join("px-runc").display().to_string(),
            args,
        }
    }
}

pub struct InstallOrchestrator {
    installer: ImageInstaller,
    swapper: BundleSwapper,
    drain: Arc<DrainCoordinator>,
    ctl: Arc<ServiceControl>,
    status: InstallStatus,
    op_lock: Arc<Mutex<()>>,
    plan: InstallPlan,
}

impl InstallOrchestrator {
    pub fn new(
        installer: ImageInstaller,
        drain: Arc<DrainCoordinator>,
        ctl: Arc<ServiceControl>,
        status: InstallStatus,
        op_lock: Arc<Mutex<()>>,
        plan: InstallPlan,
    ) -> Self {
        Self {
            installer,
            swapper: BundleSwapper::new(Arc::clone(&ctl)),
            drain,
            ctl,
            status,
            op_lock,
            plan,
        }
    }

    pub fn service(&self) -> &Arc<ServiceControl> {
        &self.ctl
    }

    pub fn status(&self) -> &InstallStatus {
        &self.status
    }

    /// Runs one install attempt under the operation lock.
    #[instrument(skip(self), fields(image = %self.plan.image))]
    pub async fn install(&self) -> Result<InstallDecision> {
        let _op = self.op_lock.lock().await;
        let result = self.install_locked().await;
        self.status.set(InstallState::Finished);
        result
    }

    async fn install_locked(&self) -> Result<InstallDecision> {
        let unit_before = match self.ctl.unit_mtime().await {
            Ok(mtime) => mtime,
            Err(e) => {
                warn!(error = %e, "Could not stat service unit");
                None
            }
        };
        let first_install = unit_before.is_none();

        let mut pull = self.installer.pull(&self.plan.image).await?;
        if let Some(InstallEvent::DownloadStarted) = pull.detect().await? {
            self.status.set(InstallState::Installing);
        }
        pull.finish().await?;

        let identity = self
            .installer
            .compare_identity(&self.plan.image, &self.plan.persisted_config, IMAGE_ID_KEY)
            .await;
        let mut decision = InstallDecision {
            need_install: identity.need_install(),
            ..InstallDecision::default()
        };
        let check = self.plan.install_command(identity.pulled.as_deref());

        if !decision.need_install {
            info!("Installing service configuration...");
            let log = self.ctl.run_external(&check.program, &check.args).await?;
            self.conclude(&mut decision, &log, None, unit_before, first_install)
                .await?;
            return Ok(decision);
        }

        self.status.set(InstallState::Installing);
        info!("Installing OCI bundle...");
        self.prepare_dirs().await?;
        let staged = self.installer.stage(&self.plan.staging_spec()).await?;
        decision.need_cordon = staged.requires_cordon();

        if self.plan.sync_before_swap {
            info!("Syncing host filesystems");
            if let Err(e) = self.ctl.run_external("/bin/sync", &[]).await {
                warn!(error = %e, "Sync before swap failed (continuing)");
            }
        }

        let guard = if decision.need_cordon {
            Some(self.drain.protect().await)
        } else {
            None
        };
        let result = async {
            let log = self.swapper.swap(&self.plan.bundle, &check).await?;
            self.conclude(
                &mut decision,
                &log,
                Some(staged.log.as_str()),
                unit_before,
                first_install,
            )
            .await
        }
        .await;
        if let Some(guard) = guard {
            guard.release().await;
        }
        result.map(|_| decision)
    }

    /// Folds the install and staging logs and the unit/runtime-config probes
    /// into the decision, then acts on it.
    async fn conclude(
        &self,
        decision: &mut InstallDecision,
        log: &str,
        staging_log: Option<&str>,
        unit_before: Option<i64>,
        first_install: bool,
    ) -> Result<()> {
        if restart::restart_required(&self.ctl, log, staging_log).await {
            info!("Service restart required due to configuration update");
            decision.need_restart = true;
        }

        match self.ctl.unit_mtime().await {
            Ok(after) if !first_install && after == unit_before => {}
            Ok(_) => {
                info!("Service restart required due to unit file change");
                decision.need_restart = true;
            }
            Err(e) => {
                warn!(error = %e, "Could not stat service unit after install");
                decision.need_restart = true;
            }
        }

        if !self
            .ctl
            .host_path_exists(&self.plan.runtime_config)
            .await
            .unwrap_or(false)
        {
            info!(
                "Service restart required due to missing/invalid {}",
                self.plan.runtime_config.display()
            );
            decision.need_restart = true;
        }

        debug!(?decision, "Install decision");
        if !decision.any() {
            info!("Service restart not required");
            return Ok(());
        }
        self.apply(first_install).await
    }

    async fn apply(&self, first_install: bool) -> Result<()> {
        self.ctl.reload().await?;
        if first_install {
            self.ctl.enable().await?;
        }
        let companion = format!("{}-reboot", self.ctl.service());
        match self.ctl.unit_exists(&companion).await {
            Ok(true) => self.ctl.enable_unit(&companion).await?,
            Ok(false) => debug!("No companion unit {}", companion),
            Err(e) => debug!(error = %e, "Could not look up companion unit"),
        }
        warn!("Restarting {} service", self.ctl.service());
        self.ctl.restart().await
    }

    async fn prepare_dirs(&self) -> Result<()> {
        let mut dirs = vec![
            self.plan.bundle.live.display().to_string(),
            self.plan.bundle.staging.display().to_string(),
        ];
        if let Some(parent) = self.plan.runtime_config.parent() {
            dirs.push(parent.display().to_string());
        }
        let mut args = vec!["-p".to_string()];
        args.extend(dirs.iter().cloned());
        if let Err(e) = self.ctl.run_external("/bin/mkdir", &args).await {
            warn!(error = %e, "Unable to create directories directly -- retry via shell");
            self.ctl
                .run_shell(format!("mkdir -p {}", dirs.join(" ")))
                .await?;
        }
        Ok(())
    }

    /// Stops, disables and removes the service under the operation lock.
    #[instrument(skip(self))]
    pub async fn uninstall(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        info!("Uninstalling {} service", self.ctl.service());
        self.ctl.stop().await?;
        self.ctl.disable().await?;
        self.ctl.remove().await
    }
}
