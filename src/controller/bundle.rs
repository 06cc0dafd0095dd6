//! Atomic promotion of a staged OCI bundle
//!
//! The installer container stages a new bundle beside the live one. A swap
//! moves the live parts aside into scratch, moves the staged parts in, and
//! verifies the result with the bundle's own installer. Any failure before
//! that verification passes puts the previous parts back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::controller::service_control::ServiceControl;
use crate::error::{Error, Result};

/// Constituent parts of a bundle, relative to its root, in swap order
pub const BUNDLE_PARTS: [&str; 3] = ["bin", "oci/rootfs", "oci/config.json"];

/// Filesystem roots involved in a swap
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleLocation {
    /// Active installation
    pub live: PathBuf,
    /// Freshly staged bundle
    pub staging: PathBuf,
    /// Previous live parts while a swap is in progress
    pub scratch: PathBuf,
}

/// Command run against the live bundle once the new parts are in place
#[derive(Clone, Debug)]
pub struct SelfCheck {
    pub program: String,
    pub args: Vec<String>,
}

pub struct BundleSwapper {
    ctl: Arc<ServiceControl>,
}

fn path_arg(p: &Path) -> String {
    p.display().to_string()
}

impl BundleSwapper {
    pub fn new(ctl: Arc<ServiceControl>) -> Self {
        Self { ctl }
    }

    /// Promotes `loc.staging` into `loc.live`.
    ///
    /// Returns the output of the self-check command. Staging and scratch are
    /// removed in the background whatever the outcome.
    #[instrument(skip(self, check), fields(live = %loc.live.display()))]
    pub async fn swap(&self, loc: &BundleLocation, check: &SelfCheck) -> Result<String> {
        let result = self.swap_inner(loc, check).await;
        self.schedule_cleanup(loc);
        result
    }

    async fn swap_inner(&self, loc: &BundleLocation, check: &SelfCheck) -> Result<String> {
        self.reset_dir(&loc.scratch)
            .await
            .map_err(|e| Error::SwapFailed(format!("could not prepare scratch: {e}")))?;

        info!("Stopping {} service before swap", self.ctl.service());
        if let Err(e) = self.ctl.stop().await {
            warn!(error = %e, "Could not stop service (continuing)");
        }

        let mut succeeded = false;
        let result = self.move_parts_and_check(loc, check, &mut succeeded).await;
        if !succeeded {
            self.rollback(loc).await;
            info!("Starting {} service on the restored bundle", self.ctl.service());
            if let Err(e) = self.ctl.start().await {
                warn!(error = %e, "Could not start service after rollback");
            }
        }
        result
    }

    async fn move_parts_and_check(
        &self,
        loc: &BundleLocation,
        check: &SelfCheck,
        succeeded: &mut bool,
    ) -> Result<String> {
        for part in BUNDLE_PARTS {
            let staged = loc.staging.join(part);
            if !self.ctl.host_path_exists(&staged).await? {
                debug!("Part {} not staged, keeping live copy", part);
                continue;
            }
            let live = loc.live.join(part);
            if self.ctl.host_path_exists(&live).await? {
                self.move_path(&live, &loc.scratch.join(part)).await?;
            }
            self.move_path(&staged, &live).await?;
            info!("Swapped bundle part {}", part);
        }

        let log = self
            .ctl
            .run_external(&check.program, &check.args)
            .await
            .map_err(|e| Error::SwapFailed(format!("self-check failed: {e}")))?;

        *succeeded = true;
        Ok(log)
    }

    /// Puts every part found in scratch back into live. Never fails; errors
    /// are logged and the next part is attempted.
    async fn rollback(&self, loc: &BundleLocation) {
        warn!("Rolling back bundle swap");
        for part in BUNDLE_PARTS.iter().rev() {
            let saved = loc.scratch.join(part);
            match self.ctl.host_path_exists(&saved).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(part, error = %e, "Could not inspect scratch during rollback");
                    continue;
                }
            }
            let live = loc.live.join(part);
            if let Err(e) = self
                .ctl
                .run_external("/bin/rm", &["-rf".to_string(), path_arg(&live)])
                .await
            {
                error!(part, error = %e, "Could not remove partial live part");
            }
            match self.move_path(&saved, &live).await {
                Ok(()) => info!("Restored bundle part {}", part),
                Err(e) => error!(part, error = %e, "Could not restore bundle part"),
            }
        }
    }

    /// Moves with `mv`, which also works across mount points.
    async fn move_path(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            self.ctl
                .run_external("/bin/mkdir", &["-p".to_string(), path_arg(parent)])
                .await?;
        }
        self.ctl
            .run_external("/bin/mv", &["-f".to_string(), path_arg(from), path_arg(to)])
            .await
            .map(|_| ())
            .map_err(|e| {
                Error::SwapFailed(format!(
                    "could not move {} to {}: {e}",
                    from.display(),
                    to.display()
                ))
            })
    }

    async fn reset_dir(&self, dir: &Path) -> Result<()> {
        self.ctl
            .run_external("/bin/rm", &["-rf".to_string(), path_arg(dir)])
            .await?;
        self.ctl
            .run_external("/bin/mkdir", &["-p".to_string(), path_arg(dir)])
            .await
            .map(|_| ())
    }

    fn schedule_cleanup(&self, loc: &BundleLocation) {
        let ctl = Arc::clone(&self.ctl);
        let dirs = vec![
            "-rf".to_string(),
            path_arg(&loc.staging),
            path_arg(&loc.scratch),
        ];
        tokio::spawn(async move {
            match ctl.run_external("/bin/rm", &dirs).await {
                Ok(_) => debug!("Removed swap staging and scratch"),
                Err(e) => warn!(error = %e, "Could not clean up after bundle swap"),
            }
        });
    }
}
