//! Node-level install controller
//!
//! Service control on the host, the image pull/stage/swap pipeline, drain
//! coordination, the install orchestrator and the node label watch loop.

pub mod bundle;
pub mod drain;
pub mod image_installer;
pub mod install_state;
pub mod orchestrator;
pub mod restart;
pub mod service_control;
#[cfg(test)]
pub(crate) mod testing;
pub mod watch;
#[cfg(test)]
mod watch_test;

pub use bundle::{BundleLocation, BundleSwapper, SelfCheck};
pub use drain::{CordonGuard, DrainCoordinator, DrainOutcome, KubeCluster, NodeCluster, PodRef};
pub use image_installer::{
    ContainerConfig, ContainerRuntime, DockerCli, ImageInstaller, InstallEvent,
};
pub use install_state::{InstallState, InstallStatus};
pub use orchestrator::{InstallDecision, InstallOrchestrator, InstallPlan};
pub use restart::needs_restart;
pub use service_control::{CommandRunner, ExecOutput, HostRunner, ServiceControl};
pub use watch::LabelWatchLoop;
