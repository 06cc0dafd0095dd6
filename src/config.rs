//! Runtime configuration
//!
//! Every option can be given on the command line or through the environment,
//! which is how the DaemonSet manifest normally supplies it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::controller::bundle::BundleLocation;

pub const DEFAULT_IMAGE: &str = "portworx/px-enterprise:latest";
pub const DEFAULT_VOLUME_PLUGIN: &str = "kubernetes.io/portworx-volume";

/// How host commands reach the host's mount namespace
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum HostExec {
    /// Enter the host mount namespace with `nsenter`
    #[default]
    Nsenter,
    /// Run commands directly (daemon runs on the host itself)
    Direct,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct MonitorConfig {
    /// Image carrying the OCI bundle
    #[arg(long, env = "PX_IMAGE", default_value = DEFAULT_IMAGE)]
    pub image: String,

    /// Registry user for authenticated pulls
    #[arg(long, env = "REGISTRY_USER")]
    pub registry_user: Option<String>,

    /// Registry password for authenticated pulls
    #[arg(long, env = "REGISTRY_PASS", hide_env_values = true)]
    pub registry_pass: Option<String>,

    /// Verbose logging, also forwarded to the bundle installer
    #[arg(
        long,
        env = "DEBUG",
        value_parser = parse_toggle,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true"
    )]
    pub debug: bool,

    /// Name of the host service unit
    #[arg(long, env = "PX_SERVICE_NAME", default_value = "portworx")]
    pub service_name: String,

    /// Name of the one-shot installer container
    #[arg(long, default_value = "px-oci-installer")]
    pub installer_name: String,

    /// Host mount namespace reference
    #[arg(long, default_value = "/host_proc/1/ns/mnt")]
    pub host_mount_ns: PathBuf,

    /// Container runtime socket
    #[arg(long, default_value = "/var/run/docker.sock")]
    pub docker_socket: PathBuf,

    #[arg(long, value_enum, default_value_t = HostExec::Nsenter)]
    pub host_exec: HostExec,

    /// Live installation root
    #[arg(long, default_value = "/opt/pwx")]
    pub base_dir: PathBuf,

    /// Side directory the installer stages new bundles into
    #[arg(long, default_value = "/opt/pwx-staging")]
    pub staging_dir: PathBuf,

    /// Holds the previous live bundle during a swap
    #[arg(long, default_value = "/opt/pwx-scratch")]
    pub scratch_dir: PathBuf,

    /// Directory holding the host service unit files
    #[arg(long, default_value = "/etc/systemd/system")]
    pub unit_dir: PathBuf,

    /// Runtime configuration written by the bundle installer
    #[arg(long, default_value = "/etc/pwx/config.json")]
    pub runtime_config: PathBuf,

    /// Sync host filesystems before swapping bundles
    #[arg(long, env = "PX_SYNC_BEFORE_SWAP")]
    pub sync_before_swap: bool,

    /// Listen address of the local REST endpoint
    #[arg(long, env = "OCI_MON_LISTEN", default_value = "127.0.0.1:9015")]
    pub listen: SocketAddr,

    /// Downstream node health endpoint
    #[arg(long, default_value = "http://127.0.0.1:9001/v1/cluster/nodehealth")]
    pub health_url: String,

    /// Seconds after start during which an unreachable downstream is logged at debug level
    #[arg(long, default_value_t = 60)]
    pub health_grace_secs: u64,

    /// This node's name in the cluster (defaults to the host name)
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Volume plugin whose consumer pods are drained
    #[arg(long, default_value = DEFAULT_VOLUME_PLUGIN)]
    pub volume_plugin: String,

    /// Upper bound on waiting for evicted pods to leave the node
    #[arg(long, default_value_t = 300)]
    pub drain_timeout_secs: u64,

    /// Arguments forwarded to the bundle installer
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub install_args: Vec<String>,
}

fn parse_toggle(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Ok(true),
    }
}

impl MonitorConfig {
    pub fn bundle_location(&self) -> BundleLocation {
        BundleLocation {
            live: self.base_dir.clone(),
            staging: self.staging_dir.clone(),
            scratch: self.scratch_dir.clone(),
        }
    }

    /// Persisted OCI config of the live bundle
    pub fn persisted_config(&self) -> PathBuf {
        self.base_dir.join("oci").join("config.json")
    }

    pub fn unit_file(&self) -> PathBuf {
        self.unit_dir.join(format!("{}.service", self.service_name))
    }

    pub fn health_grace(&self) -> Duration {
        Duration::from_secs(self.health_grace_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
