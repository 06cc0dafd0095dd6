//! Restart-required inference from installer output
//!
//! The bundle installer reports what it changed only as free text. This
//! module is the single place that text is interpreted. Anything it does not
//! recognise resolves to "restart".

use tracing::{debug, error, info, warn};

use crate::controller::service_control::ServiceControl;
use crate::error::Result;

pub const SPEC_UNCHANGED: &str = "SPEC UNCHANGED ";
pub const SPEC_CREATED: &str = "SPEC CREATED ";
const MOUNTS_ADDED: &str = " Updated mounts: add{";
const MOUNTS_REMOVED: &str = " rm{";

pub const DEFAULT_KUBELET_ROOT: &str = "/var/lib/kubelet";

/// Whether an installer log proves the service configuration unchanged
/// (`Some(false)`), new (`Some(true)`), or needs mount-level inspection (`None`).
pub fn spec_marker(log: &str) -> Option<bool> {
    if log.contains(SPEC_UNCHANGED) {
        Some(false)
    } else if log.contains(SPEC_CREATED) {
        Some(true)
    } else {
        None
    }
}

/// Decides whether the installer output calls for a service restart.
///
/// Mount additions and removals are tolerated only while every path lies
/// under `<kubelet_root>/pods/`; those track ordinary pod churn.
pub fn needs_restart(log: &str, kubelet_root: &str) -> bool {
    spec_marker(log).unwrap_or_else(|| mounts_require_restart(log, kubelet_root))
}

/// The mount-diff half of [`needs_restart`], ignoring spec markers.
pub fn mounts_require_restart(log: &str, kubelet_root: &str) -> bool {
    let pods_dir = format!("{}/pods/", kubelet_root.trim_end_matches('/'));

    // rm{} is searched for after the end of add{}, or from the start when
    // there is no add{} block.
    let mut rm_from = 0;
    if let Some(start) = log.find(MOUNTS_ADDED) {
        let body_start = start + MOUNTS_ADDED.len();
        match block_paths(&log[body_start..]) {
            Some((paths, end)) => {
                if !all_under(&paths, &pods_dir, "add") {
                    return true;
                }
                rm_from = body_start + end;
            }
            None => {
                error!("INTERNAL ERROR - found mounts add{{ with no matching }}");
                return true;
            }
        }
    }

    if let Some(start) = log[rm_from..].find(MOUNTS_REMOVED) {
        let body_start = rm_from + start + MOUNTS_REMOVED.len();
        match block_paths(&log[body_start..]) {
            Some((paths, _)) => {
                if !all_under(&paths, &pods_dir, "rm") {
                    return true;
                }
            }
            None => {
                error!("INTERNAL ERROR - found mounts rm{{ with no matching }}");
                return true;
            }
        }
    }
    false
}

/// Splits the body of a `{...}` block, returning its paths and the offset
/// of the closing brace. `None` when the block is unterminated or empty.
fn block_paths(body: &str) -> Option<(Vec<&str>, usize)> {
    match body.find('}') {
        Some(end) if end > 0 => Some((body[..end].split_whitespace().collect(), end)),
        _ => None,
    }
}

fn all_under(paths: &[&str], prefix: &str, kind: &str) -> bool {
    paths.iter().all(|p| {
        debug!("{}/{}/", kind, p);
        p.starts_with(prefix)
    })
}

/// Extracts a `--root-dir` override from a kubelet command line.
pub fn parse_kubelet_root(cmdline: &str) -> Option<String> {
    let mut words = cmdline.split_whitespace();
    while let Some(word) = words.next() {
        if let Some(dir) = word.strip_prefix("--root-dir=") {
            if !dir.is_empty() {
                return Some(dir.to_string());
            }
        } else if word == "--root-dir" {
            return words.next().map(str::to_string);
        }
    }
    None
}

/// Locates the kubelet's state directory by inspecting the running kubelet.
///
/// Errors when no kubelet process can be found.
pub async fn kubelet_root_dir(ctl: &ServiceControl) -> Result<String> {
    info!("Locating kubelet's local state directory");
    let out = ctl
        .run_external(
            "/bin/ps",
            &[
                "--no-headers".to_string(),
                "-o".to_string(),
                "cmd".to_string(),
                "-C".to_string(),
                "kubelet".to_string(),
            ],
        )
        .await?;
    Ok(parse_kubelet_root(&out).unwrap_or_else(|| DEFAULT_KUBELET_ROOT.to_string()))
}

/// Full restart inference: markers of the install log first, then mount
/// diffs of the install and staging logs against the live kubelet's pods
/// directory. An unlocatable kubelet means restart.
pub async fn restart_required(ctl: &ServiceControl, log: &str, staging_log: Option<&str>) -> bool {
    if let Some(restart) = spec_marker(log) {
        return restart;
    }
    match kubelet_root_dir(ctl).await {
        Ok(root) => {
            mounts_require_restart(log, &root)
                || staging_log.is_some_and(|l| mounts_require_restart(l, &root))
        }
        Err(e) => {
            warn!(error = %e, "Error scanning kubelet process");
            true
        }
    }
}
