//! Host-side probes run once at startup

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tracing::debug;

use crate::config::MonitorConfig;
use crate::error::{Error, Result};

pub const CGROUP_FILE: &str = "/proc/self/cgroup";

const CONTAINER_ID_LEN: usize = 64;

/// Checks that every path exists and sits on a different device than `/`,
/// i.e. was bind-mounted into this container.
pub fn validate_mounts<P: AsRef<Path>>(mounts: &[P]) -> std::result::Result<(), String> {
    let root = std::fs::symlink_metadata("/")
        .map_err(|e| format!("INTERNAL ERROR - could not stat '/': {e}"))?;
    for mount in mounts {
        let mount = mount.as_ref();
        match std::fs::symlink_metadata(mount) {
            Err(e) => {
                return Err(format!(
                    "File/Directory {} not found ({}) - please mount via 'run -v ...' option",
                    mount.display(),
                    e
                ))
            }
            Ok(meta) if meta.dev() == root.dev() => {
                return Err(format!(
                    "File/Directory {} not mounted - please mount via 'run -v ...' option",
                    mount.display()
                ))
            }
            Ok(_) => debug!("Mount {} validated", mount.display()),
        }
    }
    Ok(())
}

fn hex_id_at(s: &str, start: usize) -> Option<&str> {
    let id = s.get(start..start + CONTAINER_ID_LEN)?;
    id.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        .then_some(id)
}

/// Extracts the container id from cgroup file content.
///
/// Looks at `<n>:name=<controller>:<path>` lines and takes the last 64-hex
/// segment that follows a `/` or `-` in the path.
pub fn parse_container_id(cgroup: &str) -> Option<String> {
    for line in cgroup.lines() {
        let Some((hier, rest)) = line.split_once(':') else {
            continue;
        };
        if hier.is_empty() || !hier.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Some(rest) = rest.strip_prefix("name=") else {
            continue;
        };
        let found = rest
            .char_indices()
            .filter(|(_, c)| *c == '/' || *c == '-')
            .filter_map(|(i, _)| hex_id_at(rest, i + 1))
            .last();
        if let Some(id) = found {
            return Some(id.to_string());
        }
    }
    None
}

/// Id of the container this process runs in.
pub async fn own_container_id() -> Result<String> {
    let content = tokio::fs::read_to_string(CGROUP_FILE).await?;
    parse_container_id(&content).ok_or_else(|| {
        Error::RuntimeError(format!("no container id found in {CGROUP_FILE}"))
    })
}

/// Configured node name, or the host name.
pub fn node_name(cfg: &MonitorConfig) -> Result<String> {
    if let Some(name) = cfg.node_name.as_deref().filter(|n| !n.is_empty()) {
        return Ok(name.to_string());
    }
    let host = hostname::get()?;
    host.into_string()
        .map_err(|h| Error::ConfigError(format!("host name {h:?} is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    const ID: &str = "8d5a9a4d1c7f4b2f3e1a0b9c8d7e6f5a4b3c2d1e0f9a8b7c6d5e4f3a2b1c0d9e";

    #[test]
    fn test_container_id_systemd_scope() {
        let cgroup = format!(
            "11:cpuset:/\n2:cpu,cpuacct:/system.slice/docker-{ID}.scope\n1:name=systemd:/system.slice/docker-{ID}.scope\n"
        );
        assert_eq!(parse_container_id(&cgroup).as_deref(), Some(ID));
    }

    #[test]
    fn test_container_id_kubepods_path() {
        let cgroup = format!(
            "1:name=systemd:/kubepods/besteffort/pod3a1c4e2b-1d2f-11e8-9d1c-080027b6f1aa/{ID}\n"
        );
        assert_eq!(parse_container_id(&cgroup).as_deref(), Some(ID));
    }

    #[test]
    fn test_container_id_absent() {
        assert_eq!(parse_container_id("1:name=systemd:/user.slice/user-1000.slice\n"), None);
        // only the named hierarchy is considered
        assert_eq!(parse_container_id(&format!("4:memory:/docker/{ID}\n")), None);
        assert_eq!(parse_container_id(&format!("1:name=systemd:/docker/{}\n", &ID[..40])), None);
    }

    #[test]
    fn test_validate_mounts_rejects_missing_and_unmounted() {
        let err = validate_mounts(&["/definitely/not/here"]).unwrap_err();
        assert!(err.contains("not found"), "{err}");

        let dir = tempfile::tempdir().unwrap();
        if std::fs::metadata(dir.path()).unwrap().dev() == std::fs::metadata("/").unwrap().dev() {
            let err = validate_mounts(&[dir.path()]).unwrap_err();
            assert!(err.contains("not mounted"), "{err}");
        }
    }

    #[test]
    fn test_node_name_prefers_config() {
        let cfg = MonitorConfig::parse_from(["oci-monitor", "--node-name", "worker-3"]);
        assert_eq!(node_name(&cfg).unwrap(), "worker-3");
    }
}
