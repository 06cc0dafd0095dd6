//! Image pull, identity comparison and bundle staging
//!
//! The container runtime is reached through the [`ContainerRuntime`] trait.
//! [`DockerCli`] drives the `docker` client against the host's socket.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};

/// Marker in pull progress output showing layers are being downloaded
pub const DOWNLOAD_MARKER: &str = "Pulling fs layer";

/// Marker the bundle installer prints when the upgrade needs a reboot
pub const REBOOT_MARKER: &str = "WARNING: May require reboot to complete the Portworx upgrade";

/// Environment key carrying the image identity in the persisted OCI config
pub const IMAGE_ID_KEY: &str = "PX_IMAGE_ID";
pub const IMAGE_KEY: &str = "PX_IMAGE";

/// Amount of pull output inspected for [`DOWNLOAD_MARKER`]
const FIRST_CHUNK_BYTES: usize = 512;

/// Shorter identifiers are not trusted (`sha256:` plus digest is far longer)
const MIN_ID_LEN: usize = 20;

/// Signals raised by pull and staging, consumed by the orchestrator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallEvent {
    /// Layers are being downloaded, not just verified
    DownloadStarted,
    /// The staged bundle asked for a reboot
    RebootRequired,
    /// The installer log could not be read in full
    LogIncomplete,
}

impl InstallEvent {
    pub fn requires_cordon(self) -> bool {
        matches!(self, InstallEvent::RebootRequired | InstallEvent::LogIncomplete)
    }
}

/// One-shot container definition
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `source:destination[:options]`
    pub binds: Vec<String>,
    pub entrypoint: Vec<String>,
    pub args: Vec<String>,
}

/// Combined container output
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub log: String,
    /// False when the log stream broke off before the container exited
    pub complete: bool,
}

/// Streamed pull progress
pub struct PullHandle {
    chunks: BoxStream<'static, Result<String>>,
}

impl PullHandle {
    pub fn new(chunks: BoxStream<'static, Result<String>>) -> Self {
        Self { chunks }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn login(&self, registry: &str, user: &str, password: &str) -> Result<()>;

    async fn start_pull(&self, image: &str) -> Result<PullHandle>;

    /// Content identifier of a local image
    async fn image_id(&self, image: &str) -> Result<String>;

    /// Removes any previous container of that name, then creates, starts and
    /// waits for a privileged container. The container is left in place.
    async fn run_once(&self, spec: &ContainerSpec) -> Result<RunOutput>;
}

/// Registry host of an image reference, `None` for the default registry
pub fn registry_of(image: &str) -> Option<&str> {
    let (first, rest) = image.split_once('/')?;
    if rest.is_empty() {
        return None;
    }
    if first.contains('.') || first.contains(':') || first == "localhost" {
        Some(first)
    } else {
        None
    }
}

/// Pull in progress. [`PullProgress::detect`] inspects the first chunk of
/// output, [`PullProgress::finish`] waits for the rest.
pub struct PullProgress {
    image: String,
    handle: PullHandle,
    seen: String,
    exhausted: bool,
}

impl PullProgress {
    /// Reports [`InstallEvent::DownloadStarted`] when the first chunk shows
    /// layers being fetched. A short first chunk means nothing was downloaded.
    pub async fn detect(&mut self) -> Result<Option<InstallEvent>> {
        while self.seen.len() < FIRST_CHUNK_BYTES {
            match self.handle.chunks.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    info!("> {}", chunk.trim_end());
                    self.seen.push_str(&chunk);
                }
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            }
        }
        if self.seen.contains(DOWNLOAD_MARKER) {
            info!("Downloading image {}", self.image);
            Ok(Some(InstallEvent::DownloadStarted))
        } else {
            Ok(None)
        }
    }

    pub async fn finish(mut self) -> Result<()> {
        if self.exhausted {
            return Ok(());
        }
        while let Some(chunk) = self.handle.chunks.next().await {
            let chunk = chunk?;
            debug!("> {}", chunk.trim_end());
        }
        Ok(())
    }
}

/// Pulled versus installed image identity
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageComparison {
    pub pulled: Option<String>,
    pub installed: Option<String>,
}

fn trusted(id: Option<&str>) -> Option<&str> {
    id.filter(|id| id.len() >= MIN_ID_LEN)
}

fn short_id(id: &str) -> &str {
    id.get(7..19).unwrap_or(id)
}

impl ImageComparison {
    /// Install unless both identities are plausible and equal
    pub fn need_install(&self) -> bool {
        match (trusted(self.pulled.as_deref()), trusted(self.installed.as_deref())) {
            (Some(p), Some(i)) => p != i,
            _ => true,
        }
    }
}

#[derive(Deserialize)]
struct OciProcess {
    #[serde(default)]
    env: Vec<String>,
}

#[derive(Deserialize)]
struct OciConfig {
    process: OciProcess,
}

/// Value of `key` in the `process.env` list of an OCI runtime config. The
/// last occurrence wins; a missing key yields an empty string.
pub fn env_from_oci_config(raw: &[u8], key: &str) -> Result<String> {
    let cfg: OciConfig = serde_json::from_slice(raw)?;
    let prefix = format!("{key}=");
    Ok(cfg
        .process
        .env
        .iter()
        .rev()
        .find_map(|e| e.strip_prefix(&prefix))
        .unwrap_or_default()
        .to_string())
}

/// Output of a staging run
#[derive(Clone, Debug, Default)]
pub struct StageOutcome {
    pub log: String,
    pub events: Vec<InstallEvent>,
}

impl StageOutcome {
    pub fn requires_cordon(&self) -> bool {
        self.events.iter().any(|e| e.requires_cordon())
    }
}

pub struct ImageInstaller {
    runtime: Arc<dyn ContainerRuntime>,
    credentials: Option<(String, String)>,
}

impl ImageInstaller {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, user: Option<String>, password: Option<String>) -> Self {
        self.credentials = match (user, password) {
            (Some(u), p) if !u.is_empty() => Some((u, p.unwrap_or_default())),
            _ => None,
        };
        self
    }

    /// Starts pulling `image`, authenticating first when credentials are set.
    #[instrument(skip(self))]
    pub async fn pull(&self, image: &str) -> Result<PullProgress> {
        if let Some((user, password)) = &self.credentials {
            let registry = registry_of(image).unwrap_or_default();
            self.runtime
                .login(registry, user, password)
                .await
                .map_err(|e| Error::PullFailed {
                    image: image.to_string(),
                    reason: format!("registry login failed: {e}"),
                })?;
        }
        info!("Downloading image {}...", image);
        let handle = self
            .runtime
            .start_pull(image)
            .await
            .map_err(|e| Error::PullFailed {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        Ok(PullProgress {
            image: image.to_string(),
            handle,
            seen: String::new(),
            exhausted: false,
        })
    }

    /// Compares the pulled image against the one recorded in the live
    /// bundle's persisted config. Lookup failures leave the side `None`.
    pub async fn compare_identity(
        &self,
        image: &str,
        persisted_config: &Path,
        env_key: &str,
    ) -> ImageComparison {
        let pulled = match self.runtime.image_id(image).await {
            Ok(id) if id.len() >= MIN_ID_LEN => {
                info!("Pulled image ID {}", id);
                Some(id)
            }
            Ok(id) => {
                error!("Could not retrieve image ID (got {:?})", id);
                None
            }
            Err(e) => {
                error!(error = %e, "Could not retrieve image ID");
                None
            }
        };

        let installed = match tokio::fs::read(persisted_config).await {
            Ok(raw) => match env_from_oci_config(&raw, env_key) {
                Ok(id) if !id.is_empty() => Some(id),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "Could not parse installed OCI config");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "Could not retrieve installed OCI image ID");
                None
            }
        };

        let cmp = ImageComparison { pulled, installed };
        match (trusted(cmp.pulled.as_deref()), trusted(cmp.installed.as_deref())) {
            (Some(p), Some(i)) if p == i => {
                info!("Installed image ID {} same as pulled image ID {}", short_id(i), short_id(p))
            }
            (Some(p), Some(i)) => info!(
                "Installed image ID {} _DIFFERENT_ than pulled image ID {}",
                short_id(i),
                short_id(p)
            ),
            _ => debug!("Image identity undetermined, installing"),
        }
        cmp
    }

    /// Runs the installer container that stages a new bundle.
    #[instrument(skip(self, spec), fields(container = %spec.name, image = %spec.image))]
    pub async fn stage(&self, spec: &ContainerSpec) -> Result<StageOutcome> {
        let out = self
            .runtime
            .run_once(spec)
            .await
            .map_err(|e| Error::StageFailed {
                image: spec.image.clone(),
                reason: e.to_string(),
            })?;

        let mut events = Vec::new();
        if !out.complete {
            warn!("Could not get complete {} log", spec.name);
            events.push(InstallEvent::LogIncomplete);
        } else if out.log.contains(REBOOT_MARKER) {
            warn!("Staged bundle may require a reboot, node will be drained");
            events.push(InstallEvent::RebootRequired);
        } else {
            info!("Bundle staged OK");
        }
        Ok(StageOutcome {
            log: out.log,
            events,
        })
    }
}

/// Arguments, environment and mounts of a running container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    pub args: Vec<String>,
    pub env: Vec<String>,
    /// Docker CLI form, `source:destination[:options]`
    pub mounts: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectMount {
    #[serde(default)]
    source: String,
    destination: String,
    #[serde(default)]
    propagation: String,
    #[serde(rename = "RW", default)]
    rw: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    env: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainer {
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    config: InspectConfig,
    #[serde(default)]
    mounts: Vec<InspectMount>,
    #[serde(default)]
    hosts_path: String,
    #[serde(default)]
    resolv_conf_path: String,
}

fn format_mount(m: &InspectMount) -> String {
    let mut out = format!("{}:{}", m.source, m.destination);
    let mut sep = ':';
    let prop = m.propagation.trim();
    if !prop.is_empty() && prop != "private" && prop != "rprivate" {
        out.push(sep);
        out.push_str(prop);
        sep = ',';
    }
    if !m.rw {
        out.push(sep);
        out.push_str("ro");
    }
    out
}

/// Parses `docker inspect` output for a single container.
pub fn parse_container_inspect(raw: &[u8]) -> Result<ContainerConfig> {
    let mut list: Vec<InspectContainer> = serde_json::from_slice(raw)?;
    if list.is_empty() {
        return Err(Error::RuntimeError("container not found".into()));
    }
    let c = list.swap_remove(0);

    let mut by_dest: HashMap<&str, String> = HashMap::new();
    let mut mounts = Vec::with_capacity(c.mounts.len() + 2);
    for m in &c.mounts {
        let formatted = format_mount(m);
        if let Some(old) = by_dest.insert(&m.destination, formatted.clone()) {
            warn!("Overriding mount-entry for '{}' - from {} to {}", m.destination, old, formatted);
        }
        mounts.push(formatted);
    }
    for (source, dest) in [
        (&c.hosts_path, "/etc/hosts"),
        (&c.resolv_conf_path, "/etc/resolv.conf"),
    ] {
        if !source.is_empty() && !by_dest.contains_key(dest) {
            mounts.push(format!("{source}:{dest}:ro"));
        }
    }

    Ok(ContainerConfig {
        args: c.args,
        env: c.config.env.unwrap_or_default(),
        mounts,
    })
}

/// Container runtime driven through the `docker` CLI
#[derive(Clone, Debug)]
pub struct DockerCli {
    host: String,
}

impl DockerCli {
    pub fn new(socket: &Path) -> Self {
        Self {
            host: format!("unix://{}", socket.display()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("-H").arg(&self.host).kill_on_drop(true);
        cmd
    }

    async fn output(&self, args: &[&str]) -> Result<String> {
        let out = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).into_owned())
        } else {
            Err(Error::RuntimeError(format!(
                "docker {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }

    /// Arguments, environment and mounts of container `id`
    pub async fn inspect_container(&self, id: &str) -> Result<ContainerConfig> {
        let raw = self.output(&["inspect", "--type", "container", id]).await?;
        parse_container_inspect(raw.as_bytes())
    }
}

async fn forward_prefixed<R>(reader: R, prefix: &'static str, tx: mpsc::UnboundedSender<Result<String>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(Ok(format!("{prefix}{line}"))).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(e.into()));
                break;
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn login(&self, registry: &str, user: &str, password: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["login", "--username", user, "--password-stdin"]);
        if !registry.is_empty() {
            cmd.arg(registry);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(password.as_bytes()).await?;
        }
        let out = child.wait_with_output().await?;
        if out.status.success() {
            Ok(())
        } else {
            Err(Error::RuntimeError(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ))
        }
    }

    async fn start_pull(&self, image: &str) -> Result<PullHandle> {
        let mut child = self
            .command()
            .args(["pull", image])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::RuntimeError("pull output unavailable".into()))?;
        let image = image.to_string();

        let lines = BufReader::new(stdout).lines();
        let chunks = stream::unfold(Some((lines, child)), move |state| {
            let image = image.clone();
            async move {
                let Some((mut lines, mut child)) = state else {
                    return None;
                };
                match lines.next_line().await {
                    Ok(Some(line)) => Some((Ok(format!("{line}\n")), Some((lines, child)))),
                    Ok(None) => {
                        let mut stderr = String::new();
                        if let Some(mut err) = child.stderr.take() {
                            let _ = err.read_to_string(&mut stderr).await;
                        }
                        match child.wait().await {
                            Ok(status) if status.success() => None,
                            Ok(status) => Some((
                                Err(Error::PullFailed {
                                    image,
                                    reason: format!("{status}: {}", stderr.trim()),
                                }),
                                None,
                            )),
                            Err(e) => Some((Err(e.into()), None)),
                        }
                    }
                    Err(e) => Some((Err(e.into()), None)),
                }
            }
        });
        Ok(PullHandle::new(chunks.boxed()))
    }

    async fn image_id(&self, image: &str) -> Result<String> {
        let id = self
            .output(&["image", "inspect", "--format", "{{.Id}}", image])
            .await?;
        Ok(id.trim().to_string())
    }

    async fn run_once(&self, spec: &ContainerSpec) -> Result<RunOutput> {
        info!("Removing old container {} (if any)", spec.name);
        let removed = self.output(&["rm", "-f", "-v", spec.name.as_str()]).await;
        debug!(ok = removed.is_ok(), "Old container removed");

        let mut create = self.command();
        create.args(["create", "--name", spec.name.as_str(), "--privileged"]);
        for bind in &spec.binds {
            create.arg("-v").arg(bind);
        }
        let mut entry = spec.entrypoint.iter();
        if let Some(first) = entry.next() {
            info!("Overriding entrypoint with {:?}", spec.entrypoint);
            create.arg("--entrypoint").arg(first);
        }
        create.arg(&spec.image).args(entry).args(&spec.args);
        info!("Creating container from image {}", spec.image);
        let out = create.stdin(Stdio::null()).output().await?;
        if !out.status.success() {
            return Err(Error::RuntimeError(format!(
                "Could not create container {}: {}",
                spec.name,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        info!("Starting container {} [{}]", spec.name, spec.image);
        let mut child = self
            .command()
            .args(["start", "--attach", spec.name.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_prefixed(stdout, "> ", tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_prefixed(stderr, "E ", tx.clone()));
        }
        drop(tx);

        let mut log = String::new();
        let mut complete = true;
        while let Some(line) = rx.recv().await {
            match line {
                Ok(line) => {
                    info!("{}", line);
                    log.push_str(&line);
                    log.push('\n');
                }
                Err(e) => {
                    warn!(error = %e, "Container log stream broke off");
                    complete = false;
                }
            }
        }

        let status = child.wait().await?;
        warn!("NOTE: Not removing the {} container", spec.name);
        if !status.success() {
            return Err(Error::RuntimeError(format!(
                "Expected status code '0', got {}",
                status.code().unwrap_or(-1)
            )));
        }
        Ok(RunOutput { log, complete })
    }
}

/// Bind mounts of the installer container: the staging root stands in for
/// the live root, the runtime config directory is shared as is.
pub fn staging_binds(staging: &Path, live: &Path, runtime_config_dir: &Path) -> Vec<String> {
    vec![
        format!("{}:{}", staging.display(), live.display()),
        format!("{0}:{0}", runtime_config_dir.display()),
    ]
}
