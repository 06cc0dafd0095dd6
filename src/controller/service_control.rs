//! Host service control
//!
//! The daemon runs inside a container; every service lifecycle operation and
//! every filesystem manipulation of the installation happens in the host's
//! mount namespace through a [`CommandRunner`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::labels::ServiceRequest;

const NSENTER: &str = "/usr/bin/nsenter";
const SHELL: &str = "/bin/sh";

/// Combined result of a finished host command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// Interleaved stdout and stderr, one line per entry
    pub output: String,
}

impl ExecOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            output: output.into(),
        }
    }

    pub fn failed(code: i32, output: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            output: output.into(),
        }
    }
}

/// Runs a command to completion, streaming its output to the log while capturing it
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<ExecOutput>;
}

/// Runs commands on the host, optionally entering its mount namespace
#[derive(Clone, Debug)]
pub struct HostRunner {
    mount_ns: Option<PathBuf>,
}

impl HostRunner {
    pub fn nsenter(mount_ns: impl Into<PathBuf>) -> Self {
        Self {
            mount_ns: Some(mount_ns.into()),
        }
    }

    pub fn direct() -> Self {
        Self { mount_ns: None }
    }

    fn command_line(&self, program: &str, args: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 4);
        if let Some(ns) = &self.mount_ns {
            argv.push(NSENTER.to_string());
            argv.push(format!("--mount={}", ns.display()));
            argv.push("--".to_string());
        }
        argv.push(program.to_string());
        argv.extend(args.iter().cloned());
        argv
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<ExecOutput> {
        let argv = self.command_line(program, args);
        info!("> run: {} {}", program, args.join(" "));
        debug!(">>> {:?}", argv);

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let mut output = String::new();
        while let Some(line) = rx.recv().await {
            info!("| {}", line);
            output.push_str(&line);
            output.push('\n');
        }

        let status = child.wait().await?;
        Ok(ExecOutput {
            success: status.success(),
            code: status.code(),
            output,
        })
    }
}

/// systemctl-like control over the host service of the installed bundle
pub struct ServiceControl {
    runner: Arc<dyn CommandRunner>,
    service: String,
    unit_dir: PathBuf,
    base_dir: PathBuf,
}

impl ServiceControl {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        service: impl Into<String>,
        unit_dir: impl Into<PathBuf>,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            service: service.into(),
            unit_dir: unit_dir.into(),
            base_dir: base_dir.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn unit_file(&self) -> PathBuf {
        self.unit_path(&self.service)
    }

    fn unit_path(&self, unit: &str) -> PathBuf {
        self.unit_dir.join(format!("{unit}.service"))
    }

    /// Runs an arbitrary host command, failing on a non-zero exit status.
    ///
    /// Returns the captured output on success.
    pub async fn run_external(&self, program: &str, args: &[String]) -> Result<String> {
        let out = self.runner.run(program, args).await?;
        if out.success {
            Ok(out.output)
        } else {
            Err(Error::CommandFailed {
                command: format!("{} {}", program, args.join(" ")),
                code: out.code,
                output: out.output,
            })
        }
    }

    /// Runs a shell snippet on the host.
    pub async fn run_shell(&self, script: impl Into<String>) -> Result<String> {
        self.run_external(SHELL, &["-c".to_string(), script.into()])
            .await
    }

    async fn systemctl(&self, op: &str, unit: &str) -> Result<()> {
        info!("Doing {} service {}", unit, op);
        let res = self.run_shell(format!("systemctl {op} {unit}")).await;
        debug!(op, ok = res.is_ok(), "systemctl finished");
        res.map(|_| ())
    }

    pub async fn start(&self) -> Result<()> {
        self.systemctl("start", &self.service).await
    }

    /// Stops the service; a unit that is not loaded counts as stopped.
    pub async fn stop(&self) -> Result<()> {
        match self.systemctl("stop", &self.service).await {
            Err(e) if e.command_output().contains(" not loaded") => {
                info!("Service {} not loaded, nothing to stop", self.service);
                Ok(())
            }
            other => other,
        }
    }

    pub async fn restart(&self) -> Result<()> {
        self.systemctl("restart", &self.service).await
    }

    pub async fn enable(&self) -> Result<()> {
        self.systemctl("enable", &self.service).await
    }

    /// Disables the service; a missing unit file counts as disabled.
    pub async fn disable(&self) -> Result<()> {
        match self.systemctl("disable", &self.service).await {
            Err(e) if e.command_output().contains("No such file or directory") => {
                info!("Service {} already disabled", self.service);
                Ok(())
            }
            other => other,
        }
    }

    /// Enables another unit, e.g. a companion of the main service.
    pub async fn enable_unit(&self, unit: &str) -> Result<()> {
        self.systemctl("enable", unit).await
    }

    /// Reloads the init system's unit cache.
    pub async fn reload(&self) -> Result<()> {
        info!("Reloading services");
        self.run_shell("systemctl daemon-reload").await.map(|_| ())
    }

    /// Removes the installation and its unit file from the host.
    #[instrument(skip(self), fields(service = %self.service))]
    pub async fn remove(&self) -> Result<()> {
        let oci_dir = self.base_dir.join("oci");
        let oci = oci_dir.display();
        info!("Removing service bind-mount (if any)");
        if let Err(e) = self
            .run_shell(format!(
                "if grep -q ' {oci} {oci} ' /proc/self/mountinfo; then umount {oci}; fi"
            ))
            .await
        {
            warn!(error = %e, "Could not bind-umount installation files (continuing)");
        }

        info!("Removing installation files");
        self.run_external(
            "/bin/rm",
            &[
                "-fr".to_string(),
                self.base_dir.display().to_string(),
                self.unit_file().display().to_string(),
            ],
        )
        .await
        .map(|_| ())
    }

    /// Runs a lifecycle request. Install and removal are driven by the
    /// orchestrator and have no request form.
    pub async fn apply(&self, req: ServiceRequest) -> Result<()> {
        match req {
            ServiceRequest::Start => self.start().await,
            ServiceRequest::Stop => self.stop().await,
            ServiceRequest::Restart => self.restart().await,
            ServiceRequest::Enable => self.enable().await,
            ServiceRequest::Disable => self.disable().await,
        }
    }

    /// Runs a lifecycle request by name. Anything outside
    /// start/stop/restart/enable/disable is rejected with
    /// [`Error::UnsupportedRequest`].
    pub async fn handle_request(&self, op: &str) -> Result<()> {
        let req = op.parse::<ServiceRequest>()?;
        self.apply(req).await
    }

    /// Whether a path exists on the host.
    pub async fn host_path_exists(&self, path: &Path) -> Result<bool> {
        let out = self
            .runner
            .run("/usr/bin/test", &["-e".to_string(), path.display().to_string()])
            .await?;
        Ok(out.success)
    }

    pub async fn unit_exists(&self, unit: &str) -> Result<bool> {
        self.host_path_exists(&self.unit_path(unit)).await
    }

    /// Modification time (seconds since epoch) of the service's unit file,
    /// `None` when the file does not exist.
    pub async fn unit_mtime(&self) -> Result<Option<i64>> {
        let out = self
            .runner
            .run(
                "/usr/bin/stat",
                &[
                    "-c".to_string(),
                    "%Y".to_string(),
                    self.unit_file().display().to_string(),
                ],
            )
            .await?;
        if !out.success {
            return Ok(None);
        }
        Ok(out
            .output
            .lines()
            .find_map(|l| l.trim().parse::<i64>().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::RecordingRunner;

    fn control(runner: Arc<RecordingRunner>) -> ServiceControl {
        ServiceControl::new(runner, "portworx", "/etc/systemd/system", "/opt/pwx")
    }

    #[test]
    fn test_nsenter_command_line() {
        let runner = HostRunner::nsenter("/host_proc/1/ns/mnt");
        let argv = runner.command_line("/bin/sh", &["-c".into(), "true".into()]);
        assert_eq!(
            argv,
            vec![
                "/usr/bin/nsenter",
                "--mount=/host_proc/1/ns/mnt",
                "--",
                "/bin/sh",
                "-c",
                "true"
            ]
        );
        let argv = HostRunner::direct().command_line("/bin/true", &[]);
        assert_eq!(argv, vec!["/bin/true"]);
    }

    #[tokio::test]
    async fn test_direct_runner_captures_both_streams() {
        let out = HostRunner::direct()
            .run(
                "/bin/sh",
                &["-c".into(), "echo hello; echo oops 1>&2; exit 3".into()],
            )
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(3));
        assert!(out.output.contains("hello"));
        assert!(out.output.contains("oops"));
    }

    #[tokio::test]
    async fn test_stop_tolerates_not_loaded() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(
            "systemctl stop portworx",
            ExecOutput::failed(5, "Failed to stop portworx.service: Unit portworx.service not loaded."),
        );
        control(runner.clone()).stop().await.unwrap();
        assert_eq!(runner.count("systemctl stop portworx"), 1);
    }

    #[tokio::test]
    async fn test_stop_propagates_other_failures() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("systemctl stop", ExecOutput::failed(1, "Access denied"));
        let err = control(runner).stop().await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_handle_request_rejects_unknown_verbs() {
        let runner = Arc::new(RecordingRunner::new());
        let ctl = control(runner.clone());
        for verb in ["install", "uninstall", "remove", "bogus"] {
            assert!(matches!(
                ctl.handle_request(verb).await,
                Err(Error::UnsupportedRequest(_))
            ));
        }
        assert!(runner.calls().is_empty());

        ctl.handle_request("enable").await.unwrap();
        assert_eq!(runner.count("systemctl enable portworx"), 1);
    }

    #[tokio::test]
    async fn test_remove_continues_after_umount_failure() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("umount", ExecOutput::failed(32, "umount: target is busy"));
        control(runner.clone()).remove().await.unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].starts_with("/bin/rm -fr /opt/pwx /etc/systemd/system/portworx.service"));
    }

    #[tokio::test]
    async fn test_remove_surfaces_deletion_failure() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("/bin/rm", ExecOutput::failed(1, "Permission denied"));
        assert!(control(runner).remove().await.is_err());
    }

    #[tokio::test]
    async fn test_unit_mtime() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("/usr/bin/stat", ExecOutput::ok("1700000000\n"));
        assert_eq!(control(runner).unit_mtime().await.unwrap(), Some(1_700_000_000));

        let runner = Arc::new(RecordingRunner::new());
        runner.respond("/usr/bin/stat", ExecOutput::failed(1, "No such file"));
        assert_eq!(control(runner).unit_mtime().await.unwrap(), None);
    }
}
