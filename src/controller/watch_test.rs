//! Tests for the label watch loop

#[cfg(test)]
mod tests {
    use super::super::bundle::BundleLocation;
    use super::super::drain::DrainCoordinator;
    use super::super::image_installer::{ContainerConfig, ImageInstaller};
    use super::super::install_state::InstallStatus;
    use super::super::orchestrator::{InstallOrchestrator, InstallPlan};
    use super::super::service_control::{ExecOutput, ServiceControl};
    use super::super::testing::{FakeCluster, FakeRuntime, RecordingRunner};
    use super::super::watch::LabelWatchLoop;
    use crate::labels::{Enablement, ServiceRequest, ENABLEMENT_LABEL, SERVICE_LABEL};
    use futures::stream::{self, StreamExt};
    use k8s_openapi::api::core::v1::Node;
    use kube::api::ObjectMeta;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{watch, Mutex};

    const ID: &str = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    struct Harness {
        _dir: tempfile::TempDir,
        runner: Arc<RecordingRunner>,
        cluster: Arc<FakeCluster>,
        watch: LabelWatchLoop,
    }

    fn harness(initial: Enablement) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let persisted = dir.path().join("config.json");
        let cfg = serde_json::json!({ "process": { "env": [format!("PX_IMAGE_ID={ID}")] } });
        std::fs::write(&persisted, cfg.to_string()).unwrap();

        let runner = Arc::new(RecordingRunner::new());
        runner.respond("/usr/bin/stat", ExecOutput::ok("1700000000\n"));
        runner.respond("px-runc install", ExecOutput::ok("SPEC UNCHANGED x\n"));
        let cluster = Arc::new(FakeCluster::new("node-1"));
        let op_lock = Arc::new(Mutex::new(()));
        let ctl = Arc::new(ServiceControl::new(
            runner.clone(),
            "portworx",
            "/etc/systemd/system",
            "/opt/pwx",
        ));
        let plan = InstallPlan {
            image: "portworx/px-enterprise:2.0".into(),
            installer_name: "px-oci-installer".into(),
            bundle: BundleLocation {
                live: "/opt/pwx".into(),
                staging: "/opt/pwx-staging".into(),
                scratch: "/opt/pwx-scratch".into(),
            },
            persisted_config: persisted,
            runtime_config: "/etc/pwx/config.json".into(),
            sync_before_swap: false,
            debug: false,
            host_mount_ns: "/host_proc/1/ns/mnt".into(),
            docker_socket: "/var/run/docker.sock".into(),
            forwarded: ContainerConfig::default(),
        };
        let orchestrator = Arc::new(InstallOrchestrator::new(
            ImageInstaller::new(Arc::new(FakeRuntime::with_image_id(ID))),
            Arc::new(DrainCoordinator::new(cluster.clone(), Duration::from_millis(100))),
            ctl,
            InstallStatus::new(),
            op_lock.clone(),
            plan,
        ));
        let watch = LabelWatchLoop::new(orchestrator, cluster.clone(), op_lock, initial);
        Harness {
            _dir: dir,
            runner,
            cluster,
            watch,
        }
    }

    fn node(labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-1".into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            ..Node::default()
        }
    }

    #[tokio::test]
    async fn test_repeated_service_request_runs_once() {
        let mut h = harness(Enablement::Enabled);
        let n = node(&[(SERVICE_LABEL, "stop")]);
        h.watch.handle(&n).await;
        h.watch.handle(&n).await;
        assert_eq!(h.runner.count("systemctl stop portworx"), 1);
        assert_eq!(h.watch.last_request(), Some(ServiceRequest::Stop));
        assert!(h.cluster.events().is_empty());
    }

    #[tokio::test]
    async fn test_failed_service_request_is_retried() {
        let mut h = harness(Enablement::Enabled);
        h.runner.respond("systemctl enable", ExecOutput::failed(1, "Access denied"));
        let n = node(&[(SERVICE_LABEL, "enable")]);
        h.watch.handle(&n).await;
        assert_eq!(h.watch.last_request(), None);
        h.watch.handle(&n).await;
        assert_eq!(h.runner.count("systemctl enable portworx"), 2);
    }

    #[tokio::test]
    async fn test_restart_request_clears_label_and_rearms() {
        let mut h = harness(Enablement::Enabled);
        let n = node(&[(SERVICE_LABEL, "restart")]);
        h.watch.handle(&n).await;
        assert_eq!(h.cluster.events(), vec![format!("unlabel {SERVICE_LABEL}")]);
        assert_eq!(h.watch.last_request(), None);

        h.watch.handle(&n).await;
        assert_eq!(h.runner.count("systemctl restart portworx"), 2);
    }

    #[tokio::test]
    async fn test_unknown_service_request_is_ignored() {
        let mut h = harness(Enablement::Enabled);
        h.watch.handle(&node(&[(SERVICE_LABEL, "reboot")])).await;
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_remove_label_uninstalls_and_resets_to_false() {
        let mut h = harness(Enablement::Enabled);
        h.watch.handle(&node(&[(ENABLEMENT_LABEL, "remove")])).await;

        let calls = h.runner.calls();
        assert_eq!(calls[0], "/bin/sh -c systemctl stop portworx");
        assert_eq!(calls[1], "/bin/sh -c systemctl disable portworx");
        assert!(calls.iter().any(|c| c.starts_with("/bin/rm -fr /opt/pwx")));
        assert_eq!(h.cluster.label(ENABLEMENT_LABEL).as_deref(), Some("false"));

        // the rewritten label matches the new state and triggers nothing
        h.watch.handle(&h.cluster.node()).await;
        assert_eq!(h.runner.count("systemctl stop"), 1);
    }

    #[tokio::test]
    async fn test_soft_disable_only_records_state() {
        let mut h = harness(Enablement::Enabled);
        h.watch.handle(&node(&[(ENABLEMENT_LABEL, "false")])).await;
        assert!(h.runner.calls().is_empty());
        assert!(h.cluster.events().is_empty());

        h.watch.handle(&node(&[])).await;
        assert_eq!(h.runner.count("px-runc install"), 1);
    }

    #[tokio::test]
    async fn test_failed_install_is_retried_on_next_update() {
        let mut h = harness(Enablement::SoftDisabled);
        h.runner.respond("px-runc install", ExecOutput::failed(1, "boom"));
        let n = node(&[(ENABLEMENT_LABEL, "true")]);
        h.watch.handle(&n).await;
        h.watch.handle(&n).await;
        assert_eq!(h.runner.count("px-runc install"), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(Enablement::Enabled);
        let runner = h.runner.clone();
        let updates = stream::iter(vec![Ok(node(&[(SERVICE_LABEL, "stop")]))])
            .chain(stream::pending())
            .boxed();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(h.watch.run(updates, rx));

        for _ in 0..50 {
            if runner.count("systemctl stop") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runner.count("systemctl stop portworx"), 1);
    }
}
