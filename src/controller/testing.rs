//! Test doubles for the host, the container runtime and the cluster

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use k8s_openapi::api::core::v1::Node;
use kube::api::ObjectMeta;

use crate::controller::drain::{NodeCluster, PodRef};
use crate::controller::image_installer::{ContainerRuntime, ContainerSpec, PullHandle, RunOutput};
use crate::controller::service_control::{CommandRunner, ExecOutput, HostRunner};
use crate::error::{Error, Result};

/// Records every command line and answers from canned responses.
///
/// In passthrough mode unmatched commands run for real, except anything
/// touching `systemctl`.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, ExecOutput)>>,
    passthrough: bool,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn passthrough() -> Self {
        Self {
            passthrough: true,
            ..Self::default()
        }
    }

    /// Answers commands containing `pattern` with `out`. Later registrations win.
    pub fn respond(&self, pattern: impl Into<String>, out: ExecOutput) {
        self.responses.lock().unwrap().push((pattern.into(), out));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<ExecOutput> {
        let line = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        self.calls.lock().unwrap().push(line.clone());

        let canned = self
            .responses
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| line.contains(p.as_str()))
            .map(|(_, out)| out.clone());
        if let Some(out) = canned {
            return Ok(out);
        }
        if self.passthrough && !line.contains("systemctl") {
            return HostRunner::direct().run(program, args).await;
        }
        Ok(ExecOutput::ok(""))
    }
}

/// Container runtime that never touches a daemon
#[derive(Default)]
pub struct FakeRuntime {
    pub pull_chunks: Vec<String>,
    pub pull_error: Option<String>,
    pub image_id: String,
    pub run_output: String,
    pub run_incomplete: bool,
    pub run_error: Option<String>,
    /// Holds `run_once` until notified
    pub run_gate: Option<Arc<tokio::sync::Notify>>,
    pub runs: Mutex<Vec<ContainerSpec>>,
    pub logins: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn with_image_id(id: &str) -> Self {
        Self {
            image_id: id.to_string(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn login(&self, _registry: &str, user: &str, _password: &str) -> Result<()> {
        self.logins.lock().unwrap().push(user.to_string());
        Ok(())
    }

    async fn start_pull(&self, image: &str) -> Result<PullHandle> {
        let mut items: Vec<Result<String>> = self.pull_chunks.iter().cloned().map(Ok).collect();
        if let Some(reason) = &self.pull_error {
            items.push(Err(Error::PullFailed {
                image: image.to_string(),
                reason: reason.clone(),
            }));
        }
        Ok(PullHandle::new(Box::pin(stream::iter(items))))
    }

    async fn image_id(&self, _image: &str) -> Result<String> {
        Ok(self.image_id.clone())
    }

    async fn run_once(&self, spec: &ContainerSpec) -> Result<RunOutput> {
        self.runs.lock().unwrap().push(spec.clone());
        if let Some(gate) = &self.run_gate {
            gate.notified().await;
        }
        match &self.run_error {
            Some(reason) => Err(Error::RuntimeError(reason.clone())),
            None => Ok(RunOutput {
                log: self.run_output.clone(),
                complete: !self.run_incomplete,
            }),
        }
    }
}

/// In-memory cluster recording every mutation
pub struct FakeCluster {
    pub node_name: String,
    pub labels: Mutex<BTreeMap<String, String>>,
    pub pods: Mutex<Vec<PodRef>>,
    pub events: Mutex<Vec<String>>,
    pub fail_cordon: bool,
    pub fail_uncordon: bool,
    /// Pods that stay on the node after eviction
    pub stuck: Mutex<HashSet<String>>,
}

impl FakeCluster {
    pub fn new(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            labels: Mutex::new(BTreeMap::new()),
            pods: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            fail_cordon: false,
            fail_uncordon: false,
            stuck: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_pods(self, pods: Vec<PodRef>) -> Self {
        *self.pods.lock().unwrap() = pods;
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn label(&self, key: &str) -> Option<String> {
        self.labels.lock().unwrap().get(key).cloned()
    }

    pub fn node(&self) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(self.node_name.clone()),
                labels: Some(self.labels.lock().unwrap().clone()),
                ..ObjectMeta::default()
            },
            ..Node::default()
        }
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn pod(namespace: &str, name: &str, managed: bool) -> PodRef {
    PodRef {
        namespace: namespace.to_string(),
        name: name.to_string(),
        managed,
    }
}

#[async_trait]
impl NodeCluster for FakeCluster {
    async fn get_node(&self) -> Result<Node> {
        Ok(self.node())
    }

    async fn set_label(&self, key: &str, value: &str) -> Result<()> {
        self.record(format!("label {key}={value}"));
        self.labels
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_label(&self, key: &str) -> Result<()> {
        self.record(format!("unlabel {key}"));
        self.labels.lock().unwrap().remove(key);
        Ok(())
    }

    async fn volume_pods(&self) -> Result<Vec<PodRef>> {
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn set_unschedulable(&self, unschedulable: bool) -> Result<()> {
        if unschedulable {
            self.record("cordon".to_string());
            if self.fail_cordon {
                return Err(Error::DrainError("cordon rejected".into()));
            }
        } else {
            self.record("uncordon".to_string());
            if self.fail_uncordon {
                return Err(Error::DrainError("uncordon rejected".into()));
            }
        }
        Ok(())
    }

    async fn evict(&self, pod: &PodRef) -> Result<()> {
        self.record(format!("evict {}/{}", pod.namespace, pod.name));
        let stuck = self.stuck.lock().unwrap().contains(&pod.name);
        if !stuck {
            self.pods
                .lock()
                .unwrap()
                .retain(|p| !(p.namespace == pod.namespace && p.name == pod.name));
        }
        Ok(())
    }

    async fn pod_on_node(&self, pod: &PodRef) -> Result<bool> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.namespace == pod.namespace && p.name == pod.name))
    }

    fn watch_node(&self) -> BoxStream<'static, Result<Node>> {
        Box::pin(stream::empty())
    }
}
