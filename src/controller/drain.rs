//! Cordon and drain of this node around disruptive upgrades
//!
//! Only pods consuming the managed volume plugin are evicted. A drain that
//! finds nothing to evict leaves the node schedulable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::{
    api::{Api, EvictParams, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{watcher, WatchStreamExt},
    ResourceExt,
};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};

/// CSI driver name the volume plugin is also known by
const CSI_DRIVER: &str = "pxd.portworx.com";
const PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";

/// A pod selected for eviction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    /// Owned by a controller that reschedules it
    pub managed: bool,
}

/// This node's view of the cluster
#[async_trait]
pub trait NodeCluster: Send + Sync {
    async fn get_node(&self) -> Result<Node>;

    async fn set_label(&self, key: &str, value: &str) -> Result<()>;

    async fn remove_label(&self, key: &str) -> Result<()>;

    /// Pods on this node with at least one volume of the managed plugin
    async fn volume_pods(&self) -> Result<Vec<PodRef>>;

    async fn set_unschedulable(&self, unschedulable: bool) -> Result<()>;

    async fn evict(&self, pod: &PodRef) -> Result<()>;

    /// Whether the pod still runs on this node
    async fn pod_on_node(&self, pod: &PodRef) -> Result<bool>;

    /// Every change to this node's object
    fn watch_node(&self) -> BoxStream<'static, Result<Node>>;
}

/// [`NodeCluster`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    node_name: String,
    volume_plugin: String,
}

impl KubeCluster {
    pub fn new(client: Client, node_name: impl Into<String>, volume_plugin: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            volume_plugin: volume_plugin.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    async fn patch_node(&self, patch: serde_json::Value) -> Result<()> {
        self.nodes()
            .patch(&self.node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    fn is_plugin_pv(&self, pv: &PersistentVolume) -> bool {
        if pv
            .annotations()
            .get(PROVISIONED_BY)
            .is_some_and(|p| p == &self.volume_plugin || p == CSI_DRIVER)
        {
            return true;
        }
        pv.spec.as_ref().is_some_and(|spec| {
            spec.portworx_volume.is_some()
                || spec.csi.as_ref().is_some_and(|csi| csi.driver == CSI_DRIVER)
        })
    }

    /// Resolves a claim to its volume. Unbound or vanished claims do not count.
    async fn claim_uses_plugin(&self, namespace: &str, claim: &str) -> Result<bool> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let Some(pvc) = pvcs.get_opt(claim).await? else {
            return Ok(false);
        };
        let Some(volume) = pvc.spec.and_then(|s| s.volume_name) else {
            return Ok(false);
        };
        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(pvs
            .get_opt(&volume)
            .await?
            .is_some_and(|pv| self.is_plugin_pv(&pv)))
    }

    async fn pod_uses_plugin(&self, pod: &Pod, claims: &mut HashMap<(String, String), bool>) -> Result<bool> {
        let namespace = pod.namespace().unwrap_or_default();
        let volumes = pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_ref())
            .map(Vec::as_slice)
            .unwrap_or_default();
        for vol in volumes {
            if vol.portworx_volume.is_some() {
                return Ok(true);
            }
            if let Some(pvc) = &vol.persistent_volume_claim {
                let key = (namespace.clone(), pvc.claim_name.clone());
                let uses = match claims.get(&key) {
                    Some(uses) => *uses,
                    None => {
                        let uses = self.claim_uses_plugin(&namespace, &pvc.claim_name).await?;
                        claims.insert(key, uses);
                        uses
                    }
                };
                if uses {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

fn is_managed(pod: &Pod) -> bool {
    pod.owner_references()
        .iter()
        .any(|o| o.controller == Some(true))
}

#[async_trait]
impl NodeCluster for KubeCluster {
    async fn get_node(&self) -> Result<Node> {
        self.nodes()
            .get_opt(&self.node_name)
            .await?
            .ok_or_else(|| Error::NodeNotFound(self.node_name.clone()))
    }

    async fn set_label(&self, key: &str, value: &str) -> Result<()> {
        info!("Setting label {}={} on node {}", key, value, self.node_name);
        self.patch_node(json!({ "metadata": { "labels": { key: value } } }))
            .await
    }

    async fn remove_label(&self, key: &str) -> Result<()> {
        info!("Removing label {} from node {}", key, self.node_name);
        self.patch_node(json!({ "metadata": { "labels": { key: null } } }))
            .await
    }

    async fn volume_pods(&self) -> Result<Vec<PodRef>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        let mut claims = HashMap::new();
        let mut out = Vec::new();
        for pod in pods.list(&lp).await? {
            if self.pod_uses_plugin(&pod, &mut claims).await? {
                out.push(PodRef {
                    namespace: pod.namespace().unwrap_or_default(),
                    name: pod.name_any(),
                    managed: is_managed(&pod),
                });
            }
        }
        Ok(out)
    }

    async fn set_unschedulable(&self, unschedulable: bool) -> Result<()> {
        self.patch_node(json!({ "spec": { "unschedulable": unschedulable } }))
            .await
    }

    async fn evict(&self, pod: &PodRef) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        match pods.evict(&pod.name, &EvictParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!("Pod {}/{} already gone", pod.namespace, pod.name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn pod_on_node(&self, pod: &PodRef) -> Result<bool> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        Ok(pods.get_opt(&pod.name).await?.is_some_and(|p| {
            p.spec.and_then(|s| s.node_name).as_deref() == Some(self.node_name.as_str())
        }))
    }

    fn watch_node(&self) -> BoxStream<'static, Result<Node>> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.node_name));
        watcher(self.nodes(), config)
            .default_backoff()
            .applied_objects()
            .map(|res| res.map_err(Error::from))
            .boxed()
    }
}

/// Result of a drain request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// No matching pods; the node was not cordoned
    NothingToDrain,
    /// The node is cordoned and the pods are gone
    Drained,
}

pub struct DrainCoordinator {
    cluster: Arc<dyn NodeCluster>,
    timeout: Duration,
    poll_interval: Duration,
}

fn pod_names(pods: &[PodRef]) -> String {
    pods.iter()
        .map(|p| p.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl DrainCoordinator {
    pub fn new(cluster: Arc<dyn NodeCluster>, timeout: Duration) -> Self {
        Self {
            cluster,
            timeout,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Cordons the node and evicts the pods using the managed volumes.
    ///
    /// With `include_unmanaged` false only controller-owned pods are evicted.
    /// After [`DrainOutcome::Drained`] the caller must [`Self::uncordon`].
    #[instrument(skip(self))]
    pub async fn drain(&self, include_unmanaged: bool) -> Result<DrainOutcome> {
        let mut pods = self
            .cluster
            .volume_pods()
            .await
            .map_err(|e| Error::DrainError(format!("Failed to get volume consumer pods: {e}")))?;

        if !include_unmanaged && !pods.is_empty() {
            let before = pod_names(&pods);
            pods.retain(|p| p.managed);
            let after = pod_names(&pods);
            if before != after {
                info!("Reduced list of volume consumer pods from '{}' to '{}'", before, after);
            }
        }

        if pods.is_empty() {
            info!("No volume consumer pods found");
            return Ok(DrainOutcome::NothingToDrain);
        }

        let names = pod_names(&pods);
        match self.evict_all(&pods).await {
            Ok(()) => {
                warn!(pods = %names, "Volume consumer pods drained successfully - node cordon in effect");
                Ok(DrainOutcome::Drained)
            }
            Err(e) => {
                warn!(pods = %names, error = %e, "Failed to drain volume consumer pods");
                Err(Error::DrainError(format!("Failed to drain pods: {e}")))
            }
        }
    }

    async fn evict_all(&self, pods: &[PodRef]) -> Result<()> {
        self.cluster.set_unschedulable(true).await?;
        for pod in pods {
            self.cluster.evict(pod).await?;
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut remaining = pods.to_vec();
        loop {
            let mut still = Vec::new();
            for pod in remaining {
                if self.cluster.pod_on_node(&pod).await? {
                    still.push(pod);
                }
            }
            if still.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::DrainError(format!(
                    "timed out waiting for pods to leave: {}",
                    pod_names(&still)
                )));
            }
            remaining = still;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn uncordon(&self) -> Result<()> {
        info!("Uncordoning node");
        self.cluster.set_unschedulable(false).await
    }

    /// Drains all volume consumers ahead of a disruptive section and returns
    /// a guard that uncordons afterwards. Drain failures are logged; the
    /// protected section goes ahead regardless.
    pub async fn protect(&self) -> CordonGuard {
        match self.drain(true).await {
            Ok(outcome) => debug!(?outcome, "Drain before upgrade finished"),
            Err(e) => error!(error = %e, "Drain failed, proceeding with upgrade"),
        }
        CordonGuard {
            cluster: Some(Arc::clone(&self.cluster)),
        }
    }
}

/// Uncordons the node when released, or from a background task if dropped
pub struct CordonGuard {
    cluster: Option<Arc<dyn NodeCluster>>,
}

async fn uncordon_loudly(cluster: Arc<dyn NodeCluster>) {
    match cluster.set_unschedulable(false).await {
        Ok(()) => info!("Node uncordoned"),
        Err(e) => error!(
            error = %e,
            "FAILED TO UNCORDON NODE - it stays unschedulable until uncordoned manually"
        ),
    }
}

impl CordonGuard {
    pub async fn release(mut self) {
        if let Some(cluster) = self.cluster.take() {
            uncordon_loudly(cluster).await;
        }
    }
}

impl Drop for CordonGuard {
    fn drop(&mut self) {
        if let Some(cluster) = self.cluster.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(uncordon_loudly(cluster));
                }
                Err(_) => error!("CordonGuard dropped outside a runtime, node left cordoned"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{pod, FakeCluster};

    fn coordinator(cluster: Arc<FakeCluster>) -> DrainCoordinator {
        DrainCoordinator::new(cluster, Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_empty_set_never_cordons() {
        let cluster = Arc::new(FakeCluster::new("node-1"));
        let outcome = coordinator(cluster.clone()).drain(true).await.unwrap();
        assert_eq!(outcome, DrainOutcome::NothingToDrain);
        assert!(cluster.events().is_empty());
    }

    #[tokio::test]
    async fn test_unmanaged_only_set_never_cordons_in_managed_mode() {
        let cluster = Arc::new(FakeCluster::new("node-1").with_pods(vec![pod("default", "bare", false)]));
        let outcome = coordinator(cluster.clone()).drain(false).await.unwrap();
        assert_eq!(outcome, DrainOutcome::NothingToDrain);
        assert!(cluster.events().is_empty());
    }

    #[tokio::test]
    async fn test_managed_drain_leaves_unmanaged_pods() {
        let cluster = Arc::new(FakeCluster::new("node-1").with_pods(vec![
            pod("default", "web-0", true),
            pod("default", "bare", false),
        ]));
        let outcome = coordinator(cluster.clone()).drain(false).await.unwrap();
        assert_eq!(outcome, DrainOutcome::Drained);
        assert_eq!(cluster.events(), vec!["cordon", "evict default/web-0"]);
    }

    #[tokio::test]
    async fn test_full_drain_evicts_everything() {
        let cluster = Arc::new(FakeCluster::new("node-1").with_pods(vec![
            pod("default", "web-0", true),
            pod("ops", "bare", false),
        ]));
        coordinator(cluster.clone()).drain(true).await.unwrap();
        assert_eq!(
            cluster.events(),
            vec!["cordon", "evict default/web-0", "evict ops/bare"]
        );
    }

    #[tokio::test]
    async fn test_stuck_pod_times_out() {
        let cluster = FakeCluster::new("node-1").with_pods(vec![pod("default", "db-0", true)]);
        cluster.stuck.lock().unwrap().insert("db-0".to_string());
        let cluster = Arc::new(cluster);
        let err = coordinator(cluster).drain(true).await.unwrap_err();
        assert!(matches!(err, Error::DrainError(msg) if msg.contains("db-0")));
    }

    #[tokio::test]
    async fn test_guard_uncordons_even_after_failed_drain() {
        let mut cluster = FakeCluster::new("node-1").with_pods(vec![pod("default", "web-0", true)]);
        cluster.fail_cordon = true;
        let cluster = Arc::new(cluster);
        let guard = coordinator(cluster.clone()).protect().await;
        guard.release().await;
        assert_eq!(cluster.events(), vec!["cordon", "uncordon"]);
    }

    #[tokio::test]
    async fn test_dropped_guard_still_uncordons() {
        let cluster = Arc::new(FakeCluster::new("node-1").with_pods(vec![pod("default", "web-0", true)]));
        {
            let _guard = coordinator(cluster.clone()).protect().await;
        }
        for _ in 0..50 {
            if cluster.events().last().map(String::as_str) == Some("uncordon") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("guard did not uncordon: {:?}", cluster.events());
    }

    #[tokio::test]
    async fn test_failed_uncordon_is_not_propagated() {
        let mut cluster = FakeCluster::new("node-1").with_pods(vec![pod("default", "web-0", true)]);
        cluster.fail_uncordon = true;
        let cluster = Arc::new(cluster);
        coordinator(cluster.clone()).protect().await.release().await;
        assert_eq!(cluster.events().last().map(String::as_str), Some("uncordon"));
    }

    #[test]
    fn test_controller_owned_pods_are_managed() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
        let mut p = Pod::default();
        assert!(!is_managed(&p));
        p.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".into(),
            kind: "ReplicaSet".into(),
            name: "web-5d8f".into(),
            uid: "1234".into(),
            controller: Some(true),
            ..OwnerReference::default()
        }]);
        assert!(is_managed(&p));
    }
}
