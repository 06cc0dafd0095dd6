//! Node label watch loop
//!
//! Tracks two label-driven flags: enablement (previous vs current) and the
//! service request (current vs last handled). Handler failures are logged
//! and the watch carries on.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::drain::NodeCluster;
use crate::controller::orchestrator::InstallOrchestrator;
use crate::error::Result;
use crate::labels::{
    Enablement, NodeLabelState, ServiceLabel, ServiceRequest, DISABLED_VALUE, ENABLEMENT_LABEL,
    SERVICE_LABEL,
};

pub struct LabelWatchLoop {
    orchestrator: Arc<InstallOrchestrator>,
    cluster: Arc<dyn NodeCluster>,
    op_lock: Arc<Mutex<()>>,
    enabled: bool,
    last_request: Option<ServiceRequest>,
}

impl LabelWatchLoop {
    /// `initial` is the enablement acted upon at startup.
    pub fn new(
        orchestrator: Arc<InstallOrchestrator>,
        cluster: Arc<dyn NodeCluster>,
        op_lock: Arc<Mutex<()>>,
        initial: Enablement,
    ) -> Self {
        Self {
            orchestrator,
            cluster,
            op_lock,
            enabled: !initial.is_disabled(),
            last_request: None,
        }
    }

    pub fn last_request(&self) -> Option<ServiceRequest> {
        self.last_request
    }

    /// Reacts to one observed version of the node.
    #[instrument(skip(self, node), fields(node = %node.name_any()))]
    pub async fn handle(&mut self, node: &Node) {
        let labels = NodeLabelState::from_node(node);
        if let Err(e) = self.handle_enablement(labels.enablement).await {
            error!(error = %e, "Label-driven install/uninstall failed");
        }
        self.handle_service(&labels.service).await;
    }

    async fn handle_enablement(&mut self, enablement: Enablement) -> Result<()> {
        let enabled = !enablement.is_disabled();
        if enabled == self.enabled {
            return Ok(());
        }

        if enabled {
            info!("Requested enablement via labels");
            self.orchestrator.install().await?;
            self.enabled = true;
            return Ok(());
        }

        match enablement {
            Enablement::UninstallRequested => {
                info!("Requested uninstall via labels");
                self.orchestrator.uninstall().await?;
                warn!(
                    "Resetting label '{}' to '{}' -- expect cleanup by the cluster",
                    ENABLEMENT_LABEL, DISABLED_VALUE
                );
                self.cluster
                    .set_label(ENABLEMENT_LABEL, DISABLED_VALUE)
                    .await?;
            }
            _ => info!("Service disabled via labels, leaving cleanup to the cluster"),
        }
        self.enabled = false;
        Ok(())
    }

    async fn handle_service(&mut self, label: &ServiceLabel) {
        let req = match label {
            ServiceLabel::Absent => {
                self.last_request = None;
                return;
            }
            ServiceLabel::Ignored(value) => {
                debug!("Ignoring unsupported service request '{}'", value);
                return;
            }
            ServiceLabel::Request(req) => *req,
        };

        if self.last_request == Some(req) {
            debug!("Service request '{}' already handled", req);
            return;
        }

        info!("Handling service request '{}'", req);
        let result = {
            let _op = self.op_lock.lock().await;
            self.orchestrator.service().apply(req).await
        };
        if let Err(e) = result {
            // not recorded, retried on the next notification
            error!(error = %e, "Service request '{}' failed", req);
            return;
        }

        if req == ServiceRequest::Restart {
            info!("Removing label {}={}", SERVICE_LABEL, req);
            if let Err(e) = self.cluster.remove_label(SERVICE_LABEL).await {
                warn!(error = %e, "Could not remove service label");
            }
            self.last_request = None;
        } else {
            self.last_request = Some(req);
        }
    }

    /// Consumes node updates until the stream ends or `shutdown` flips.
    pub async fn run(
        mut self,
        mut updates: BoxStream<'static, Result<Node>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Activating node watcher");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Node watcher stopping");
                        return;
                    }
                }
                next = updates.next() => match next {
                    Some(Ok(node)) => self.handle(&node).await,
                    Some(Err(e)) => warn!(error = %e, "Node watch error"),
                    None => {
                        warn!("Node watch stream ended");
                        return;
                    }
                },
            }
        }
    }
}
