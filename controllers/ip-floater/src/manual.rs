//! Label-driven manual assignment.
//!
//! Pods list the floating IPs they want in a label (comma separated). Each
//! listed address is claimed for the node elected among the nodes running a
//! ready pod that lists it. Addresses owned by a LoadBalancer service are
//! left to service assignment.

use crate::election::elect_for_manual;
use crate::feed::{label, run_feed, Lifecycle, ObjectCache};
use crate::error::ControllerError;
use crate::readiness::ReadinessTracker;
use crate::reconciler::Reconciler;
use crate::service::ServiceAssignment;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, ResourceExt};
use kube_runtime::watcher;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parses a label value like `"203.0.113.5, 203.0.113.6"` into a set of addresses.
pub fn parse_address_list(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .collect()
}

/// Assigns floating IPs listed in a pod label.
pub struct ManualAssignment {
    label: String,
    reconciler: Arc<Reconciler>,
    services: Arc<ServiceAssignment>,
    tracker: ReadinessTracker,
}

impl ManualAssignment {
    pub fn new(label: impl Into<String>, reconciler: Arc<Reconciler>, services: Arc<ServiceAssignment>) -> Self {
        Self {
            label: label.into(),
            reconciler,
            services,
            tracker: ReadinessTracker::from_cache(ObjectCache::new()),
        }
    }

    #[cfg(test)]
    pub fn pods(&self) -> &ObjectCache<Pod> {
        self.tracker.pods()
    }

    /// Watches pods carrying the assignment label in all namespaces until the watch fails.
    pub async fn run(&self, api: Api<Pod>) -> Result<(), ControllerError> {
        let config = watcher::Config::default().labels(&self.label);
        run_feed(api, config, self.tracker.pods().clone(), "manual assignment pod", |event| {
            self.handle_event(event)
        })
        .await
    }

    fn addresses(&self, pod: &Pod) -> BTreeSet<String> {
        label(pod, &self.label).map(parse_address_list).unwrap_or_default()
    }

    /// Handles one pod notification. The pod cache is already updated.
    pub async fn handle_event(&self, event: Lifecycle<Pod>) {
        let affected = match &event {
            Lifecycle::Added(pod) | Lifecycle::Deleted(pod) => self.addresses(pod),
            Lifecycle::Updated { old, new } => {
                let mut ips = self.addresses(old);
                ips.extend(self.addresses(new));
                ips
            }
            Lifecycle::Synced => self
                .tracker
                .pods()
                .snapshot()
                .iter()
                .flat_map(|pod| self.addresses(pod))
                .collect(),
        };

        if let Lifecycle::Added(pod) | Lifecycle::Updated { new: pod, .. } | Lifecycle::Deleted(pod) = &event {
            debug!(pod = %pod.name_any(), ips = ?affected, "Manual assignment pod changed");
        }

        for ip in &affected {
            self.handle_ip(ip).await;
        }
    }

    /// Re-evaluates the node for one manually assigned address.
    async fn handle_ip(&self, ip: &str) {
        if self.services.has_service_ip(ip) {
            warn!(fip = %ip, "IP is already assigned to a LoadBalancer service; ignoring manual assignment");
            return;
        }

        let ips = BTreeSet::from([ip.to_string()]);
        let nodes = self.tracker.ready_nodes_for_address(&self.label, ip);
        if nodes.is_empty() {
            info!(fip = %ip, "No ready pods for manually assigned IP");
            self.reconciler.forget(&ips).await;
            return;
        }

        match elect_for_manual(&nodes) {
            Ok(node) => {
                debug!(fip = %ip, node = %node, candidates = ?nodes, "Elected node");
                self.reconciler.attach_to_node(&ips, &node).await;
            }
            Err(e) => warn!(fip = %ip, "Could not elect a node: {}", e),
        }
    }
}
