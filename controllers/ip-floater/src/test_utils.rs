//! Test utilities for unit testing assignment and reconciliation
//!
//! Builders for pods and services plus a pod feed launcher that records what
//! it was asked to watch instead of talking to a cluster.

use crate::feed::ObjectCache;
use crate::readiness::{PodFeedLauncher, PodHandler, PodScope};
use crate::reconciler::Reconciler;
use hcloud_client::{Action, FloatingIp, HcloudClientTrait, HcloudError, MockHcloudClient, Server};
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Pod, PodCondition, PodSpec, PodStatus, Service,
    ServiceSpec, ServiceStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Helper to create a pod scheduled on `node`
pub fn pod(namespace: &str, name: &str, node: &str, ready: bool, pod_labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(pod_labels)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Helper to create a LoadBalancer service with ingress addresses `ips`
pub fn service(namespace: &str, name: &str, selector: &[(&str, &str)], ips: &[&str]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            selector: (!selector.is_empty()).then(|| labels(selector)),
            ..Default::default()
        }),
        status: Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(
                    ips.iter()
                        .map(|ip| LoadBalancerIngress {
                            ip: Some(ip.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

/// Reconciler talking to `mock`, managing all of its floating IPs
pub fn reconciler_with(mock: &MockHcloudClient) -> Reconciler {
    Reconciler::new(Arc::new(mock.clone()), "")
}

/// Mock client that holds the first assign call until released
pub struct HeldAssignClient {
    inner: MockHcloudClient,
    held: AtomicBool,
    /// Notified once the held call is parked
    pub entered: Notify,
    /// Releases the held call
    pub release: Notify,
}

impl HeldAssignClient {
    pub fn new(inner: MockHcloudClient) -> Self {
        Self {
            inner,
            held: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait::async_trait]
impl HcloudClientTrait for HeldAssignClient {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn list_floating_ips(&self, label_selector: &str) -> Result<Vec<FloatingIp>, HcloudError> {
        self.inner.list_floating_ips(label_selector).await
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Option<Server>, HcloudError> {
        self.inner.get_server_by_name(name).await
    }

    async fn get_server(&self, id: u64) -> Result<Option<Server>, HcloudError> {
        self.inner.get_server(id).await
    }

    async fn assign_floating_ip(&self, floating_ip_id: u64, server_id: u64) -> Result<Action, HcloudError> {
        if !self.held.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.assign_floating_ip(floating_ip_id, server_id).await
    }

    async fn wait_for_action(&self, action: &Action) -> Result<Action, HcloudError> {
        self.inner.wait_for_action(action).await
    }
}

/// Pod feed launcher that records scopes and hands out idle tasks
#[derive(Default)]
pub struct RecordingPodFeeds {
    launched: Mutex<Vec<(PodScope, ObjectCache<Pod>)>>,
}

impl RecordingPodFeeds {
    pub fn scopes(&self) -> Vec<PodScope> {
        self.launched.lock().unwrap().iter().map(|(scope, _)| scope.clone()).collect()
    }

    /// Cache of the most recently launched feed
    pub fn latest_cache(&self) -> Option<ObjectCache<Pod>> {
        self.launched.lock().unwrap().last().map(|(_, pods)| pods.clone())
    }
}

impl PodFeedLauncher for RecordingPodFeeds {
    fn launch(&self, scope: PodScope, pods: ObjectCache<Pod>, _handler: PodHandler) -> JoinHandle<()> {
        self.launched.lock().unwrap().push((scope, pods));
        tokio::spawn(std::future::pending())
    }
}
