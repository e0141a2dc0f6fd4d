//! Service-driven assignment.
//!
//! Every LoadBalancer service gets its own pod readiness tracker. Whenever a
//! service or the readiness of its pods changes, the service's load-balancer
//! addresses are claimed for the node elected among the nodes running its
//! ready pods. Evaluations of one service never overlap, so a service that
//! is deleted mid-evaluation cannot leave a claim behind.

use crate::election::elect_for_service;
use crate::error::ControllerError;
use crate::feed::{object_key, run_feed, Lifecycle, ObjectCache};
use crate::readiness::{
    pod_handler, readiness_change, PodFeedLauncher, PodScope, ReadinessTracker, TrackerRegistry,
};
use crate::reconciler::Reconciler;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::Api;
use kube_runtime::watcher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info};

const LOAD_BALANCER: &str = "LoadBalancer";

/// Whether the service is of type LoadBalancer.
pub fn is_load_balancer(svc: &Service) -> bool {
    svc.spec.as_ref().and_then(|spec| spec.type_.as_deref()) == Some(LOAD_BALANCER)
}

/// Ingress addresses from the service's load-balancer status.
pub fn load_balancer_ips(svc: &Service) -> BTreeSet<String> {
    svc.status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| ingress.iter().filter_map(|i| i.ip.clone()).collect())
        .unwrap_or_default()
}

/// The service's pod selector in label selector syntax; empty when it has none.
pub fn pod_selector(svc: &Service) -> String {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.selector.as_ref())
        .map(selector_string)
        .unwrap_or_default()
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Assigns floating IPs to the nodes serving LoadBalancer services.
pub struct ServiceAssignment {
    reconciler: Arc<Reconciler>,
    launcher: Arc<dyn PodFeedLauncher>,
    services: ObjectCache<Service>,
    trackers: TrackerRegistry,
    service_ips: RwLock<HashMap<String, BTreeSet<String>>>,
    /// Per-service lock held while a service or pod notification is handled
    evaluations: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    this: Weak<Self>,
}

impl ServiceAssignment {
    pub fn new(reconciler: Arc<Reconciler>, launcher: Arc<dyn PodFeedLauncher>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            reconciler,
            launcher,
            services: ObjectCache::new(),
            trackers: TrackerRegistry::new(),
            service_ips: RwLock::new(HashMap::new()),
            evaluations: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Watches services matching `label_selector` until the watch fails.
    pub async fn run(&self, api: Api<Service>, label_selector: &str) -> Result<(), ControllerError> {
        let config = watcher::Config::default().labels(label_selector);
        run_feed(api, config, self.services.clone(), "service", |event| self.handle_event(event)).await
    }

    /// Whether `ip` is a load-balancer address of any tracked service.
    pub fn has_service_ip(&self, ip: &str) -> bool {
        self.service_ips
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|ips| ips.contains(ip))
    }

    /// Whether a readiness tracker runs for the service `key`.
    #[cfg(test)]
    pub fn is_tracked(&self, key: &str) -> bool {
        self.trackers.contains(key)
    }

    pub fn services(&self) -> &ObjectCache<Service> {
        &self.services
    }

    fn evaluation_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.evaluations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Handles one service notification. The service cache is already updated.
    pub async fn handle_event(&self, event: Lifecycle<Service>) {
        let key = match &event {
            Lifecycle::Added(svc) | Lifecycle::Updated { new: svc, .. } | Lifecycle::Deleted(svc) => {
                match object_key(svc) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        error!("Failed to handle service event: {}", e);
                        return;
                    }
                }
            }
            Lifecycle::Synced => None,
        };
        let lock = key.map(|key| self.evaluation_lock(&key));
        let _evaluating = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let result = match event {
            Lifecycle::Added(svc) => self.handle_service_add(&svc).await,
            Lifecycle::Updated { old, new } => self.handle_service_update(&old, &new).await,
            Lifecycle::Deleted(svc) => self.handle_service_delete(&svc).await,
            Lifecycle::Synced => {
                debug!(services = self.trackers.len(), "Service cache synced");
                Ok(())
            }
        };

        if let Err(e) = result {
            error!("Failed to handle service event: {}", e);
        }
    }

    async fn handle_service_add(&self, svc: &Service) -> Result<(), ControllerError> {
        let key = object_key(svc)?;
        if !is_load_balancer(svc) {
            debug!(service = %key, "Ignoring non-LoadBalancer service");
            return Ok(());
        }

        info!(service = %key, "Tracking LoadBalancer service");
        self.start_tracker(&key, svc);

        // Without a pod feed no readiness event will ever arrive
        if !self.trackers.is_watching(&key) {
            self.handle_service_ips(&key, load_balancer_ips(svc)).await?;
        }
        Ok(())
    }

    async fn handle_service_update(&self, old: &Service, new: &Service) -> Result<(), ControllerError> {
        let key = object_key(new)?;

        if !is_load_balancer(new) {
            if self.trackers.contains(&key) {
                info!(service = %key, "Service is no longer a LoadBalancer");
                self.untrack(&key).await;
            }
            return Ok(());
        }

        if !self.trackers.contains(&key) {
            return self.handle_service_add(new).await;
        }

        let new_ips = load_balancer_ips(new);

        if pod_selector(old) != pod_selector(new) {
            info!(service = %key, selector = %pod_selector(new), "Pod selector changed; restarting pod watcher");
            self.start_tracker(&key, new);
            self.update_service_ips(&key, &new_ips).await;
            // The new feed re-evaluates the service once it has synced
            if !self.trackers.is_watching(&key) {
                self.handle_service_ips(&key, new_ips).await?;
            }
            return Ok(());
        }

        if load_balancer_ips(old) != new_ips {
            info!(service = %key, ips = ?new_ips, "Service IPs changed");
            return self.handle_service_ips(&key, new_ips).await;
        }

        debug!(service = %key, "Service update does not affect assignment");
        Ok(())
    }

    async fn handle_service_delete(&self, svc: &Service) -> Result<(), ControllerError> {
        let key = object_key(svc)?;
        if self.trackers.contains(&key) {
            info!(service = %key, "Service deleted");
            self.untrack(&key).await;
        }
        Ok(())
    }

    fn start_tracker(&self, key: &str, svc: &Service) {
        let scope = PodScope {
            namespace: svc.metadata.namespace.clone(),
            label_selector: pod_selector(svc),
        };

        let this = self.this.clone();
        let service_key = key.to_string();
        let handler = pod_handler(move |event| {
            let this = this.clone();
            let service_key = service_key.clone();
            async move {
                if let Some(this) = this.upgrade() {
                    this.handle_pod_event(&service_key, event).await;
                }
            }
        });

        self.trackers
            .insert(key, ReadinessTracker::start(self.launcher.as_ref(), scope, handler));
    }

    /// Stops tracking `key` and forgets the claims on its addresses.
    ///
    /// Called with the evaluation lock of `key` held.
    async fn untrack(&self, key: &str) {
        self.trackers.remove(key);
        self.evaluations.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        let ips = self
            .service_ips
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .unwrap_or_default();
        self.reconciler.forget(&ips).await;
    }

    /// Handles a notification from the pod feed of service `key`.
    pub async fn handle_pod_event(&self, key: &str, event: Lifecycle<Pod>) {
        let Some(change) = readiness_change(&event) else {
            return;
        };

        let lock = self.evaluation_lock(key);
        let _evaluating = lock.lock().await;

        if !self.trackers.contains(key) {
            debug!(service = %key, "Ignoring pod event for untracked service");
            return;
        }

        let Some(svc) = self.services.get(key) else {
            error!("{}", ControllerError::ServiceNotFound(key.to_string()));
            return;
        };

        debug!(service = %key, change = ?change, "Pod readiness changed");
        if let Err(e) = self.handle_service_ips(key, load_balancer_ips(&svc)).await {
            error!(service = %key, "Failed to assign service IPs: {}", e);
        }
    }

    /// Re-evaluates the node for service `key` with load-balancer addresses `ips`.
    async fn handle_service_ips(&self, key: &str, ips: BTreeSet<String>) -> Result<(), ControllerError> {
        let nodes = self
            .trackers
            .ready_nodes(key)
            .ok_or_else(|| ControllerError::ServiceNotFound(key.to_string()))?;

        self.update_service_ips(key, &ips).await;

        if ips.is_empty() {
            info!(service = %key, "Service has no load-balancer IPs");
            return Ok(());
        }

        if nodes.is_empty() {
            info!(service = %key, "Service has no ready pods");
            self.reconciler.forget(&ips).await;
            return Ok(());
        }

        let node = elect_for_service(&nodes, key)?;
        debug!(service = %key, node = %node, candidates = ?nodes, "Elected node");
        self.reconciler.attach_to_node(&ips, &node).await;
        Ok(())
    }

    /// Records `ips` as the addresses of `key` and forgets those it no longer has.
    async fn update_service_ips(&self, key: &str, ips: &BTreeSet<String>) {
        let previous = self
            .service_ips
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), ips.clone())
            .unwrap_or_default();

        let removed: BTreeSet<String> = previous.difference(ips).cloned().collect();
        if !removed.is_empty() {
            info!(service = %key, ips = ?removed, "Service no longer has IPs");
            self.reconciler.forget(&removed).await;
        }
    }
}
