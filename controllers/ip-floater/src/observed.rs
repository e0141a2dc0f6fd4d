//! Cached view of the floating IPs at the provider.
//!
//! Refreshed from the provider listing; attached server names are resolved
//! only when an address or its attachment changed since the last refresh.

use crate::error::ControllerError;
use hcloud_client::{FloatingIp, HcloudClientTrait};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

/// Server a floating IP is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedServer {
    pub id: u64,
    pub name: String,
}

/// A floating IP as last seen at the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedIp {
    pub id: u64,
    pub ip: String,
    pub server: Option<AttachedServer>,
}

impl ObservedIp {
    pub fn server_name(&self) -> Option<&str> {
        self.server.as_ref().map(|s| s.name.as_str())
    }
}

#[derive(Debug)]
pub struct ObservedState {
    label_selector: String,
    floating_ips: RwLock<HashMap<String, ObservedIp>>,
    refreshing: Mutex<()>,
}

impl ObservedState {
    /// Cache of the floating IPs matching `label_selector`.
    pub fn new(label_selector: impl Into<String>) -> Self {
        Self {
            label_selector: label_selector.into(),
            floating_ips: RwLock::new(HashMap::new()),
            refreshing: Mutex::new(()),
        }
    }

    /// Re-reads the floating IPs from the provider.
    ///
    /// Returns whether the cache changed or disagrees with `desired`
    /// (address to node name), i.e. whether a reconcile pass is worthwhile.
    /// An entry whose server cannot be resolved keeps its previous value and
    /// is retried on the next refresh.
    pub async fn refresh(
        &self,
        client: &dyn HcloudClientTrait,
        desired: &HashMap<String, String>,
    ) -> Result<bool, ControllerError> {
        let _refreshing = self.refreshing.lock().await;

        let listed = client.list_floating_ips(&self.label_selector).await?;
        let previous = self.floating_ips.read().await.clone();

        let mut current = HashMap::with_capacity(listed.len());
        let mut changed = false;

        for fip in listed {
            let cached = previous.get(&fip.ip);
            let moved = cached.is_none_or(|c| {
                c.id != fip.id || c.server.as_ref().map(|s| s.id) != fip.server
            });

            if moved {
                match resolve(client, &fip).await {
                    Ok(observed) => {
                        debug!(fip = %fip.ip, server = ?observed.server_name(), "Floating IP changed");
                        current.insert(fip.ip.clone(), observed);
                        changed = true;
                    }
                    Err(e) => {
                        error!(fip = %fip.ip, "Could not resolve attached server: {}", e);
                        if let Some(cached) = cached {
                            current.insert(fip.ip.clone(), cached.clone());
                        }
                    }
                }
                continue;
            }

            if let Some(cached) = cached {
                let wanted = desired.get(&fip.ip).map(String::as_str);
                if wanted.is_some() && cached.server_name() != wanted {
                    debug!(fip = %fip.ip, current = ?cached.server_name(), wanted = ?wanted, "Floating IP drifted");
                    changed = true;
                }
                current.insert(fip.ip.clone(), cached.clone());
            }
        }

        for ip in previous.keys().filter(|ip| !current.contains_key(*ip)) {
            info!(fip = %ip, "Floating IP no longer listed");
            changed = true;
        }

        *self.floating_ips.write().await = current;
        Ok(changed)
    }

    /// Records a successful attach so the next refresh does not count it as a change.
    pub async fn record_attachment(&self, ip: &str, server: AttachedServer) {
        if let Some(fip) = self.floating_ips.write().await.get_mut(ip) {
            fip.server = Some(server);
        }
    }

    #[cfg(test)]
    pub async fn get(&self, ip: &str) -> Option<ObservedIp> {
        self.floating_ips.read().await.get(ip).cloned()
    }

    /// Point-in-time copy of all cached floating IPs
    pub async fn snapshot(&self) -> HashMap<String, ObservedIp> {
        self.floating_ips.read().await.clone()
    }

    /// Addresses of all cached floating IPs
    pub async fn addresses(&self) -> BTreeSet<String> {
        self.floating_ips.read().await.keys().cloned().collect()
    }
}

async fn resolve(client: &dyn HcloudClientTrait, fip: &FloatingIp) -> Result<ObservedIp, ControllerError> {
    let server = match fip.server {
        Some(id) => {
            let server = client
                .get_server(id)
                .await?
                .ok_or_else(|| ControllerError::ServerNotFound(format!("server id {}", id)))?;
            Some(AttachedServer { id: server.id, name: server.name })
        }
        None => None,
    };

    Ok(ObservedIp {
        id: fip.id,
        ip: fip.ip.clone(),
        server,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcloud_client::MockHcloudClient;

    fn desired(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(ip, node)| (ip.to_string(), node.to_string())).collect()
    }

    #[tokio::test]
    async fn test_first_refresh_resolves_servers() {
        let mock = MockHcloudClient::new();
        mock.add_server(1, "node-a");
        mock.add_floating_ip(10, "203.0.113.5", Some(1));
        mock.add_floating_ip(11, "203.0.113.6", None);

        let observed = ObservedState::new("");
        assert!(observed.refresh(&mock, &HashMap::new()).await.unwrap());

        let fip = observed.get("203.0.113.5").await.unwrap();
        assert_eq!(fip.id, 10);
        assert_eq!(fip.server_name(), Some("node-a"));
        assert_eq!(observed.get("203.0.113.6").await.unwrap().server, None);
        assert_eq!(observed.addresses().await.len(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_listing_is_not_a_change() {
        let mock = MockHcloudClient::new();
        mock.add_server(1, "node-a");
        mock.add_floating_ip(10, "203.0.113.5", Some(1));

        let observed = ObservedState::new("");
        observed.refresh(&mock, &HashMap::new()).await.unwrap();

        assert!(!observed.refresh(&mock, &HashMap::new()).await.unwrap());
        assert!(!observed.refresh(&mock, &desired(&[("203.0.113.5", "node-a")])).await.unwrap());
    }

    #[tokio::test]
    async fn test_external_reassignment_is_a_change() {
        let mock = MockHcloudClient::new();
        mock.add_server(1, "node-a");
        mock.add_server(2, "node-b");
        mock.add_floating_ip(10, "203.0.113.5", Some(1));

        let observed = ObservedState::new("");
        observed.refresh(&mock, &HashMap::new()).await.unwrap();

        mock.set_assignment(10, Some(2));
        assert!(observed.refresh(&mock, &HashMap::new()).await.unwrap());
        assert_eq!(observed.get("203.0.113.5").await.unwrap().server_name(), Some("node-b"));
    }

    #[tokio::test]
    async fn test_drift_from_desired_is_a_change() {
        let mock = MockHcloudClient::new();
        mock.add_server(1, "node-a");
        mock.add_floating_ip(10, "203.0.113.5", Some(1));

        let observed = ObservedState::new("");
        observed.refresh(&mock, &HashMap::new()).await.unwrap();

        assert!(observed.refresh(&mock, &desired(&[("203.0.113.5", "node-b")])).await.unwrap());
    }

    #[tokio::test]
    async fn test_removed_floating_ip_is_evicted() {
        let mock = MockHcloudClient::new();
        mock.add_floating_ip(10, "203.0.113.5", None);
        mock.add_floating_ip(11, "203.0.113.6", None);

        let observed = ObservedState::new("");
        observed.refresh(&mock, &HashMap::new()).await.unwrap();

        mock.remove_floating_ip(11);
        assert!(observed.refresh(&mock, &HashMap::new()).await.unwrap());
        assert_eq!(observed.get("203.0.113.6").await, None);
    }

    #[tokio::test]
    async fn test_unresolvable_server_is_skipped() {
        let mock = MockHcloudClient::new();
        mock.add_floating_ip(10, "203.0.113.5", Some(99));

        let observed = ObservedState::new("");
        assert!(!observed.refresh(&mock, &HashMap::new()).await.unwrap());
        assert_eq!(observed.get("203.0.113.5").await, None);

        // Server shows up later
        mock.add_server(99, "node-z");
        assert!(observed.refresh(&mock, &HashMap::new()).await.unwrap());
        assert_eq!(observed.get("203.0.113.5").await.unwrap().server_name(), Some("node-z"));
    }

    #[tokio::test]
    async fn test_listing_failure_keeps_cache() {
        let mock = MockHcloudClient::new();
        mock.add_floating_ip(10, "203.0.113.5", None);

        let observed = ObservedState::new("");
        observed.refresh(&mock, &HashMap::new()).await.unwrap();

        mock.fail_listing(true);
        assert!(observed.refresh(&mock, &HashMap::new()).await.is_err());
        assert!(observed.get("203.0.113.5").await.is_some());
    }

    #[tokio::test]
    async fn test_recorded_attachment_is_not_a_change() {
        let mock = MockHcloudClient::new();
        mock.add_server(1, "node-a");
        mock.add_server(2, "node-b");
        mock.add_floating_ip(10, "203.0.113.5", Some(1));

        let observed = ObservedState::new("");
        observed.refresh(&mock, &HashMap::new()).await.unwrap();

        mock.set_assignment(10, Some(2));
        observed.record_attachment("203.0.113.5", AttachedServer { id: 2, name: "node-b".to_string() }).await;

        assert!(!observed.refresh(&mock, &desired(&[("203.0.113.5", "node-b")])).await.unwrap());
    }
}
