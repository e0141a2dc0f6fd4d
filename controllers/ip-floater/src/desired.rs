//! Desired attachments: which node each floating IP should be on.
//!
//! Written by service and manual assignment, read by the reconciler. An
//! address without an entry is unclaimed and is never moved.

use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct DesiredState {
    attachments: RwLock<HashMap<String, String>>,
}

impl DesiredState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Points every address in `ips` at `node`. Returns whether any entry changed.
    pub async fn claim<'a, I>(&self, ips: I, node: &str) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut attachments = self.attachments.write().await;
        let mut changed = false;
        for ip in ips {
            if attachments.get(ip).map(String::as_str) != Some(node) {
                attachments.insert(ip.clone(), node.to_string());
                changed = true;
            }
        }
        changed
    }

    /// Drops the entries for `ips`, returning the addresses that had one.
    pub async fn forget<'a, I>(&self, ips: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut attachments = self.attachments.write().await;
        ips.into_iter()
            .filter(|ip| attachments.remove(*ip).is_some())
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub async fn get(&self, ip: &str) -> Option<String> {
        self.attachments.read().await.get(ip).cloned()
    }

    /// Point-in-time copy of all attachments
    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.attachments.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ips(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_claim_reports_changes() {
        let desired = DesiredState::new();

        assert!(desired.claim(&ips(&["203.0.113.5", "203.0.113.6"]), "node-a").await);
        assert!(!desired.claim(&ips(&["203.0.113.5", "203.0.113.6"]), "node-a").await);
        assert!(desired.claim(&ips(&["203.0.113.6"]), "node-b").await);

        assert_eq!(desired.get("203.0.113.5").await.as_deref(), Some("node-a"));
        assert_eq!(desired.get("203.0.113.6").await.as_deref(), Some("node-b"));
    }

    #[tokio::test]
    async fn test_claim_nothing_is_no_change() {
        let desired = DesiredState::new();
        assert!(!desired.claim(&ips(&[]), "node-a").await);
        assert!(desired.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_forget_reports_removed_entries() {
        let desired = DesiredState::new();
        desired.claim(&ips(&["203.0.113.5"]), "node-a").await;

        let removed = desired.forget(&ips(&["203.0.113.5", "203.0.113.9"])).await;
        assert_eq!(removed, ips(&["203.0.113.5"]));
        assert_eq!(desired.get("203.0.113.5").await, None);
    }
}
