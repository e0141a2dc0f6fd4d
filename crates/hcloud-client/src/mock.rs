//! Mock HcloudClient for unit testing
//!
//! Stores floating IPs and servers in memory, applies assignments to its own
//! state and records every call so tests can assert on provider traffic.
//! Failures can be injected per server name (lookup errors) and per floating
//! IP (failing actions).

use crate::error::HcloudError;
use crate::hcloud_trait::HcloudClientTrait;
use crate::models::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

/// A recorded `assign_floating_ip` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignCall {
    pub floating_ip_id: u64,
    pub server_id: u64,
}

/// Mock HcloudClient for testing
#[derive(Clone, Default)]
pub struct MockHcloudClient {
    pub(crate) floating_ips: Arc<Mutex<BTreeMap<u64, FloatingIp>>>,
    pub(crate) servers: Arc<Mutex<BTreeMap<u64, Server>>>,
    pub(crate) assign_calls: Arc<Mutex<Vec<AssignCall>>>,
    pub(crate) server_lookups: Arc<Mutex<Vec<String>>>,
    pub(crate) failing_server_names: Arc<Mutex<HashSet<String>>>,
    pub(crate) failing_actions: Arc<Mutex<HashSet<u64>>>,
    pub(crate) already_assigned: Arc<Mutex<HashSet<u64>>>,
    pub(crate) list_fails: Arc<Mutex<bool>>,
    pub(crate) next_action_id: Arc<Mutex<u64>>,
}

impl MockHcloudClient {
    /// Create a new, empty mock client
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server to the mock store (for test setup)
    pub fn add_server(&self, id: u64, name: &str) {
        self.servers.lock().unwrap().insert(id, Server {
            id,
            name: name.to_string(),
            status: Some("running".to_string()),
        });
    }

    /// Add a floating IP to the mock store (for test setup)
    pub fn add_floating_ip(&self, id: u64, ip: &str, server: Option<u64>) {
        self.floating_ips.lock().unwrap().insert(id, FloatingIp {
            id,
            name: format!("fip-{}", id),
            description: None,
            ip: ip.to_string(),
            ip_type: if ip.contains(':') { FloatingIpType::Ipv6 } else { FloatingIpType::Ipv4 },
            server,
            labels: Default::default(),
            blocked: false,
        });
    }

    /// Remove a floating IP from the mock store
    pub fn remove_floating_ip(&self, id: u64) {
        self.floating_ips.lock().unwrap().remove(&id);
    }

    /// Change a floating IP's assignment behind the controller's back
    pub fn set_assignment(&self, id: u64, server: Option<u64>) {
        if let Some(fip) = self.floating_ips.lock().unwrap().get_mut(&id) {
            fip.server = server;
        }
    }

    /// Make `get_server_by_name` fail with an API error for this name
    pub fn fail_server_lookup(&self, name: &str) {
        self.failing_server_names.lock().unwrap().insert(name.to_string());
    }

    /// Make actions for this floating IP finish with an error
    pub fn fail_action_for(&self, floating_ip_id: u64) {
        self.failing_actions.lock().unwrap().insert(floating_ip_id);
    }

    /// Make assignments of this floating IP answer "already assigned"
    pub fn report_already_assigned(&self, floating_ip_id: u64) {
        self.already_assigned.lock().unwrap().insert(floating_ip_id);
    }

    /// Make `list_floating_ips` fail
    pub fn fail_listing(&self, fail: bool) {
        *self.list_fails.lock().unwrap() = fail;
    }

    /// All assign calls issued so far
    pub fn assign_calls(&self) -> Vec<AssignCall> {
        self.assign_calls.lock().unwrap().clone()
    }

    /// All server names looked up so far
    pub fn server_lookups(&self) -> Vec<String> {
        self.server_lookups.lock().unwrap().clone()
    }

    /// Current server assignment of a floating IP
    pub fn assignment_of(&self, id: u64) -> Option<u64> {
        self.floating_ips.lock().unwrap().get(&id).and_then(|f| f.server)
    }

    fn next_action_id(&self) -> u64 {
        let mut id = self.next_action_id.lock().unwrap();
        *id += 1;
        *id
    }
}

#[async_trait::async_trait]
impl HcloudClientTrait for MockHcloudClient {
    fn endpoint(&self) -> &str {
        "http://mock-hcloud"
    }

    async fn list_floating_ips(&self, _label_selector: &str) -> Result<Vec<FloatingIp>, HcloudError> {
        if *self.list_fails.lock().unwrap() {
            return Err(HcloudError::Api {
                code: "service_error".to_string(),
                message: "mock listing failure".to_string(),
            });
        }
        Ok(self.floating_ips.lock().unwrap().values().cloned().collect())
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Option<Server>, HcloudError> {
        self.server_lookups.lock().unwrap().push(name.to_string());
        if self.failing_server_names.lock().unwrap().contains(name) {
            return Err(HcloudError::Api {
                code: "service_error".to_string(),
                message: format!("mock lookup failure for {}", name),
            });
        }
        Ok(self.servers.lock().unwrap().values().find(|s| s.name == name).cloned())
    }

    async fn get_server(&self, id: u64) -> Result<Option<Server>, HcloudError> {
        Ok(self.servers.lock().unwrap().get(&id).cloned())
    }

    async fn assign_floating_ip(&self, floating_ip_id: u64, server_id: u64) -> Result<Action, HcloudError> {
        self.assign_calls.lock().unwrap().push(AssignCall { floating_ip_id, server_id });

        if !self.floating_ips.lock().unwrap().contains_key(&floating_ip_id) {
            return Err(HcloudError::NotFound(format!("floating IP {}", floating_ip_id)));
        }

        if self.already_assigned.lock().unwrap().contains(&floating_ip_id) {
            return Err(HcloudError::AlreadyAssigned(floating_ip_id));
        }

        let failing = self.failing_actions.lock().unwrap().contains(&floating_ip_id);
        if !failing {
            self.set_assignment(floating_ip_id, Some(server_id));
        }

        Ok(Action {
            id: self.next_action_id(),
            command: "assign_floating_ip".to_string(),
            status: ActionStatus::Running,
            progress: 0,
            started: None,
            finished: None,
            error: failing.then(|| ActionError {
                code: "action_failed".to_string(),
                message: format!("mock action failure for floating IP {}", floating_ip_id),
            }),
        })
    }

    async fn wait_for_action(&self, action: &Action) -> Result<Action, HcloudError> {
        match &action.error {
            Some(error) => Err(HcloudError::ActionFailed {
                id: action.id,
                code: error.code.clone(),
                message: error.message.clone(),
            }),
            None => Ok(Action {
                status: ActionStatus::Success,
                progress: 100,
                ..action.clone()
            }),
        }
    }
}
