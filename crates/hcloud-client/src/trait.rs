//! HcloudClient trait for mocking
//!
//! This trait abstracts the HcloudClient to enable mocking in unit tests.
//! The concrete HcloudClient implements this trait, and tests can use mock implementations.

use crate::error::HcloudError;
use crate::models::*;

/// Trait for Hetzner Cloud API client operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait HcloudClientTrait: Send + Sync {
    /// Get the API endpoint
    fn endpoint(&self) -> &str;

    /// List all floating IPs matching a label selector (empty selector matches all)
    async fn list_floating_ips(&self, label_selector: &str) -> Result<Vec<FloatingIp>, HcloudError>;

    /// Look up a server by its exact name
    async fn get_server_by_name(&self, name: &str) -> Result<Option<Server>, HcloudError>;

    /// Look up a server by ID
    async fn get_server(&self, id: u64) -> Result<Option<Server>, HcloudError>;

    /// Assign a floating IP to a server, returning the started action
    async fn assign_floating_ip(&self, floating_ip_id: u64, server_id: u64) -> Result<Action, HcloudError>;

    /// Wait until an action leaves the `running` state.
    ///
    /// Returns `HcloudError::ActionFailed` when the action ends in `error`.
    async fn wait_for_action(&self, action: &Action) -> Result<Action, HcloudError>;
}
