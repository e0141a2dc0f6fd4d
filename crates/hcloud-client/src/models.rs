//! Hetzner Cloud API models
//!
//! Only the fields the floater needs are modelled; unknown fields are ignored
//! by serde. See: https://docs.hetzner.cloud/#floating-ips

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Floating IP as returned by `GET /floating_ips`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub ip: String,
    #[serde(rename = "type")]
    pub ip_type: FloatingIpType,
    /// ID of the server the IP is assigned to. The API only returns the ID,
    /// the server name has to be resolved separately.
    pub server: Option<u64>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub blocked: bool,
}

/// Address family of a floating IP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloatingIpType {
    Ipv4,
    Ipv6,
}

/// Server model (subset of the API's server object)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Asynchronous action handle returned by mutating calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: u64,
    pub command: String,
    pub status: ActionStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<ActionError>,
}

/// Action state machine as reported by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Running,
    Success,
    Error,
}

/// Error details of a failed action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    pub code: String,
    pub message: String,
}

/// Error envelope returned with non-2xx responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}

/// Error body of an API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

/// Pagination metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub next_page: Option<u32>,
    pub last_page: Option<u32>,
    pub total_entries: Option<u64>,
}

/// Response metadata wrapper
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FloatingIpsResponse {
    pub floating_ips: Vec<FloatingIp>,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ServersResponse {
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ServerResponse {
    pub server: Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ActionResponse {
    pub action: Action,
}

/// Request body for `POST /floating_ips/{id}/actions/assign`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignFloatingIpRequest {
    pub server: u64,
}
