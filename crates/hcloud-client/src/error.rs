//! Hetzner Cloud client errors

use thiserror::Error;

/// Error code the API returns when a floating IP is already assigned to the
/// requested server.
pub const ALREADY_ASSIGNED_CODE: &str = "floating_ip_already_assigned";

/// Errors that can occur when interacting with the Hetzner Cloud API
#[derive(Debug, Error)]
pub enum HcloudError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error envelope
    #[error("Hetzner Cloud API error ({code}): {message}")]
    Api { code: String, message: String },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// An asynchronous action finished with an error
    #[error("Action {id} failed ({code}): {message}")]
    ActionFailed { id: u64, code: String, message: String },

    /// The floating IP is already assigned to the requested server
    #[error("Floating IP {0} is already assigned to the requested server")]
    AlreadyAssigned(u64),

    /// An action did not finish within the wait timeout
    #[error("Timed out waiting for action {0}")]
    ActionTimeout(u64),

    /// Invalid client configuration (e.g., empty token)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
