//! Controller-specific error types.
//!
//! This module defines error types specific to the floating IP controller
//! that are not covered by upstream library errors.

use hcloud_client::HcloudError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the floating IP controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Hetzner Cloud API error
    #[error("Hetzner Cloud error: {0}")]
    Hcloud(#[from] HcloudError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Node election was called without candidates. Callers check for an
    /// empty node set first, so this indicates a bug.
    #[error("Node election for {0:?} called with an empty candidate set")]
    EmptyCandidateSet(String),

    /// Elected node does not resolve to a provider server
    #[error("Server not found for node: {0}")]
    ServerNotFound(String),

    /// The provider's assign action failed
    #[error("Attach action failed for {fip} -> {node}: {reason}")]
    ActionFailed { fip: String, node: String, reason: String },

    /// Tracked service vanished from the service cache
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// A watched object lacks the metadata needed to key it
    #[error("Object is missing {0}")]
    MissingMetadata(&'static str),

    /// MetalLB config could not be parsed or rendered
    #[error("MetalLB config error: {0}")]
    MetalLbConfig(#[from] serde_yaml::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
