//! Hetzner Cloud REST API Client
//!
//! A small client for the parts of the Hetzner Cloud API needed to move
//! floating IPs between servers.
//!
//! # Example
//!
//! ```no_run
//! use hcloud_client::{HcloudClient, HcloudClientTrait, DEFAULT_ENDPOINT};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HcloudClient::new(
//!     DEFAULT_ENDPOINT.to_string(),
//!     "your-api-token".to_string(),
//!     "hcloud-ip-floater/0.1.0",
//! )?;
//!
//! // Floating IPs labelled for the floater
//! let fips = client.list_floating_ips("floater=managed").await?;
//!
//! // Move the first one to "node-1"
//! if let (Some(fip), Some(server)) = (fips.first(), client.get_server_by_name("node-1").await?) {
//!     let action = client.assign_floating_ip(fip.id, server.id).await?;
//!     client.wait_for_action(&action).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod hcloud_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::{HcloudClient, DEFAULT_ENDPOINT};
pub use error::HcloudError;
pub use models::*;
pub use hcloud_trait::HcloudClientTrait;
#[cfg(feature = "test-util")]
pub use mock::{AssignCall, MockHcloudClient};
