//! hcloud IP floater
//!
//! Keeps Hetzner Cloud floating IPs attached to the nodes that serve them.
//!
//! LoadBalancer services get their load-balancer addresses attached to a node
//! running one of their ready pods; pods can also request addresses directly
//! through a label. Floating IPs are only ever moved towards a ready node,
//! never detached.

mod config;
mod controller;
mod desired;
mod election;
mod error;
mod feed;
mod manual;
mod metallb;
mod observed;
mod readiness;
mod reconciler;
mod service;
mod single_flight;
#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::controller::Controller;
use crate::error::ControllerError;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    let config = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // kube and reqwest both use rustls; pick the provider once for the process
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("rustls crypto provider already installed");
    }

    info!("Starting hcloud IP floater {}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Hetzner Cloud endpoint: {}", config.hcloud_endpoint);
    info!("  Service label selector: {}", config.service_label_selector);
    info!("  Floating IP label selector: {}", config.floating_label_selector);
    info!(
        "  Manual assignment label: {}",
        config.manual_assignment_label.as_deref().unwrap_or("(disabled)")
    );
    info!("  Sync interval: {:?}", config.sync_interval);
    if let Some(metallb) = &config.metallb {
        info!("  MetalLB config: {}/{}", metallb.namespace, metallb.config_name);
    }

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
