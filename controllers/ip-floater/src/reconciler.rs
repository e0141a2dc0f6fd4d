//! Attachment reconciliation.
//!
//! The reconciler owns both sides of the comparison: the desired attachments
//! written by the assignment components and the observed floating IPs read
//! from the provider. A pass attaches every claimed floating IP that is not
//! on its desired node. Unclaimed floating IPs are never touched, and
//! forgetting a claim never detaches anything.

use crate::desired::DesiredState;
use crate::error::ControllerError;
use crate::observed::{AttachedServer, ObservedIp, ObservedState};
use crate::single_flight::SingleFlight;
use hcloud_client::{HcloudClientTrait, HcloudError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const PASS_KEY: &str = "reconcile";

/// Summary of one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutcome {
    /// Addresses attached (or confirmed) during this pass
    pub attached: Vec<String>,
    /// Addresses already on their desired node
    pub unchanged: usize,
    /// Addresses whose attach failed; retried on the next pass
    pub failed: Vec<String>,
    /// Observed addresses without a desired node
    pub unclaimed: usize,
    /// Desired addresses the provider does not list
    pub missing: Vec<String>,
}

/// Drives observed floating IPs toward the desired attachments.
pub struct Reconciler {
    client: Arc<dyn HcloudClientTrait>,
    desired: DesiredState,
    observed: ObservedState,
    passes: SingleFlight<PassOutcome>,
    managed_ips: watch::Sender<Option<BTreeSet<String>>>,
}

enum AttachResult {
    Attached(AttachedServer),
    AlreadyAttached(AttachedServer),
}

impl Reconciler {
    /// Creates a reconciler for the floating IPs matching `floating_label_selector`.
    pub fn new(client: Arc<dyn HcloudClientTrait>, floating_label_selector: &str) -> Self {
        let (managed_ips, _) = watch::channel(None);
        Self {
            client,
            desired: DesiredState::new(),
            observed: ObservedState::new(floating_label_selector),
            passes: SingleFlight::new(),
            managed_ips,
        }
    }

    pub fn desired(&self) -> &DesiredState {
        &self.desired
    }

    #[cfg(test)]
    pub fn observed(&self) -> &ObservedState {
        &self.observed
    }

    /// Addresses of all floating IPs currently managed, updated after every
    /// refresh. `None` until the first refresh succeeds.
    pub fn subscribe_managed_ips(&self) -> watch::Receiver<Option<BTreeSet<String>>> {
        self.managed_ips.subscribe()
    }

    /// Claims `ips` for `node`. Triggers a refresh and a pass when this changed anything.
    pub async fn attach_to_node(&self, ips: &BTreeSet<String>, node: &str) {
        if !self.desired.claim(ips, node).await {
            debug!(node = %node, ips = ?ips, "Desired attachment unchanged");
            return;
        }

        info!(node = %node, ips = ?ips, "Desired attachment changed");
        if let Err(e) = self.refresh().await {
            error!("Failed to refresh floating IPs: {}", e);
        }
        self.reconcile().await;
    }

    /// Drops the claims on `ips`. The addresses stay where they are.
    pub async fn forget(&self, ips: &BTreeSet<String>) {
        let removed = self.desired.forget(ips).await;
        if !removed.is_empty() {
            info!(ips = ?removed, "Forgot desired attachment");
        }
    }

    /// Re-reads floating IPs from the provider. Returns whether a pass is due.
    pub async fn refresh(&self) -> Result<bool, ControllerError> {
        let desired = self.desired.snapshot().await;
        let changed = self.observed.refresh(self.client.as_ref(), &desired).await?;

        let addresses = Some(self.observed.addresses().await);
        self.managed_ips.send_if_modified(|current| {
            if *current == addresses {
                false
            } else {
                *current = addresses;
                true
            }
        });

        Ok(changed)
    }

    /// Runs a reconcile pass, or joins the one in flight.
    pub async fn reconcile(&self) -> PassOutcome {
        self.passes.run(PASS_KEY, || self.run_pass()).await
    }

    async fn run_pass(&self) -> PassOutcome {
        let desired = self.desired.snapshot().await;
        let observed = self.observed.snapshot().await;
        let mut outcome = PassOutcome::default();

        let mut addresses: Vec<&String> = observed.keys().collect();
        addresses.sort();

        for ip in addresses {
            let fip = &observed[ip];
            let Some(node) = desired.get(ip) else {
                debug!(fip = %ip, "Floating IP is not claimed; leaving it alone");
                outcome.unclaimed += 1;
                continue;
            };

            if fip.server_name() == Some(node.as_str()) {
                debug!(fip = %ip, node = %node, "Floating IP already attached");
                outcome.unchanged += 1;
                continue;
            }

            match self.attach(fip, node).await {
                Ok(result) => {
                    let server = match result {
                        AttachResult::Attached(server) => {
                            info!(fip = %ip, node = %node, "Attached floating IP");
                            server
                        }
                        AttachResult::AlreadyAttached(server) => {
                            info!(fip = %ip, node = %node, "Floating IP was already attached");
                            server
                        }
                    };
                    self.observed.record_attachment(ip, server).await;
                    outcome.attached.push(ip.clone());
                }
                Err(e) => {
                    error!(fip = %ip, node = %node, "Failed to attach floating IP: {}", e);
                    outcome.failed.push(ip.clone());
                }
            }
        }

        let mut missing: Vec<String> = desired
            .keys()
            .filter(|ip| !observed.contains_key(*ip))
            .cloned()
            .collect();
        missing.sort();
        for ip in &missing {
            warn!(fip = %ip, "Floating IP not found");
        }
        outcome.missing = missing;

        info!(
            attached = outcome.attached.len(),
            unchanged = outcome.unchanged,
            failed = outcome.failed.len(),
            unclaimed = outcome.unclaimed,
            missing = outcome.missing.len(),
            "Reconcile pass complete"
        );
        outcome
    }

    async fn attach(&self, fip: &ObservedIp, node: &str) -> Result<AttachResult, ControllerError> {
        let server = self
            .client
            .get_server_by_name(node)
            .await?
            .ok_or_else(|| ControllerError::ServerNotFound(node.to_string()))?;
        let attached = AttachedServer { id: server.id, name: server.name };

        let action = match self.client.assign_floating_ip(fip.id, attached.id).await {
            Ok(action) => action,
            Err(HcloudError::AlreadyAssigned(_)) => return Ok(AttachResult::AlreadyAttached(attached)),
            Err(e) => return Err(e.into()),
        };

        self.client
            .wait_for_action(&action)
            .await
            .map_err(|e| match e {
                HcloudError::ActionFailed { .. } | HcloudError::ActionTimeout(_) => ControllerError::ActionFailed {
                    fip: fip.ip.clone(),
                    node: node.to_string(),
                    reason: e.to_string(),
                },
                other => other.into(),
            })?;

        Ok(AttachResult::Attached(attached))
    }

    /// Initial refresh and pass, then a refresh every `interval` with a pass
    /// whenever it reports a change.
    pub async fn run(&self, interval: Duration) -> Result<(), ControllerError> {
        info!("Starting floating IP sync (every {:?})", interval);

        if let Err(e) = self.refresh().await {
            error!("Initial floating IP refresh failed: {}", e);
        }
        self.reconcile().await;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.refresh().await {
                Ok(true) => {
                    info!("Floating IPs changed; reconciling");
                    self.reconcile().await;
                }
                Ok(false) => debug!("Floating IPs unchanged"),
                Err(e) => error!("Failed to refresh floating IPs: {}", e),
            }
        }
    }
}
