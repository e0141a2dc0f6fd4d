//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the provider
//! client, the reconciler and the assignment watchers together and supervises
//! their tasks.

use crate::config::Config;
use crate::error::ControllerError;
use crate::manual::ManualAssignment;
use crate::metallb::MetalLbExporter;
use crate::readiness::KubePodFeeds;
use crate::reconciler::Reconciler;
use crate::service::ServiceAssignment;
use hcloud_client::HcloudClient;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

type Task = JoinHandle<Result<(), ControllerError>>;

/// Main controller for floating IP management.
pub struct Controller {
    floating_ip_sync: Task,
    service_watcher: Task,
    manual_watcher: Option<Task>,
    metallb_exporter: Option<Task>,
}

impl Controller {
    /// Creates the clients and starts all background tasks.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing hcloud IP floater");

        let kube_client = Client::try_default().await?;

        let hcloud_client = HcloudClient::new(
            config.hcloud_endpoint.clone(),
            config.hcloud_token.clone(),
            &format!("hcloud-ip-floater/{}", env!("CARGO_PKG_VERSION")),
        )?;

        let reconciler = Arc::new(Reconciler::new(
            Arc::new(hcloud_client),
            &config.floating_label_selector,
        ));
        let services = ServiceAssignment::new(
            Arc::clone(&reconciler),
            Arc::new(KubePodFeeds::new(kube_client.clone())),
        );

        let floating_ip_sync = {
            let reconciler = Arc::clone(&reconciler);
            let interval = config.sync_interval;
            tokio::spawn(async move { reconciler.run(interval).await })
        };

        let service_watcher = {
            let services = Arc::clone(&services);
            let api: Api<Service> = Api::all(kube_client.clone());
            let selector = config.service_label_selector.clone();
            tokio::spawn(async move { services.run(api, &selector).await })
        };

        let manual_watcher = match config.manual_assignment_label.as_deref() {
            Some(label) => {
                let manual = ManualAssignment::new(label, Arc::clone(&reconciler), Arc::clone(&services));
                let api: Api<Pod> = Api::all(kube_client.clone());
                Some(tokio::spawn(async move { manual.run(api).await }))
            }
            None => {
                info!("Manual assignment disabled");
                None
            }
        };

        let metallb_exporter = config.metallb.as_ref().map(|metallb| {
            let exporter = MetalLbExporter::new(kube_client.clone(), metallb, reconciler.subscribe_managed_ips());
            tokio::spawn(exporter.run())
        });

        Ok(Self {
            floating_ip_sync,
            service_watcher,
            manual_watcher,
            metallb_exporter,
        })
    }

    /// Runs the controller until a task fails or the process is interrupted.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("hcloud IP floater running");

        let result = tokio::select! {
            result = &mut self.floating_ip_sync => task_result("floating IP sync", result),
            result = &mut self.service_watcher => task_result("service watcher", result),
            result = optional(&mut self.manual_watcher) => task_result("manual assignment watcher", result),
            result = optional(&mut self.metallb_exporter) => task_result("MetalLB exporter", result),
            signal = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                signal.map_err(|e| ControllerError::Watch(format!("signal handler failed: {}", e)))
            }
        };

        self.shutdown();
        result
    }

    fn shutdown(&self) {
        self.floating_ip_sync.abort();
        self.service_watcher.abort();
        for task in [&self.manual_watcher, &self.metallb_exporter].into_iter().flatten() {
            task.abort();
        }
    }
}

/// Waits for an optional task; a missing task never finishes.
async fn optional(
    task: &mut Option<Task>,
) -> Result<Result<(), ControllerError>, tokio::task::JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

fn task_result(
    name: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    result
        .map_err(|e| ControllerError::Watch(format!("{} panicked: {}", name, e)))?
        .map_err(|e| ControllerError::Watch(format!("{} error: {}", name, e)))
}
