//! MetalLB config export.
//!
//! Publishes the managed floating IPs as a layer-2 address pool in MetalLB's
//! ConfigMap so MetalLB can hand them out to LoadBalancer services. Other
//! pools and settings in the config are preserved.

use crate::config::{MetalLbConfig, METALLB_POOL_NAME};
use crate::error::ControllerError;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use kube_runtime::{watcher, WatchStreamExt};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// ConfigMap key holding MetalLB's YAML config
pub const CONFIG_KEY: &str = "config";

/// Skeleton of MetalLB's config: address pools are edited, everything else is carried through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetalLbDocument {
    #[serde(rename = "address-pools", default)]
    pub address_pools: Vec<Mapping>,
    #[serde(flatten)]
    pub other: Mapping,
}

/// Parses a MetalLB config; an empty document is an empty config.
pub fn parse_config(yaml: &str) -> Result<MetalLbDocument, ControllerError> {
    if yaml.trim().is_empty() {
        return Ok(MetalLbDocument::default());
    }
    Ok(serde_yaml::from_str(yaml)?)
}

/// Our layer-2 pool with `addresses` (CIDR notation).
pub fn pool_for_addresses(addresses: &[String]) -> Mapping {
    let mut pool = Mapping::new();
    pool.insert("name".into(), METALLB_POOL_NAME.into());
    pool.insert("protocol".into(), "layer2".into());
    pool.insert(
        "addresses".into(),
        Value::Sequence(addresses.iter().map(|a| Value::String(a.clone())).collect()),
    );
    pool
}

/// Replaces our pool in `yaml` (or appends it) with one holding `addresses`.
pub fn merge_configs(yaml: &str, addresses: &[String]) -> Result<MetalLbDocument, ControllerError> {
    let mut config = parse_config(yaml)?;
    let pool = pool_for_addresses(addresses);

    let ours = config
        .address_pools
        .iter()
        .position(|p| p.get("name").and_then(Value::as_str) == Some(METALLB_POOL_NAME));
    match ours {
        Some(i) => config.address_pools[i] = pool,
        None => config.address_pools.push(pool),
    }

    Ok(config)
}

/// Single-address CIDR for `ip`: `/32` for IPv4, `/128` for IPv6.
pub fn address_cidr(ip: &str) -> Option<String> {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Some(format!("{}/32", v4)),
        Ok(IpAddr::V6(v6)) => Some(format!("{}/128", v6)),
        Err(_) => {
            warn!(fip = %ip, "Skipping unparsable floating IP");
            None
        }
    }
}

/// Pool addresses to export for the managed floating IPs.
///
/// `None` while the managed set is unknown, i.e. before the first successful
/// refresh. An unknown set is never exported as an empty pool.
pub fn export_addresses(managed: Option<&BTreeSet<String>>) -> Option<Vec<String>> {
    managed.map(|ips| ips.iter().filter_map(|ip| address_cidr(ip)).collect())
}

/// Keeps MetalLB's ConfigMap in line with the managed floating IPs.
pub struct MetalLbExporter {
    api: Api<ConfigMap>,
    namespace: String,
    config_name: String,
    managed_ips: watch::Receiver<Option<BTreeSet<String>>>,
}

impl MetalLbExporter {
    pub fn new(client: Client, config: &MetalLbConfig, managed_ips: watch::Receiver<Option<BTreeSet<String>>>) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            namespace: config.namespace.clone(),
            config_name: config.config_name.clone(),
            managed_ips,
        }
    }

    /// Exports whenever the managed IPs or the ConfigMap change.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!(namespace = %self.namespace, name = %self.config_name, "Starting MetalLB config exporter");

        let watch_config = watcher::Config::default().fields(&format!("metadata.name={}", self.config_name));
        let mut events = Box::pin(watcher(self.api.clone(), watch_config).default_backoff());

        loop {
            tokio::select! {
                changed = self.managed_ips.changed() => {
                    if changed.is_err() {
                        return Err(ControllerError::Watch("managed floating IP updates stopped".to_string()));
                    }
                }
                event = events.next() => match event {
                    Some(Ok(watcher::Event::Apply(_) | watcher::Event::Delete(_) | watcher::Event::InitDone)) => {}
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("MetalLB config watch error (will retry): {}", e);
                        continue;
                    }
                    None => return Err(ControllerError::Watch("MetalLB config watch stream ended".to_string())),
                },
            }

            let managed = self.managed_ips.borrow_and_update().clone();
            let Some(addresses) = export_addresses(managed.as_ref()) else {
                debug!("Floating IPs not refreshed yet; not exporting to MetalLB");
                continue;
            };
            if let Err(e) = self.export(&addresses).await {
                error!("Failed to export floating IPs to MetalLB: {}", e);
            }
        }
    }

    async fn export(&self, addresses: &[String]) -> Result<(), ControllerError> {
        let existing = self.api.get_opt(&self.config_name).await?;
        let current = existing
            .as_ref()
            .and_then(|cm| cm.data.as_ref())
            .and_then(|data| data.get(CONFIG_KEY))
            .map(String::as_str)
            .unwrap_or_default();

        let merged = merge_configs(current, addresses)?;
        if parse_config(current).is_ok_and(|c| c == merged) {
            debug!("MetalLB config already up to date");
            return Ok(());
        }
        let rendered = serde_yaml::to_string(&merged)?;

        if existing.is_some() {
            let patch = serde_json::json!({ "data": { CONFIG_KEY: rendered } });
            self.api
                .patch(&self.config_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        } else {
            let config_map = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(self.config_name.clone()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), rendered)])),
                ..Default::default()
            };
            self.api.create(&PostParams::default(), &config_map).await?;
        }

        info!(addresses = addresses.len(), "Exported floating IPs to MetalLB config");
        Ok(())
    }
}
