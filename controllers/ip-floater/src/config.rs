//! Controller configuration.
//!
//! Every setting is a command line flag with an `HCLOUD_IP_FLOATER_*`
//! environment fallback. Flags are parsed once at startup and validated into
//! an immutable [`Config`] that is handed to every component.

use crate::error::ControllerError;
use clap::builder::BoolishValueParser;
use clap::Parser;
use hcloud_client::DEFAULT_ENDPOINT;
use std::time::Duration;

/// Name of the MetalLB address pool managed by the exporter
pub const METALLB_POOL_NAME: &str = "hcloud-ip-floater";

/// hcloud IP floater - keeps Hetzner Cloud floating IPs on the nodes serving them
#[derive(Parser, Debug, Clone)]
#[command(name = "hcloud-ip-floater", version, about, long_about = None)]
pub struct Args {
    /// Verbosity level for logs (overridden by RUST_LOG)
    #[arg(short = 'l', long, env = "HCLOUD_IP_FLOATER_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// API token for Hetzner Cloud access
    #[arg(long, env = "HCLOUD_IP_FLOATER_HCLOUD_TOKEN", hide_env_values = true)]
    pub hcloud_token: Option<String>,

    /// Hetzner Cloud API endpoint
    #[arg(long, env = "HCLOUD_IP_FLOATER_HCLOUD_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub hcloud_endpoint: String,

    /// Label selector used to match services
    #[arg(
        long,
        env = "HCLOUD_IP_FLOATER_SERVICE_LABEL_SELECTOR",
        default_value = "hcloud-ip-floater.cstl.dev/ignore!=true"
    )]
    pub service_label_selector: String,

    /// Label selector used to match floating IPs
    #[arg(long, env = "HCLOUD_IP_FLOATER_FLOATING_LABEL_SELECTOR", default_value = "")]
    pub floating_label_selector: String,

    /// Pod label listing manually assigned floating IPs (empty disables)
    #[arg(
        long,
        env = "HCLOUD_IP_FLOATER_MANUAL_ASSIGNMENT_LABEL",
        default_value = "hcloud-ip-floater.cstl.dev/floating-ip"
    )]
    pub manual_assignment_label: String,

    /// Enable exporting of floating IPs to MetalLB
    #[arg(long, env = "HCLOUD_IP_FLOATER_EXPORT_TO_METALLB_CONFIG", value_parser = BoolishValueParser::new())]
    pub export_to_metallb_config: bool,

    /// Namespace of the MetalLB ConfigMap
    #[arg(long, env = "HCLOUD_IP_FLOATER_METALLB_NAMESPACE", default_value = "metallb-system")]
    pub metallb_namespace: String,

    /// Name of the ConfigMap used by MetalLB
    #[arg(long, env = "HCLOUD_IP_FLOATER_METALLB_CONFIG_NAME", default_value = "config")]
    pub metallb_config_name: String,

    /// Seconds between floating IP polls
    #[arg(long, env = "HCLOUD_IP_FLOATER_SYNC_INTERVAL", default_value_t = 300, hide = true)]
    pub sync_interval: u64,
}

/// Immutable controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Default log filter when `RUST_LOG` is not set
    pub log_level: String,
    pub hcloud_token: String,
    pub hcloud_endpoint: String,
    /// Label selector used to match services
    pub service_label_selector: String,
    /// Label selector used to match floating IPs
    pub floating_label_selector: String,
    /// Pod label carrying manually assigned IPs; `None` disables manual assignment
    pub manual_assignment_label: Option<String>,
    /// Interval between floating IP polls
    pub sync_interval: Duration,
    pub metallb: Option<MetalLbConfig>,
}

/// Where the MetalLB exporter writes its pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetalLbConfig {
    pub namespace: String,
    pub config_name: String,
}

impl Config {
    /// Parses the command line (with environment fallback) and validates it.
    ///
    /// Exits the process on malformed flags, `--help` and `--version`.
    pub fn load() -> Result<Self, ControllerError> {
        Self::from_args(Args::parse())
    }

    /// Validates parsed arguments.
    pub fn from_args(args: Args) -> Result<Self, ControllerError> {
        let hcloud_token = args
            .hcloud_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ControllerError::InvalidConfig(
                "--hcloud-token (or HCLOUD_IP_FLOATER_HCLOUD_TOKEN) is required".to_string()
            ))?;

        if args.sync_interval == 0 {
            return Err(ControllerError::InvalidConfig("--sync-interval must be positive".to_string()));
        }

        let manual_assignment_label = Some(args.manual_assignment_label)
            .filter(|label| !label.trim().is_empty());

        let metallb = args.export_to_metallb_config.then(|| MetalLbConfig {
            namespace: args.metallb_namespace,
            config_name: args.metallb_config_name,
        });

        Ok(Self {
            log_level: args.log_level,
            hcloud_token,
            hcloud_endpoint: args.hcloud_endpoint,
            service_label_selector: args.service_label_selector,
            floating_label_selector: args.floating_label_selector,
            manual_assignment_label,
            sync_interval: Duration::from_secs(args.sync_interval),
            metallb,
        })
    }
}
