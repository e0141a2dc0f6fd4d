//! Hetzner Cloud API client
//!
//! Implements the subset of the Hetzner Cloud REST API the floater needs:
//! `/floating_ips`, `/servers` and `/actions`.

use crate::backoff::PollBackoff;
use crate::error::{HcloudError, ALREADY_ASSIGNED_CODE};
use crate::hcloud_trait::HcloudClientTrait;
use crate::models::*;
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Default public API endpoint
pub const DEFAULT_ENDPOINT: &str = "https://api.hetzner.cloud/v1";

const PER_PAGE: u32 = 50;

/// How long `wait_for_action` waits before giving up
const ACTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Hetzner Cloud API client
pub struct HcloudClient {
    client: Client,
    endpoint: String,
    token: String,
}

impl HcloudClient {
    /// Create a new Hetzner Cloud client
    ///
    /// # Arguments
    /// * `endpoint` - API endpoint (e.g., "https://api.hetzner.cloud/v1")
    /// * `token` - API token for authentication
    /// * `user_agent` - Application name and version sent with every request
    pub fn new(endpoint: String, token: String, user_agent: &str) -> Result<Self, HcloudError> {
        if token.is_empty() {
            return Err(HcloudError::InvalidConfig("API token must not be empty".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn get_json<T: for<'de> serde::Deserialize<'de>>(&self, url: &str) -> Result<T, HcloudError> {
        debug!("GET {}", url);

        let response = self.client
            .get(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .await?;

        let response = Self::check_status(response).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Turn non-2xx responses into `HcloudError`, decoding the API's error envelope when present
    async fn check_status(response: Response) -> Result<Response, HcloudError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(HcloudError::NotFound(body));
        }

        match serde_json::from_str::<ApiErrorResponse>(&body) {
            Ok(envelope) => Err(HcloudError::Api {
                code: envelope.error.code,
                message: envelope.error.message,
            }),
            Err(_) => Err(HcloudError::Api {
                code: status.as_str().to_string(),
                message: body,
            }),
        }
    }

    /// Get an action by ID
    pub async fn get_action(&self, id: u64) -> Result<Action, HcloudError> {
        let response: ActionResponse = self.get_json(&self.url(&format!("/actions/{}", id))).await?;
        Ok(response.action)
    }

    async fn poll_action(&self, action: &Action) -> Result<Action, HcloudError> {
        let mut backoff = PollBackoff::default();
        let mut current = action.clone();

        loop {
            match current.status {
                ActionStatus::Success => return Ok(current),
                ActionStatus::Error => {
                    let (code, message) = current
                        .error
                        .map(|e| (e.code, e.message))
                        .unwrap_or_else(|| ("unknown".to_string(), "action failed".to_string()));
                    return Err(HcloudError::ActionFailed { id: current.id, code, message });
                }
                ActionStatus::Running => {
                    debug!("Action {} ({}) running: {}%", current.id, current.command, current.progress);
                    tokio::time::sleep(backoff.next_delay()).await;
                    current = self.get_action(current.id).await?;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl HcloudClientTrait for HcloudClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn list_floating_ips(&self, label_selector: &str) -> Result<Vec<FloatingIp>, HcloudError> {
        let mut all = Vec::new();
        let mut page = 1;

        loop {
            let mut url = format!("{}?page={}&per_page={}", self.url("/floating_ips"), page, PER_PAGE);
            if !label_selector.is_empty() {
                url.push_str("&label_selector=");
                url.push_str(&urlencoding::encode(label_selector));
            }

            let response: FloatingIpsResponse = self.get_json(&url).await?;
            all.extend(response.floating_ips);

            match response.meta.pagination.and_then(|p| p.next_page) {
                Some(next) => page = next,
                None => break,
            }
        }

        debug!("Fetched {} floating IPs", all.len());
        Ok(all)
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Option<Server>, HcloudError> {
        let url = format!("{}?name={}", self.url("/servers"), urlencoding::encode(name));
        let response: ServersResponse = self.get_json(&url).await?;
        Ok(response.servers.into_iter().find(|s| s.name == name))
    }

    async fn get_server(&self, id: u64) -> Result<Option<Server>, HcloudError> {
        match self.get_json::<ServerResponse>(&self.url(&format!("/servers/{}", id))).await {
            Ok(response) => Ok(Some(response.server)),
            Err(HcloudError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn assign_floating_ip(&self, floating_ip_id: u64, server_id: u64) -> Result<Action, HcloudError> {
        let url = self.url(&format!("/floating_ips/{}/actions/assign", floating_ip_id));
        let body = AssignFloatingIpRequest { server: server_id };
        debug!("POST {} with server {}", url, server_id);

        let response = self.client
            .post(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;

        match Self::check_status(response).await {
            Ok(response) => {
                let text = response.text().await?;
                let parsed: ActionResponse = serde_json::from_str(&text)?;
                Ok(parsed.action)
            }
            Err(HcloudError::Api { code, .. }) if code == ALREADY_ASSIGNED_CODE => {
                Err(HcloudError::AlreadyAssigned(floating_ip_id))
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_for_action(&self, action: &Action) -> Result<Action, HcloudError> {
        tokio::time::timeout(ACTION_TIMEOUT, self.poll_action(action))
            .await
            .map_err(|_elapsed| HcloudError::ActionTimeout(action.id))?
    }
}
