//! Integration tests for the Hetzner Cloud client
//!
//! These tests talk to the real API and are read-only.
//! Set HCLOUD_TOKEN (and optionally HCLOUD_ENDPOINT) to run.

use hcloud_client::{HcloudClient, HcloudClientTrait, DEFAULT_ENDPOINT};

fn client_from_env() -> HcloudClient {
    let endpoint = std::env::var("HCLOUD_ENDPOINT")
        .unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
    let token = std::env::var("HCLOUD_TOKEN")
        .expect("HCLOUD_TOKEN environment variable must be set");

    HcloudClient::new(endpoint, token, "hcloud-client-tests/0.0.0").expect("Failed to create client")
}

#[tokio::test]
#[ignore] // Requires a Hetzner Cloud project
async fn test_list_floating_ips() {
    let client = client_from_env();

    let fips = client.list_floating_ips("").await
        .expect("Failed to list floating IPs");

    println!("Found {} floating IPs", fips.len());
}

#[tokio::test]
#[ignore]
async fn test_resolve_assigned_servers() {
    let client = client_from_env();

    let fips = client.list_floating_ips("").await
        .expect("Failed to list floating IPs");

    for fip in fips {
        if let Some(server_id) = fip.server {
            let server = client.get_server(server_id).await
                .expect("Failed to get server")
                .expect("Assigned server must exist");
            println!("{} -> {}", fip.ip, server.name);

            let by_name = client.get_server_by_name(&server.name).await
                .expect("Failed to look up server by name");
            assert_eq!(by_name.map(|s| s.id), Some(server_id));
        }
    }
}

#[tokio::test]
#[ignore]
async fn test_unknown_server_is_none() {
    let client = client_from_env();

    let server = client.get_server_by_name("hcloud-client-tests-does-not-exist").await
        .expect("Lookup should not fail");
    assert!(server.is_none());
}
