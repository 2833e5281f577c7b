//! Named tunnels through the Cloudflare REST API

use async_trait::async_trait;

use tm_core::CloudflareAccount;

use super::{NamedTunnelRequest, ProvisionStrategy, ProvisionedTunnel};
use crate::cloudflare::{find_zone_for_hostname, CloudflareClient, DnsRecordRequest};
use crate::error::{OrchestratorError, Result};

/// Creates the tunnel and its CNAME with the account's API token
pub struct TokenStrategy {
    client: CloudflareClient,
    routing_domain: String,
}

impl TokenStrategy {
    pub fn new(client: CloudflareClient, routing_domain: impl Into<String>) -> Self {
        Self {
            client,
            routing_domain: routing_domain.into(),
        }
    }
}

#[async_trait]
impl ProvisionStrategy for TokenStrategy {
    async fn provision(
        &self,
        account: &CloudflareAccount,
        request: &NamedTunnelRequest,
    ) -> Result<ProvisionedTunnel> {
        let (Some(token), Some(cf_account_id)) =
            (account.api_token.as_deref(), account.account_id.as_deref())
        else {
            return Err(OrchestratorError::validation(format!(
                "Account {} has no API token or Cloudflare account id",
                account.id
            )));
        };

        // Resolve the zone first so a foreign hostname creates nothing remotely
        let zones = self.client.list_zones(token, cf_account_id).await?;
        let zone = find_zone_for_hostname(&request.hostname, &zones)
            .ok_or_else(|| OrchestratorError::DomainNotAvailable(request.hostname.clone()))?;

        let tunnel = self
            .client
            .create_tunnel(token, cf_account_id, &request.tunnel_name)
            .await?;
        tracing::debug!("Created remote tunnel {} ({})", tunnel.id, request.tunnel_name);

        let record = self
            .client
            .create_dns_record(
                token,
                &zone.id,
                &DnsRecordRequest::cname(
                    &request.hostname,
                    format!("{}.{}", tunnel.id, self.routing_domain),
                ),
            )
            .await?;

        Ok(ProvisionedTunnel {
            remote_tunnel_id: tunnel.id,
            hostname: request.hostname.clone(),
            zone_name: zone.name.clone(),
            dns_record_id: Some(record.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tm_core::{AccountId, AccountStatus, AuthType};
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn account() -> CloudflareAccount {
        CloudflareAccount {
            id: AccountId::new("acct_t"),
            label: "token".to_string(),
            email: None,
            account_id: Some("cf1".to_string()),
            api_token: Some("secret".to_string()),
            auth_type: AuthType::Token,
            cert_path: None,
            status: AccountStatus::Connected,
            zone_count: 1,
            domains: vec![],
            last_login_session_id: None,
            last_error: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    async fn mount_zones(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/accounts/cf1/zones"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true, "errors": [],
                "result": [{"id": "z1", "name": "example.com"}]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_creates_tunnel_then_cname() {
        let server = MockServer::start().await;
        mount_zones(&server).await;
        Mock::given(method("POST"))
            .and(path("/accounts/cf1/cfd_tunnel"))
            .and(body_json(serde_json::json!({"name": "shop-ab12"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true, "errors": [],
                "result": {"id": "6ff42ae2-765d-4adf-8112-31c55c1551ef", "name": "shop-ab12"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/zones/z1/dns_records"))
            .and(body_json(serde_json::json!({
                "type": "CNAME",
                "name": "sub.example.com",
                "content": "6ff42ae2-765d-4adf-8112-31c55c1551ef.cfargotunnel.com",
                "proxied": true
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true, "errors": [], "result": {"id": "rec9"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let strategy = TokenStrategy::new(CloudflareClient::new(server.uri()), "cfargotunnel.com");
        let provisioned = strategy
            .provision(
                &account(),
                &NamedTunnelRequest {
                    tunnel_name: "shop-ab12".to_string(),
                    hostname: "sub.example.com".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(provisioned.zone_name, "example.com");
        assert_eq!(provisioned.dns_record_id.as_deref(), Some("rec9"));
    }

    #[tokio::test]
    async fn test_unmatched_domain_creates_nothing() {
        let server = MockServer::start().await;
        mount_zones(&server).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let strategy = TokenStrategy::new(CloudflareClient::new(server.uri()), "cfargotunnel.com");
        let err = strategy
            .provision(
                &account(),
                &NamedTunnelRequest {
                    tunnel_name: "shop-ab12".to_string(),
                    hostname: "shop.other.net".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DomainNotAvailable(_)));
        assert!(err.to_string().contains("Domain not available"));
    }
}
