//! Named tunnel provisioning
//!
//! A named tunnel is created remotely and bound to a DNS name; it has no
//! local process. How that happens depends on how the account
//! authenticated: token accounts go through the REST API, certificate
//! accounts through `cloudflared` subcommands.

mod certificate;
mod token;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use tm_core::{AuthType, CloudflareAccount};

use crate::error::{OrchestratorError, Result};

pub use certificate::CertificateStrategy;
pub use token::TokenStrategy;

/// What to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedTunnelRequest {
    /// Remote tunnel resource name
    pub tunnel_name: String,
    /// Fully qualified hostname to route to the tunnel
    pub hostname: String,
}

/// A remote tunnel bound to a hostname
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedTunnel {
    pub remote_tunnel_id: String,
    pub hostname: String,
    /// Zone (token) or registered domain (certificate) the hostname fell under
    pub zone_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_record_id: Option<String>,
}

/// One way of creating and routing a named tunnel
#[async_trait]
pub trait ProvisionStrategy: Send + Sync {
    /// Create the remote tunnel and bind `request.hostname` to it
    ///
    /// Implementations must check that the hostname belongs to the account
    /// before creating anything remotely.
    async fn provision(
        &self,
        account: &CloudflareAccount,
        request: &NamedTunnelRequest,
    ) -> Result<ProvisionedTunnel>;
}

/// Picks the strategy matching an account's authentication
pub struct NamedTunnelProvisioner {
    token: Arc<dyn ProvisionStrategy>,
    certificate: Arc<dyn ProvisionStrategy>,
}

impl NamedTunnelProvisioner {
    pub fn new(token: Arc<dyn ProvisionStrategy>, certificate: Arc<dyn ProvisionStrategy>) -> Self {
        Self { token, certificate }
    }

    pub async fn provision(
        &self,
        account: &CloudflareAccount,
        request: &NamedTunnelRequest,
    ) -> Result<ProvisionedTunnel> {
        if !account.is_connected() {
            return Err(OrchestratorError::AccountNotConnected(account.id.to_string()));
        }

        tracing::info!(
            "Provisioning named tunnel {} for {} under account {} ({:?})",
            request.tunnel_name,
            request.hostname,
            account.id,
            account.auth_type
        );

        let strategy = match account.auth_type {
            AuthType::Token => &self.token,
            AuthType::Cloudflared => &self.certificate,
        };
        let provisioned = strategy.provision(account, request).await?;

        tracing::info!(
            "Named tunnel {} routed {} (zone {})",
            provisioned.remote_tunnel_id,
            provisioned.hostname,
            provisioned.zone_name
        );
        Ok(provisioned)
    }
}

/// Remote tunnel name for a campaign: a DNS-safe slug plus a unique suffix
pub fn tunnel_name(campaign_name: &str, unique: &str) -> String {
    let mut slug = String::with_capacity(campaign_name.len());
    for c in campaign_name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "campaign" } else { slug };
    let slug: String = slug.chars().take(40).collect();
    format!("{}-{}", slug.trim_end_matches('-'), unique)
}
