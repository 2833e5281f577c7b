//! Persisted records
//!
//! Field names are camelCase on disk so existing data files stay readable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::store::Collection;
use crate::types::{
    AccountId, AccountStatus, AuthType, DeploymentId, LoginSessionId, ProjectId, ProxyRotation,
    ProxyType, TunnelId, TunnelStatus, TunnelType,
};

/// A public tunnel pointing at a local target
///
/// `full_domain` is set exactly when `tunnel_type` is [`TunnelType::Named`];
/// use the constructors to keep that pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRecord {
    pub id: TunnelId,
    pub target_url: String,
    pub campaign_name: String,
    pub tunnel_type: TunnelType,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_type: Option<ProxyType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_rotation: Option<ProxyRotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_tunnel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<DeploymentId>,
    #[serde(default)]
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
}

impl TunnelRecord {
    /// Build a record for an ephemeral quick tunnel
    pub fn free(
        id: TunnelId,
        campaign_name: impl Into<String>,
        target_url: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            id,
            target_url: target_url.into(),
            campaign_name: campaign_name.into(),
            tunnel_type: TunnelType::Free,
            hostname: hostname.into(),
            proxy: None,
            proxy_type: None,
            proxy_rotation: None,
            account_id: None,
            domain_name: None,
            full_domain: None,
            remote_tunnel_id: None,
            process_id: None,
            pid: None,
            deployment_id: None,
            status: TunnelStatus::Active,
            created_at: Utc::now(),
        }
    }

    /// Build a record for a named tunnel bound to `full_domain`
    pub fn named(
        id: TunnelId,
        campaign_name: impl Into<String>,
        target_url: impl Into<String>,
        account_id: AccountId,
        domain_name: impl Into<String>,
        full_domain: impl Into<String>,
    ) -> Self {
        let full_domain = full_domain.into();
        Self {
            id,
            target_url: target_url.into(),
            campaign_name: campaign_name.into(),
            tunnel_type: TunnelType::Named,
            hostname: full_domain.clone(),
            proxy: None,
            proxy_type: None,
            proxy_rotation: None,
            account_id: Some(account_id),
            domain_name: Some(domain_name.into()),
            full_domain: Some(full_domain),
            remote_tunnel_id: None,
            process_id: None,
            pid: None,
            deployment_id: None,
            status: TunnelStatus::Active,
            created_at: Utc::now(),
        }
    }

    /// Public URL of the tunnel
    pub fn public_url(&self) -> String {
        format!("https://{}", self.hostname)
    }
}

impl Collection for TunnelRecord {
    const NAME: &'static str = "tunnels";
}

/// A Cloudflare account the orchestrator can provision named tunnels under
///
/// Token accounts carry `api_token`; certificate accounts carry `cert_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudflareAccount {
    pub id: AccountId,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    pub auth_type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub status: AccountStatus,
    #[serde(default)]
    pub zone_count: usize,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login_session_id: Option<LoginSessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CloudflareAccount {
    /// Whether the account can provision named tunnels
    pub fn is_connected(&self) -> bool {
        self.status == AccountStatus::Connected
    }

    /// Caller-facing view with the secret stripped
    pub fn view(&self) -> AccountView {
        AccountView {
            id: self.id.clone(),
            label: self.label.clone(),
            email: self.email.clone(),
            account_id: self.account_id.clone(),
            auth_type: self.auth_type,
            cert_path: self.cert_path.clone(),
            status: self.status,
            zone_count: self.zone_count,
            domains: self.domains.clone(),
            last_login_session_id: self.last_login_session_id.clone(),
            last_error: self.last_error.clone(),
            created_at: self.created_at,
        }
    }
}

impl Collection for CloudflareAccount {
    const NAME: &'static str = "accounts";
}

/// Account as returned to callers; never contains the API token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub id: AccountId,
    pub label: String,
    pub email: Option<String>,
    pub account_id: Option<String>,
    pub auth_type: AuthType,
    pub cert_path: Option<PathBuf>,
    pub status: AccountStatus,
    pub zone_count: usize,
    pub domains: Vec<String>,
    pub last_login_session_id: Option<LoginSessionId>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A reusable snapshot of staged application files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_script: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Collection for Project {
    const NAME: &'static str = "projects";
}
