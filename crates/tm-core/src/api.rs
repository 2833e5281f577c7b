//! Request/response command model
//!
//! Inbound requests are validated here, at the boundary, before any
//! orchestrator component sees them. JSON shapes use a `type` tag the same
//! way across every sum type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::records::{AccountView, TunnelRecord};
use crate::types::{
    AccountId, DeploymentId, LoginSessionId, ProjectId, ProxyRotation, ProxyType, RuntimeType,
    TunnelType,
};

/// Largest number of free tunnels one request may create
pub const MAX_TUNNELS_PER_REQUEST: u32 = 20;

/// A file handed over by the upload layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Client-supplied file name, possibly carrying path components
    pub name: String,
    /// File contents
    pub data: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Where a deployment's files come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploySource {
    /// Freshly uploaded files (a single archive, or loose files)
    Upload { files: Vec<UploadedFile> },
    /// A saved project snapshot, copied into the deployment
    Project { project_id: ProjectId },
}

/// Request to stage and run an application bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub source: DeploySource,
    #[serde(default)]
    pub startup_command: Option<String>,
}

impl DeployRequest {
    pub fn validate(&self) -> Result<(), String> {
        match &self.source {
            DeploySource::Upload { files } if files.is_empty() => {
                Err("At least one file must be uploaded.".to_string())
            }
            DeploySource::Project { project_id } if project_id.as_str().trim().is_empty() => {
                Err("A project id is required.".to_string())
            }
            _ => Ok(()),
        }?;
        if let Some(command) = &self.startup_command {
            if command.trim().is_empty() {
                return Err("Startup command must not be blank.".to_string());
            }
        }
        Ok(())
    }
}

/// What a batch of tunnels points at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelTarget {
    /// An already reachable URL
    Url { target_url: String },
    /// Deploy a bundle first and point at it
    Deploy(DeployRequest),
    /// An existing deployment
    Deployment { deployment_id: DeploymentId },
}

/// Free quick tunnels or one named tunnel under a connected account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelMode {
    Free,
    Named {
        account_id: AccountId,
        domain_name: String,
        #[serde(default)]
        subdomain: Option<String>,
    },
}

impl TunnelMode {
    /// Hostname a named tunnel will be bound to
    pub fn full_domain(&self) -> Option<String> {
        match self {
            TunnelMode::Free => None,
            TunnelMode::Named {
                domain_name,
                subdomain,
                ..
            } => {
                let domain = domain_name.trim().trim_end_matches('.').to_lowercase();
                Some(match subdomain.as_deref().map(str::trim) {
                    Some(sub) if !sub.is_empty() => format!("{}.{}", sub.to_lowercase(), domain),
                    _ => domain,
                })
            }
        }
    }
}

fn default_tunnel_count() -> u32 {
    1
}

/// Request to create a campaign of tunnels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTunnelsRequest {
    pub campaign_name: String,
    pub target: TunnelTarget,
    #[serde(default = "default_tunnel_count")]
    pub tunnel_count: u32,
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(default)]
    pub proxy_type: Option<ProxyType>,
    #[serde(default)]
    pub proxy_rotation: ProxyRotation,
    pub mode: TunnelMode,
}

impl CreateTunnelsRequest {
    /// Reject malformed input before any side effect
    pub fn validate(&self) -> Result<(), String> {
        if self.campaign_name.trim().is_empty() {
            return Err("A campaign name is required.".to_string());
        }
        if self.tunnel_count == 0 || self.tunnel_count > MAX_TUNNELS_PER_REQUEST {
            return Err(format!(
                "Tunnel count must be between 1 and {}.",
                MAX_TUNNELS_PER_REQUEST
            ));
        }
        match &self.target {
            TunnelTarget::Url { target_url } => validate_target_url(target_url)?,
            TunnelTarget::Deploy(request) => request.validate()?,
            TunnelTarget::Deployment { .. } => {}
        }
        if self.proxies.iter().any(|p| p.trim().is_empty()) {
            return Err("Proxy entries must not be blank.".to_string());
        }
        if let TunnelMode::Named {
            domain_name,
            subdomain,
            ..
        } = &self.mode
        {
            if !is_valid_hostname(domain_name.trim().trim_end_matches('.')) {
                return Err(format!("Invalid domain name: {}", domain_name));
            }
            if let Some(sub) = subdomain.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                if !is_valid_hostname(sub) {
                    return Err(format!("Invalid subdomain: {}", sub));
                }
            }
        }
        Ok(())
    }

    /// Number of tunnels actually created; named campaigns are capped at one
    pub fn effective_count(&self) -> u32 {
        match self.mode {
            TunnelMode::Free => self.tunnel_count,
            TunnelMode::Named { .. } => 1,
        }
    }
}

/// Check that a tunnel target is an absolute http(s) URL
pub fn validate_target_url(target_url: &str) -> Result<(), String> {
    let trimmed = target_url.trim();
    let rest = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .ok_or_else(|| "A valid target URL is required.".to_string())?;
    if rest.is_empty() || rest.starts_with('/') || trimmed.chars().any(char::is_whitespace) {
        return Err("A valid target URL is required.".to_string());
    }
    Ok(())
}

fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Registration of a new Cloudflare account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountRegistration {
    /// API-token account validated against the REST API
    Token {
        label: String,
        #[serde(default)]
        email: Option<String>,
        account_id: String,
        api_token: String,
    },
    /// Certificate account connected through an interactive login
    Cloudflared {
        label: String,
        #[serde(default)]
        email: Option<String>,
    },
}

impl AccountRegistration {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            AccountRegistration::Token {
                label,
                account_id,
                api_token,
                ..
            } => {
                if label.trim().is_empty() || account_id.trim().is_empty() {
                    return Err("Label and account id are required.".to_string());
                }
                if api_token.trim().is_empty() {
                    return Err("An API token is required.".to_string());
                }
                Ok(())
            }
            AccountRegistration::Cloudflared { label, .. } => {
                if label.trim().is_empty() {
                    return Err("A label is required.".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Login session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginStatus {
    Starting,
    AwaitingAuth,
    Connected,
    Error,
}

impl LoginStatus {
    /// Whether the session can no longer change state
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoginStatus::Connected | LoginStatus::Error)
    }
}

/// Point-in-time view of a login session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginSnapshot {
    pub session_id: LoginSessionId,
    pub status: LoginStatus,
    pub login_url: Option<String>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub error: Option<String>,
}

/// Result of polling an account's login
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginPoll {
    /// Tracked session, if this process still knows it
    pub session: Option<LoginSnapshot>,
    /// Whether certificate material is present at the account's path
    pub cert_present: bool,
    pub account: AccountView,
}

/// A running deployment as seen by callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentInfo {
    pub id: DeploymentId,
    pub port: u16,
    pub target_url: String,
    pub runtime_type: RuntimeType,
    pub startup_command: Option<String>,
    pub command_line: String,
    pub root_dir: String,
    pub process_id: u64,
    pub pid: Option<u32>,
}

/// Result of creating a campaign
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTunnelsResponse {
    pub campaign_name: String,
    pub tunnels: Vec<TunnelRecord>,
    pub deployment: Option<DeploymentInfo>,
}

/// Derived grouping of tunnel records by campaign name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSummary {
    pub name: String,
    pub tunnel_type: TunnelType,
    pub tunnel_count: usize,
    pub target_url: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of deleting a campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignDeletion {
    pub name: String,
    pub removed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_request(target_url: &str, count: u32) -> CreateTunnelsRequest {
        CreateTunnelsRequest {
            campaign_name: "spring".to_string(),
            target: TunnelTarget::Url {
                target_url: target_url.to_string(),
            },
            tunnel_count: count,
            proxies: vec![],
            proxy_type: None,
            proxy_rotation: ProxyRotation::Cycle,
            mode: TunnelMode::Free,
        }
    }

    #[test]
    fn test_validate_target_url() {
        assert!(validate_target_url("http://localhost:8080").is_ok());
        assert!(validate_target_url("https://127.0.0.1").is_ok());
        assert!(validate_target_url("localhost:8080").is_err());
        assert!(validate_target_url("http://").is_err());
        assert!(validate_target_url("ftp://host").is_err());
        assert!(validate_target_url("http://a b").is_err());
    }

    #[test]
    fn test_tunnel_count_bounds() {
        assert!(free_request("http://localhost:8080", 1).validate().is_ok());
        assert!(free_request("http://localhost:8080", 0).validate().is_err());
        assert!(free_request("http://localhost:8080", MAX_TUNNELS_PER_REQUEST + 1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_named_campaigns_capped_to_one() {
        let mut request = free_request("http://localhost:8080", 5);
        assert_eq!(request.effective_count(), 5);
        request.mode = TunnelMode::Named {
            account_id: AccountId::new("acct_a"),
            domain_name: "example.com".to_string(),
            subdomain: Some("shop".to_string()),
        };
        assert!(request.validate().is_ok());
        assert_eq!(request.effective_count(), 1);
        assert_eq!(request.mode.full_domain().as_deref(), Some("shop.example.com"));
    }

    #[test]
    fn test_named_rejects_bad_subdomain() {
        let mut request = free_request("http://localhost:8080", 1);
        request.mode = TunnelMode::Named {
            account_id: AccountId::new("acct_a"),
            domain_name: "example.com".to_string(),
            subdomain: Some("../etc".to_string()),
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_request_json_shape() {
        let json = r#"{
            "campaignName": "spring",
            "target": {"type": "url", "target_url": "http://localhost:8080"},
            "tunnelCount": 3,
            "proxies": ["p1", "p2"],
            "mode": {"type": "free"}
        }"#;
        let request: CreateTunnelsRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.tunnel_count, 3);
        assert_eq!(request.proxy_rotation, ProxyRotation::Cycle);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_deploy_request_requires_files() {
        let request = DeployRequest {
            source: DeploySource::Upload { files: vec![] },
            startup_command: None,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_login_status_terminal() {
        assert!(LoginStatus::Connected.is_terminal());
        assert!(LoginStatus::Error.is_terminal());
        assert!(!LoginStatus::AwaitingAuth.is_terminal());
    }
}
