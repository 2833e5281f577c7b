//! Cloudflare REST API client
//!
//! Every response uses the `{ success, errors, result }` envelope. Failures
//! keep the distinction between a bad token (401), a token lacking scope
//! (403) and a wrong account/zone id or endpoint (404 or an unroutable
//! request), since each points the operator at a different fix.

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the Cloudflare API
#[derive(Debug, Error)]
pub enum ApiError {
    /// The bearer token was rejected outright
    #[error("Invalid Cloudflare API token.")]
    InvalidToken,

    /// The token is valid but lacks the scope for this call
    #[error("Token valid but missing Account/Zone permissions for this endpoint.")]
    MissingPermissions,

    /// Wrong account/zone id or endpoint
    #[error("Cloudflare API endpoint mismatch. Verify the account/zone ID and endpoint.")]
    EndpointMismatch,

    /// Any other rejection, with the first message Cloudflare returned
    #[error("{message}")]
    Rejected { status: u16, message: String },

    /// The request never produced a response
    #[error("Cloudflare API request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The response did not match the documented envelope
    #[error("Unexpected Cloudflare API response: {0}")]
    Deserialize(String),
}

impl ApiError {
    /// HTTP status that produced this error, when there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::InvalidToken => Some(401),
            ApiError::MissingPermissions => Some(403),
            ApiError::EndpointMismatch => Some(404),
            ApiError::Rejected { status, .. } => Some(*status),
            ApiError::Http(e) => e.status().map(|s| s.as_u16()),
            ApiError::Deserialize(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

/// Result of `/user/tokens/verify`
#[derive(Debug, Clone, Deserialize)]
pub struct TokenStatus {
    pub id: String,
    pub status: String,
}

/// Result of `/accounts/<id>`
#[derive(Debug, Clone, Deserialize)]
pub struct AccountDetails {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A DNS zone the account controls
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

/// A remotely created named tunnel
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTunnel {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// DNS record request body
#[derive(Debug, Clone, Serialize)]
pub struct DnsRecordRequest {
    #[serde(rename = "type")]
    pub record_type: String,
    pub name: String,
    pub content: String,
    pub proxied: bool,
}

impl DnsRecordRequest {
    /// Proxied CNAME pointing `name` at `content`
    pub fn cname(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            record_type: "CNAME".to_string(),
            name: name.into(),
            content: content.into(),
            proxied: true,
        }
    }
}

/// A created DNS record
#[derive(Debug, Clone, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Serialize)]
struct CreateTunnelBody<'a> {
    name: &'a str,
}

/// Bearer-token client for the Cloudflare v4 API
#[derive(Debug, Clone)]
pub struct CloudflareClient {
    client: Client,
    base_url: String,
}

impl CloudflareClient {
    /// Create a client against `base_url` (normally `https://api.cloudflare.com/client/v4`)
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn request<T, B>(
        &self,
        token: &str,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        tracing::debug!("Cloudflare {} {}", method, endpoint);

        let mut request = self.client.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let envelope = serde_json::from_str::<Envelope<T>>(&text).ok();

        match envelope {
            Some(Envelope {
                success: true,
                result: Some(result),
                ..
            }) if status.is_success() => Ok(result),
            Some(Envelope {
                success: true,
                result: None,
                ..
            }) if status.is_success() => Err(ApiError::Deserialize(format!(
                "{} returned no result",
                endpoint
            ))),
            Some(envelope) => Err(classify(status, &envelope.errors)),
            None if status.is_success() => Err(ApiError::Deserialize(format!(
                "{} returned a body that is not a Cloudflare envelope",
                endpoint
            ))),
            None => Err(classify(status, &[])),
        }
    }

    /// Check that a token is valid and active
    pub async fn verify_token(&self, token: &str) -> Result<TokenStatus, ApiError> {
        self.request::<_, ()>(token, Method::GET, "/user/tokens/verify", None)
            .await
    }

    pub async fn account_details(
        &self,
        token: &str,
        account_id: &str,
    ) -> Result<AccountDetails, ApiError> {
        self.request::<_, ()>(token, Method::GET, &format!("/accounts/{}", account_id), None)
            .await
    }

    /// Active zones under the account (first page of 100)
    pub async fn list_zones(&self, token: &str, account_id: &str) -> Result<Vec<Zone>, ApiError> {
        self.request::<_, ()>(
            token,
            Method::GET,
            &format!("/accounts/{}/zones?per_page=100&status=active", account_id),
            None,
        )
        .await
    }

    /// Create a named tunnel resource
    pub async fn create_tunnel(
        &self,
        token: &str,
        account_id: &str,
        name: &str,
    ) -> Result<RemoteTunnel, ApiError> {
        self.request(
            token,
            Method::POST,
            &format!("/accounts/{}/cfd_tunnel", account_id),
            Some(&CreateTunnelBody { name }),
        )
        .await
    }

    pub async fn create_dns_record(
        &self,
        token: &str,
        zone_id: &str,
        record: &DnsRecordRequest,
    ) -> Result<DnsRecord, ApiError> {
        self.request(
            token,
            Method::POST,
            &format!("/zones/{}/dns_records", zone_id),
            Some(record),
        )
        .await
    }
}

fn classify(status: StatusCode, errors: &[ApiMessage]) -> ApiError {
    let endpoint_mismatch = errors.iter().any(|e| {
        let message = e.message.to_lowercase();
        message.contains("could not route")
            || message.contains("endpoint not found")
            || message.contains("not found")
    });

    match status {
        StatusCode::UNAUTHORIZED => ApiError::InvalidToken,
        StatusCode::FORBIDDEN => ApiError::MissingPermissions,
        StatusCode::NOT_FOUND => ApiError::EndpointMismatch,
        _ if endpoint_mismatch => ApiError::EndpointMismatch,
        _ => ApiError::Rejected {
            status: status.as_u16(),
            message: errors
                .iter()
                .map(|e| e.message.trim())
                .find(|m| !m.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Cloudflare API error ({}).", status.as_u16())),
        },
    }
}
