//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for the orchestrator daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Address the HTTP surface binds to
    pub bind_address: String,

    /// Root for collection files, certificates, deployments and projects
    pub data_dir: PathBuf,

    /// Tunnel client binary
    pub cloudflared_bin: String,

    /// Script runtime binary used for manifest-bearing bundles
    pub node_bin: String,

    /// Generic web server binary (`<php> -S host:port -t root`)
    pub php_bin: String,

    /// Shell used to run explicit startup commands
    pub shell_bin: String,

    /// Cloudflare REST API base URL
    pub api_base_url: String,

    /// Domain named-tunnel CNAME records point into (`<tunnel-id>.<routing_domain>`)
    pub routing_domain: String,

    /// Domain quick tunnels are assigned under
    pub quick_tunnel_domain: String,

    /// How long a quick tunnel may run before printing its hostname
    #[serde(with = "duration_secs")]
    pub quick_tunnel_ready_timeout: Duration,

    /// How long `start_login` waits for a login URL before returning the
    /// session in its current state
    #[serde(with = "duration_secs")]
    pub login_url_wait: Duration,

    /// How long a fresh deployment may take to accept connections
    #[serde(with = "duration_secs")]
    pub deploy_ready_timeout: Duration,

    /// Age after which finished login sessions are evicted
    #[serde(with = "duration_secs")]
    pub login_session_ttl: Duration,

    /// Captured output chunks kept per supervised process
    pub output_chunk_limit: usize,

    /// Largest deployment file `read_file` returns
    pub max_read_bytes: u64,

    /// Largest accepted upload bundle (sum of all uploaded files)
    pub max_upload_bytes: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:3000".to_string(),
            data_dir: super::default_data_dir(),
            cloudflared_bin: "cloudflared".to_string(),
            node_bin: "node".to_string(),
            php_bin: "php".to_string(),
            shell_bin: "sh".to_string(),
            api_base_url: "https://api.cloudflare.com/client/v4".to_string(),
            routing_domain: "cfargotunnel.com".to_string(),
            quick_tunnel_domain: "trycloudflare.com".to_string(),
            quick_tunnel_ready_timeout: Duration::from_secs(60),
            login_url_wait: Duration::from_secs(20),
            deploy_ready_timeout: Duration::from_secs(10),
            login_session_ttl: Duration::from_secs(3600),
            output_chunk_limit: 500,
            max_read_bytes: 1024 * 1024,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl OrchestratorConfig {
    /// Directory holding per-account certificate material
    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }

    /// Directory holding one base directory per deployment
    pub fn deployments_dir(&self) -> PathBuf {
        self.data_dir.join("deployments")
    }

    /// Directory holding saved project snapshots
    pub fn projects_dir(&self) -> PathBuf {
        self.data_dir.join("projects")
    }

    /// Certificate path used for an account's `cloudflared` login
    pub fn account_cert_path(&self, account_id: &str) -> PathBuf {
        self.certs_dir().join(account_id).join("cert.pem")
    }

    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let binaries = [
            ("cloudflared_bin", &self.cloudflared_bin),
            ("node_bin", &self.node_bin),
            ("php_bin", &self.php_bin),
            ("shell_bin", &self.shell_bin),
        ];
        if let Some((field, _)) = binaries.iter().find(|(_, bin)| bin.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("{} must not be empty", field)));
        }
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "api_base_url must be an http(s) URL, got {:?}",
                self.api_base_url
            )));
        }
        if self.quick_tunnel_ready_timeout.is_zero() || self.login_url_wait.is_zero() {
            return Err(ConfigError::Invalid(
                "quick_tunnel_ready_timeout and login_url_wait must be positive".to_string(),
            ));
        }
        if self.output_chunk_limit == 0 {
            return Err(ConfigError::Invalid(
                "output_chunk_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
