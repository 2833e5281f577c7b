//! Named tunnels through `cloudflared` and an origin certificate

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use tm_core::CloudflareAccount;

use super::{NamedTunnelRequest, ProvisionStrategy, ProvisionedTunnel};
use crate::cloudflare::find_domain_for_hostname;
use crate::error::{OrchestratorError, Result, Stage};
use crate::login::cert_present;
use crate::patterns::extract_tunnel_uuid;
use crate::process::{ProcessSupervisor, SpawnSpec};

/// Output characters kept in a failed subcommand's error detail
const DETAIL_LIMIT: usize = 2000;

/// Runs `tunnel create` and `tunnel route dns` against the account's certificate
pub struct CertificateStrategy {
    supervisor: Arc<ProcessSupervisor>,
    cloudflared_bin: String,
}

impl CertificateStrategy {
    pub fn new(supervisor: Arc<ProcessSupervisor>, cloudflared_bin: impl Into<String>) -> Self {
        Self {
            supervisor,
            cloudflared_bin: cloudflared_bin.into(),
        }
    }

    async fn run(&self, stage: Stage, cert: &Path, args: &[&str]) -> Result<String> {
        let spec = SpawnSpec::new(&self.cloudflared_bin)
            .arg("tunnel")
            .arg("--origincert")
            .arg(cert.to_string_lossy())
            .args(args.iter().copied());
        let (exit, output) = self.supervisor.run_to_completion(spec).await?;
        if !exit.success() {
            return Err(OrchestratorError::Cli {
                stage,
                detail: failure_detail(exit.code, &output),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl ProvisionStrategy for CertificateStrategy {
    async fn provision(
        &self,
        account: &CloudflareAccount,
        request: &NamedTunnelRequest,
    ) -> Result<ProvisionedTunnel> {
        let cert = match account.cert_path.as_deref() {
            Some(cert) if cert_present(cert) => cert,
            _ => return Err(OrchestratorError::AccountNotConnected(account.id.to_string())),
        };

        let domain = find_domain_for_hostname(&request.hostname, &account.domains)
            .ok_or_else(|| OrchestratorError::DomainNotAvailable(request.hostname.clone()))?
            .clone();

        let output = self
            .run(Stage::CreateTunnel, cert, &["create", request.tunnel_name.as_str()])
            .await?;
        let uuid = extract_tunnel_uuid(&output).ok_or_else(|| OrchestratorError::Cli {
            stage: Stage::CreateTunnel,
            detail: format!("no tunnel id in output: {}", truncate(output.trim())),
        })?;
        tracing::debug!("Created tunnel {} ({})", uuid, request.tunnel_name);

        self.run(
            Stage::RouteDns,
            cert,
            &["route", "dns", uuid.as_str(), request.hostname.as_str()],
        )
        .await?;

        Ok(ProvisionedTunnel {
            remote_tunnel_id: uuid,
            hostname: request.hostname.clone(),
            zone_name: domain,
            dns_record_id: None,
        })
    }
}

fn failure_detail(code: Option<i32>, output: &str) -> String {
    let code = code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let output = output.trim();
    if output.is_empty() {
        format!("exited with code {}", code)
    } else {
        format!("exited with code {}: {}", code, truncate(output))
    }
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(DETAIL_LIMIT) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
