//! Orchestrator facade
//!
//! Owns every component and the tables they keep, and implements the
//! operations the HTTP surface exposes. Nothing here is global: a second
//! `Orchestrator` in the same process shares no state with the first.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tm_core::api::{
    AccountRegistration, CampaignDeletion, CampaignSummary, CreateTunnelsRequest,
    CreateTunnelsResponse, DeployRequest, DeploySource, DeploymentInfo, LoginPoll, LoginSnapshot,
    LoginStatus, TunnelMode, TunnelTarget, UploadedFile,
};
use tm_core::config::OrchestratorConfig;
use tm_core::{
    AccountId, AccountStatus, AccountView, AuthType, DeploymentId, LoginSessionId, Project,
    ProjectId, TunnelId, TunnelRecord,
};

use crate::accounts::AccountRegistry;
use crate::cloudflare::CloudflareClient;
use crate::coordinator::StoreCoordinator;
use crate::deploy::DeploymentRuntime;
use crate::error::{OrchestratorError, Result};
use crate::login::{cert_present, LoginSessionManager};
use crate::named::{
    tunnel_name, CertificateStrategy, NamedTunnelProvisioner, NamedTunnelRequest,
    ProvisionedTunnel, TokenStrategy,
};
use crate::process::ProcessSupervisor;
use crate::projects::ProjectLibrary;
use crate::tunnel::TunnelClientManager;

/// Target a batch resolved to, and the deployment it created if any
struct ResolvedTarget {
    target_url: String,
    deployment_id: Option<DeploymentId>,
    created: Option<DeploymentInfo>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    supervisor: Arc<ProcessSupervisor>,
    coordinator: Arc<StoreCoordinator>,
    tunnels: TunnelClientManager,
    logins: LoginSessionManager,
    provisioner: NamedTunnelProvisioner,
    deployments: DeploymentRuntime,
    accounts: AccountRegistry,
    projects: ProjectLibrary,
}

impl Orchestrator {
    /// Orchestrator persisting to JSON files under `config.data_dir`
    pub fn new(config: OrchestratorConfig) -> Self {
        let coordinator = Arc::new(StoreCoordinator::json(&config.data_dir));
        Self::with_stores(config, coordinator)
    }

    /// Orchestrator over caller-provided stores
    pub fn with_stores(config: OrchestratorConfig, coordinator: Arc<StoreCoordinator>) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::new(config.output_chunk_limit));
        let client = CloudflareClient::new(&config.api_base_url);
        let provisioner = NamedTunnelProvisioner::new(
            Arc::new(TokenStrategy::new(client.clone(), &config.routing_domain)),
            Arc::new(CertificateStrategy::new(
                Arc::clone(&supervisor),
                &config.cloudflared_bin,
            )),
        );

        Self {
            tunnels: TunnelClientManager::new(Arc::clone(&supervisor), &config),
            logins: LoginSessionManager::new(Arc::clone(&supervisor), &config),
            deployments: DeploymentRuntime::new(Arc::clone(&supervisor), &config),
            accounts: AccountRegistry::new(Arc::clone(&coordinator), client, &config),
            projects: ProjectLibrary::new(Arc::clone(&coordinator), &config),
            provisioner,
            supervisor,
            coordinator,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    // ---------------------------------------------------------------------
    // Tunnels
    // ---------------------------------------------------------------------

    /// Create a campaign of tunnels
    ///
    /// Free tunnels are started one after another and each record is saved
    /// as soon as its tunnel is ready, so an abandoned call leaves nothing
    /// untracked. A failure part way stops the batch: tunnels already
    /// created keep running and the error reports how many exist.
    pub async fn create_tunnels(&self, request: CreateTunnelsRequest) -> Result<CreateTunnelsResponse> {
        request.validate().map_err(OrchestratorError::Validation)?;

        // Named campaigns check the account before anything is started
        let account = match &request.mode {
            TunnelMode::Named { account_id, .. } => {
                let account = self.accounts.get(account_id).await?;
                if !account.is_connected() {
                    return Err(OrchestratorError::AccountNotConnected(account_id.to_string()));
                }
                Some(account)
            }
            TunnelMode::Free => None,
        };

        let target = self.resolve_target(&request.target).await?;
        let campaign = request.campaign_name.trim().to_string();
        let requested = request.effective_count() as usize;
        tracing::info!(
            "Creating {} tunnel(s) for campaign {:?} -> {}",
            requested,
            campaign,
            target.target_url
        );

        let mut created: Vec<TunnelRecord> = Vec::with_capacity(requested);
        let mut failure = None;
        let mut provisioned: Option<ProvisionedTunnel> = None;

        for index in 0..requested {
            let id = TunnelId::generate();
            let result = match (&request.mode, &account) {
                (
                    TunnelMode::Named {
                        account_id,
                        domain_name,
                        ..
                    },
                    Some(account),
                ) => {
                    // One remote tunnel per campaign, however many records
                    let remote = match &provisioned {
                        Some(remote) => Ok(remote.clone()),
                        None => {
                            let hostname = request.mode.full_domain().unwrap_or_default();
                            let named = NamedTunnelRequest {
                                tunnel_name: tunnel_name(&campaign, id_suffix(&id)),
                                hostname,
                            };
                            self.provisioner.provision(account, &named).await
                        }
                    };
                    remote.map(|remote| {
                        let mut record = TunnelRecord::named(
                            id,
                            &campaign,
                            &target.target_url,
                            account_id.clone(),
                            domain_name.trim().trim_end_matches('.').to_lowercase(),
                            &remote.hostname,
                        );
                        record.remote_tunnel_id = Some(remote.remote_tunnel_id.clone());
                        provisioned = Some(remote);
                        record
                    })
                }
                _ => self
                    .tunnels
                    .start(&id, &target.target_url)
                    .await
                    .map(|quick| {
                        let mut record =
                            TunnelRecord::free(id, &campaign, &target.target_url, quick.hostname);
                        record.process_id = Some(quick.process_id);
                        record.pid = quick.pid;
                        record
                    }),
            };

            let result = match result {
                Ok(mut record) => {
                    assign_proxy(&mut record, &request, index);
                    record.deployment_id = target.deployment_id.clone();
                    match self.persist_tunnel(record.clone()).await {
                        Ok(()) => Ok(record),
                        Err(e) => {
                            self.tunnels.stop(&record.id);
                            Err(e)
                        }
                    }
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(record) => {
                    tracing::info!(
                        "Tunnel {}/{} of {:?} ready at {}",
                        index + 1,
                        requested,
                        campaign,
                        record.public_url()
                    );
                    created.push(record);
                }
                Err(e) => {
                    tracing::error!(
                        "Tunnel {}/{} of {:?} failed: {}",
                        index + 1,
                        requested,
                        campaign,
                        e
                    );
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(source) = failure {
            if created.is_empty() {
                if let Some(info) = &target.created {
                    self.deployments.destroy(&info.id).await;
                }
                return Err(source);
            }
            return Err(OrchestratorError::BatchAborted {
                created: created.len(),
                requested,
                source: Box::new(source),
            });
        }

        Ok(CreateTunnelsResponse {
            campaign_name: campaign,
            tunnels: created,
            deployment: target.created,
        })
    }

    async fn resolve_target(&self, target: &TunnelTarget) -> Result<ResolvedTarget> {
        match target {
            TunnelTarget::Url { target_url } => Ok(ResolvedTarget {
                target_url: target_url.trim().to_string(),
                deployment_id: None,
                created: None,
            }),
            TunnelTarget::Deploy(request) => {
                let info = self.deploy(request.clone()).await?;
                Ok(ResolvedTarget {
                    target_url: info.target_url.clone(),
                    deployment_id: Some(info.id.clone()),
                    created: Some(info),
                })
            }
            TunnelTarget::Deployment { deployment_id } => {
                let info = self
                    .deployments
                    .get(deployment_id)
                    .await
                    .ok_or_else(|| OrchestratorError::not_found("deployment", deployment_id))?;
                Ok(ResolvedTarget {
                    target_url: info.target_url,
                    deployment_id: Some(info.id),
                    created: None,
                })
            }
        }
    }

    async fn persist_tunnel(&self, record: TunnelRecord) -> Result<()> {
        self.coordinator
            .update(self.coordinator.tunnels.as_ref(), |all| {
                all.push(record);
                Some(())
            })
            .await?;
        Ok(())
    }

    /// Create a named tunnel outside of any campaign
    pub async fn create_named_tunnel(
        &self,
        account_id: &AccountId,
        hostname: &str,
    ) -> Result<ProvisionedTunnel> {
        let hostname = hostname.trim().trim_end_matches('.').to_lowercase();
        if hostname.is_empty() || !hostname.contains('.') {
            return Err(OrchestratorError::validation(format!(
                "Invalid hostname: {}",
                hostname
            )));
        }
        let account = self.accounts.get(account_id).await?;
        let unique = TunnelId::generate();
        let request = NamedTunnelRequest {
            tunnel_name: tunnel_name(&hostname, id_suffix(&unique)),
            hostname,
        };
        self.provisioner.provision(&account, &request).await
    }

    /// Delete one tunnel; `false` if it did not exist
    ///
    /// Stops the tunnel's process and, when no remaining tunnel points at
    /// it, tears down the deployment it was serving.
    pub async fn delete_tunnel(&self, id: &TunnelId) -> Result<bool> {
        let removed = self.remove_tunnels(|record| &record.id == id).await?;
        Ok(!removed.is_empty())
    }

    /// Delete every tunnel in a campaign
    pub async fn delete_campaign(&self, name: &str) -> Result<CampaignDeletion> {
        let name = name.trim();
        if name.is_empty() {
            return Err(OrchestratorError::validation("A campaign name is required."));
        }
        let removed = self.remove_tunnels(|record| record.campaign_name == name).await?;
        tracing::info!("Deleted campaign {:?} ({} tunnel(s))", name, removed.len());
        Ok(CampaignDeletion {
            name: name.to_string(),
            removed: removed.len(),
        })
    }

    async fn remove_tunnels<F>(&self, matches: F) -> Result<Vec<TunnelRecord>>
    where
        F: Fn(&TunnelRecord) -> bool,
    {
        let _guard = self.coordinator.write().await;
        let all = self.coordinator.tunnels.list().await?;
        let (removed, kept): (Vec<_>, Vec<_>) = all.into_iter().partition(|r| matches(r));
        if removed.is_empty() {
            return Ok(removed);
        }

        for record in &removed {
            if !self.tunnels.stop(&record.id) {
                tracing::debug!("Tunnel {} had no running process", record.id);
            }
        }
        self.coordinator.tunnels.save(&kept).await?;

        let still_used: HashSet<&DeploymentId> =
            kept.iter().filter_map(|r| r.deployment_id.as_ref()).collect();
        let orphaned: HashSet<&DeploymentId> = removed
            .iter()
            .filter_map(|r| r.deployment_id.as_ref())
            .filter(|d| !still_used.contains(d))
            .collect();
        for deployment_id in orphaned {
            self.deployments.destroy(deployment_id).await;
        }

        for record in &removed {
            tracing::info!("Deleted tunnel {} ({})", record.id, record.hostname);
        }
        Ok(removed)
    }

    pub async fn list_tunnels(&self) -> Result<Vec<TunnelRecord>> {
        let mut tunnels = self.coordinator.load(self.coordinator.tunnels.as_ref()).await?;
        tunnels.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tunnels)
    }

    /// Tunnels grouped by campaign name, newest campaign first
    pub async fn list_campaigns(&self) -> Result<Vec<CampaignSummary>> {
        let tunnels = self.coordinator.load(self.coordinator.tunnels.as_ref()).await?;
        let mut campaigns: BTreeMap<String, CampaignSummary> = BTreeMap::new();
        for record in tunnels {
            campaigns
                .entry(record.campaign_name.clone())
                .and_modify(|summary| {
                    summary.tunnel_count += 1;
                    if record.created_at < summary.created_at {
                        summary.created_at = record.created_at;
                    }
                })
                .or_insert_with(|| CampaignSummary {
                    name: record.campaign_name.clone(),
                    tunnel_type: record.tunnel_type,
                    tunnel_count: 1,
                    target_url: record.target_url.clone(),
                    created_at: record.created_at,
                });
        }
        let mut campaigns: Vec<_> = campaigns.into_values().collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.name.cmp(&b.name)));
        Ok(campaigns)
    }

    // ---------------------------------------------------------------------
    // Deployments
    // ---------------------------------------------------------------------

    pub async fn deploy(&self, request: DeployRequest) -> Result<DeploymentInfo> {
        request.validate().map_err(OrchestratorError::Validation)?;
        let startup_command = self.startup_command_for(&request).await?;
        self.deployments.deploy(&request.source, startup_command).await
    }

    /// Replace a deployment's code in place; the target URL does not change
    pub async fn replace_deployment(
        &self,
        id: &DeploymentId,
        request: DeployRequest,
    ) -> Result<DeploymentInfo> {
        request.validate().map_err(OrchestratorError::Validation)?;
        let startup_command = self.startup_command_for(&request).await?;
        self.deployments.replace(id, &request.source, startup_command).await
    }

    /// Explicit command, else the saved project's startup script
    async fn startup_command_for(&self, request: &DeployRequest) -> Result<Option<String>> {
        if let Some(command) = &request.startup_command {
            return Ok(Some(command.trim().to_string()));
        }
        match &request.source {
            DeploySource::Project { project_id } => {
                Ok(self.projects.get(project_id).await?.startup_script)
            }
            DeploySource::Upload { .. } => Ok(None),
        }
    }

    pub async fn get_deployment(&self, id: &DeploymentId) -> Result<DeploymentInfo> {
        self.deployments
            .get(id)
            .await
            .ok_or_else(|| OrchestratorError::not_found("deployment", id))
    }

    pub async fn list_deployments(&self) -> Vec<DeploymentInfo> {
        self.deployments.list().await
    }

    pub async fn read_deployment_file(&self, id: &DeploymentId, path: &str) -> Result<Vec<u8>> {
        self.deployments.read_file(id, path).await
    }

    pub async fn write_deployment_file(
        &self,
        id: &DeploymentId,
        path: &str,
        contents: &[u8],
    ) -> Result<()> {
        self.deployments.write_file(id, path, contents).await
    }

    pub async fn list_deployment_files(&self, id: &DeploymentId) -> Result<Vec<String>> {
        self.deployments.list_files(id).await
    }

    // ---------------------------------------------------------------------
    // Accounts and login
    // ---------------------------------------------------------------------

    pub async fn register_account(&self, registration: AccountRegistration) -> Result<AccountView> {
        self.accounts.register(registration).await
    }

    pub async fn revalidate_account(&self, id: &AccountId) -> Result<AccountView> {
        self.accounts.revalidate(id).await
    }

    pub async fn list_accounts(&self) -> Result<Vec<AccountView>> {
        self.accounts.list().await
    }

    pub async fn account_domains(&self, id: &AccountId) -> Result<Vec<String>> {
        self.accounts.domains(id).await
    }

    pub async fn add_account_domain(&self, id: &AccountId, domain: &str) -> Result<AccountView> {
        self.accounts.add_domain(id, domain).await
    }

    pub async fn delete_account(&self, id: &AccountId) -> Result<bool> {
        self.accounts.remove(id).await
    }

    /// Start an interactive `cloudflared` login for a certificate account
    pub async fn start_login(&self, account_id: &AccountId) -> Result<LoginSnapshot> {
        let account = self.accounts.get(account_id).await?;
        if account.auth_type != AuthType::Cloudflared {
            return Err(OrchestratorError::validation(
                "Only cloudflared accounts use the login flow.",
            ));
        }

        let session_id = LoginSessionId::generate();
        let cert_path = self.accounts.cert_path(&account);
        self.accounts
            .mark_login_started(account_id, &session_id, cert_path.clone())
            .await?;

        match self.logins.start(session_id, cert_path).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                tracing::error!("Login for account {} failed: {}", account_id, e);
                self.accounts.mark_error(account_id, e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Current login state of an account
    ///
    /// The certificate check is reported separately from the session. A
    /// connected session, or a certificate found with no tracked session,
    /// marks the account connected.
    pub async fn poll_login(&self, account_id: &AccountId) -> Result<LoginPoll> {
        let account = self.accounts.get(account_id).await?;
        let session = account
            .last_login_session_id
            .as_ref()
            .and_then(|id| self.logins.status(id));
        let cert_present = account.cert_path.as_deref().is_some_and(cert_present);

        let view = match session.as_ref().map(|s| (s.status, s.error.clone())) {
            Some((LoginStatus::Connected, _)) | None
                if (session.is_some() || cert_present)
                    && account.status != AccountStatus::Connected =>
            {
                self.accounts.mark_connected(account_id).await?
            }
            Some((LoginStatus::Error, error)) if account.status != AccountStatus::Error => {
                let message = error.unwrap_or_else(|| "cloudflared login failed.".to_string());
                self.accounts.mark_error(account_id, message).await?
            }
            _ => account.view(),
        };

        Ok(LoginPoll {
            session,
            cert_present,
            account: view,
        })
    }

    // ---------------------------------------------------------------------
    // Projects
    // ---------------------------------------------------------------------

    pub async fn create_project(
        &self,
        name: &str,
        files: &[UploadedFile],
        startup_script: Option<String>,
    ) -> Result<Project> {
        self.projects.create(name, files, startup_script).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.projects.list().await
    }

    pub async fn delete_project(&self, id: &ProjectId) -> Result<bool> {
        self.projects.delete(id).await
    }

    /// Kill every supervised process
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

/// Record proxy metadata for the tunnel at `index` within its batch
fn assign_proxy(record: &mut TunnelRecord, request: &CreateTunnelsRequest, index: usize) {
    let proxies: Vec<String> = request.proxies.iter().map(|p| p.trim().to_string()).collect();
    if let Some(proxy) = request.proxy_rotation.pick(&proxies, index) {
        record.proxy = Some(proxy.clone());
        record.proxy_type = Some(request.proxy_type.unwrap_or_default());
        record.proxy_rotation = Some(request.proxy_rotation);
    }
}

/// Random part of a generated id
fn id_suffix(id: &TunnelId) -> &str {
    id.as_str().rsplit('_').next().unwrap_or(id.as_str())
}
