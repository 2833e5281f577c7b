//! Cloudflare account registry
//!
//! Token accounts are validated against the REST API on registration and
//! on demand. Certificate accounts start `pending` and are connected by the
//! login flow. A failed validation is persisted as `error` before the
//! failure is returned, so callers see the updated account alongside it.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use tm_core::api::AccountRegistration;
use tm_core::config::OrchestratorConfig;
use tm_core::{
    AccountId, AccountStatus, AccountView, AuthType, CloudflareAccount, LoginSessionId,
};

use crate::cloudflare::CloudflareClient;
use crate::coordinator::StoreCoordinator;
use crate::error::{OrchestratorError, Result};
use crate::login::cert_present;

/// What a successful token check learned about the account
struct TokenCheck {
    zone_names: Vec<String>,
    account_name: String,
}

/// Registers, validates and updates Cloudflare accounts
pub struct AccountRegistry {
    coordinator: Arc<StoreCoordinator>,
    client: CloudflareClient,
    config: OrchestratorConfig,
}

impl AccountRegistry {
    pub fn new(
        coordinator: Arc<StoreCoordinator>,
        client: CloudflareClient,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            coordinator,
            client,
            config: config.clone(),
        }
    }

    /// Register a new account
    ///
    /// Token accounts are checked immediately; a rejected token still
    /// persists the account, in `error` status.
    pub async fn register(&self, registration: AccountRegistration) -> Result<AccountView> {
        registration.validate().map_err(OrchestratorError::Validation)?;

        let id = AccountId::generate();
        let account = match registration {
            AccountRegistration::Token {
                label,
                email,
                account_id,
                api_token,
            } => CloudflareAccount {
                id: id.clone(),
                label: label.trim().to_string(),
                email,
                account_id: Some(account_id.trim().to_string()),
                api_token: Some(api_token.trim().to_string()),
                auth_type: AuthType::Token,
                cert_path: None,
                status: AccountStatus::Pending,
                zone_count: 0,
                domains: Vec::new(),
                last_login_session_id: None,
                last_error: None,
                created_at: Utc::now(),
                updated_at: None,
            },
            AccountRegistration::Cloudflared { label, email } => CloudflareAccount {
                id: id.clone(),
                label: label.trim().to_string(),
                email,
                account_id: None,
                api_token: None,
                auth_type: AuthType::Cloudflared,
                cert_path: Some(self.config.account_cert_path(id.as_str())),
                status: AccountStatus::Pending,
                zone_count: 0,
                domains: Vec::new(),
                last_login_session_id: None,
                last_error: None,
                created_at: Utc::now(),
                updated_at: None,
            },
        };

        tracing::info!(
            "Registering {:?} account {} ({})",
            account.auth_type,
            account.id,
            account.label
        );
        let auth_type = account.auth_type;
        self.coordinator
            .update(self.coordinator.accounts.as_ref(), |all| {
                all.push(account);
                Some(())
            })
            .await?;

        match auth_type {
            AuthType::Token => self.revalidate(&id).await,
            AuthType::Cloudflared => Ok(self.get(&id).await?.view()),
        }
    }

    /// Re-run the connection check for an account
    ///
    /// Token accounts hit the REST API again. Certificate accounts become
    /// `connected` when certificate material is on disk and are otherwise
    /// left unchanged.
    pub async fn revalidate(&self, id: &AccountId) -> Result<AccountView> {
        let account = self.get(id).await?;
        match account.auth_type {
            AuthType::Token => {
                let (Some(token), Some(cf_account_id)) =
                    (account.api_token.as_deref(), account.account_id.as_deref())
                else {
                    return Err(OrchestratorError::validation(
                        "Token account is missing its API token or account id.",
                    ));
                };
                match self.check_token(token, cf_account_id).await {
                    Ok(check) => {
                        tracing::info!(
                            "Account {} connected to {:?} with {} zone(s)",
                            id,
                            check.account_name,
                            check.zone_names.len()
                        );
                        self.modify(id, |account| {
                            account.status = AccountStatus::Connected;
                            account.zone_count = check.zone_names.len();
                            account.domains = check.zone_names;
                            account.last_error = None;
                        })
                        .await
                    }
                    Err(e) => {
                        tracing::error!("Account {} failed validation: {}", id, e);
                        let message = e.to_string();
                        let view = self
                            .modify(id, |account| {
                                account.status = AccountStatus::Error;
                                account.last_error = Some(message);
                            })
                            .await?;
                        Err(OrchestratorError::AccountValidation {
                            account: Box::new(view),
                            source: Box::new(e),
                        })
                    }
                }
            }
            AuthType::Cloudflared => {
                if account.cert_path.as_deref().is_some_and(cert_present) {
                    self.mark_connected(id).await
                } else {
                    Ok(account.view())
                }
            }
        }
    }

    async fn check_token(&self, token: &str, cf_account_id: &str) -> Result<TokenCheck> {
        let status = self.client.verify_token(token).await?;
        if status.status != "active" {
            return Err(OrchestratorError::validation(format!(
                "Cloudflare API token is {}.",
                status.status
            )));
        }
        let details = self.client.account_details(token, cf_account_id).await?;
        let zones = self.client.list_zones(token, cf_account_id).await?;
        Ok(TokenCheck {
            zone_names: zones.into_iter().map(|z| z.name.to_lowercase()).collect(),
            account_name: details.name,
        })
    }

    /// Sanitized views of every account
    pub async fn list(&self) -> Result<Vec<AccountView>> {
        let accounts = self.coordinator.load(self.coordinator.accounts.as_ref()).await?;
        Ok(accounts.iter().map(CloudflareAccount::view).collect())
    }

    /// Full account record, secrets included; never hand this to callers
    pub async fn get(&self, id: &AccountId) -> Result<CloudflareAccount> {
        self.coordinator
            .load(self.coordinator.accounts.as_ref())
            .await?
            .into_iter()
            .find(|a| &a.id == id)
            .ok_or_else(|| OrchestratorError::not_found("account", id))
    }

    /// Domains named tunnels may be created under
    ///
    /// Token accounts list their active zones live; certificate accounts
    /// return the domains registered with [`add_domain`](Self::add_domain).
    pub async fn domains(&self, id: &AccountId) -> Result<Vec<String>> {
        let account = self.get(id).await?;
        match account.auth_type {
            AuthType::Token => {
                if !account.is_connected() {
                    return Err(OrchestratorError::AccountNotConnected(id.to_string()));
                }
                let (Some(token), Some(cf_account_id)) =
                    (account.api_token.as_deref(), account.account_id.as_deref())
                else {
                    return Err(OrchestratorError::AccountNotConnected(id.to_string()));
                };
                let zones = self.client.list_zones(token, cf_account_id).await?;
                Ok(zones.into_iter().map(|z| z.name.to_lowercase()).collect())
            }
            AuthType::Cloudflared => Ok(account.domains),
        }
    }

    /// Register a domain for a certificate account
    pub async fn add_domain(&self, id: &AccountId, domain: &str) -> Result<AccountView> {
        let domain = domain.trim().trim_end_matches('.').to_lowercase();
        let valid = !domain.is_empty()
            && domain.contains('.')
            && domain
                .split('.')
                .all(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
        if !valid {
            return Err(OrchestratorError::validation(format!(
                "Invalid domain name: {}",
                domain
            )));
        }

        let account = self.get(id).await?;
        if account.auth_type != AuthType::Cloudflared {
            return Err(OrchestratorError::validation(
                "Domains are listed from Cloudflare for token accounts.",
            ));
        }

        self.modify(id, |account| {
            if !account.domains.contains(&domain) {
                account.domains.push(domain);
                account.domains.sort();
            }
        })
        .await
    }

    /// Remove an account record
    pub async fn remove(&self, id: &AccountId) -> Result<bool> {
        let removed = self
            .coordinator
            .update(self.coordinator.accounts.as_ref(), |all| {
                let before = all.len();
                all.retain(|a| &a.id != id);
                (all.len() != before).then_some(())
            })
            .await?;
        if removed.is_some() {
            tracing::info!("Removed account {}", id);
        }
        Ok(removed.is_some())
    }

    /// Certificate path used for an account's login
    pub fn cert_path(&self, account: &CloudflareAccount) -> PathBuf {
        account
            .cert_path
            .clone()
            .unwrap_or_else(|| self.config.account_cert_path(account.id.as_str()))
    }

    pub async fn mark_login_started(
        &self,
        id: &AccountId,
        session_id: &LoginSessionId,
        cert_path: PathBuf,
    ) -> Result<AccountView> {
        self.modify(id, |account| {
            account.last_login_session_id = Some(session_id.clone());
            account.cert_path = Some(cert_path);
            account.last_error = None;
            if account.status == AccountStatus::Error {
                account.status = AccountStatus::Pending;
            }
        })
        .await
    }

    pub async fn mark_connected(&self, id: &AccountId) -> Result<AccountView> {
        self.modify(id, |account| {
            account.status = AccountStatus::Connected;
            account.last_error = None;
        })
        .await
    }

    pub async fn mark_error(&self, id: &AccountId, message: impl Into<String>) -> Result<AccountView> {
        let message = message.into();
        self.modify(id, |account| {
            account.status = AccountStatus::Error;
            account.last_error = Some(message);
        })
        .await
    }

    async fn modify<F>(&self, id: &AccountId, apply: F) -> Result<AccountView>
    where
        F: FnOnce(&mut CloudflareAccount),
    {
        self.coordinator
            .update(self.coordinator.accounts.as_ref(), |all| {
                let account = all.iter_mut().find(|a| &a.id == id)?;
                apply(account);
                account.updated_at = Some(Utc::now());
                Some(account.view())
            })
            .await?
            .ok_or_else(|| OrchestratorError::not_found("account", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_config;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok(result: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "success": true, "errors": [], "messages": [], "result": result
        }))
    }

    fn registry(dir: &std::path::Path, base_url: &str) -> AccountRegistry {
        AccountRegistry::new(
            Arc::new(StoreCoordinator::in_memory()),
            CloudflareClient::new(base_url),
            &test_config(dir),
        )
    }

    fn token_registration() -> AccountRegistration {
        AccountRegistration::Token {
            label: "main".to_string(),
            email: None,
            account_id: "cf-acct".to_string(),
            api_token: "tok-123".to_string(),
        }
    }

    #[tokio::test]
    async fn test_token_account_connects_with_zones() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/tokens/verify"))
            .respond_with(ok(json!({"id": "t1", "status": "active"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/accounts/cf-acct"))
            .respond_with(ok(json!({"id": "cf-acct", "name": "Ops"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/accounts/cf-acct/zones"))
            .respond_with(ok(json!([
                {"id": "z1", "name": "example.com"},
                {"id": "z2", "name": "Shop.Example.org"}
            ])))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), &server.uri());
        let view = registry.register(token_registration()).await.unwrap();

        assert_eq!(view.status, AccountStatus::Connected);
        assert_eq!(view.zone_count, 2);
        assert_eq!(view.domains, vec!["example.com", "shop.example.org"]);
        assert!(!serde_json::to_string(&registry.list().await.unwrap()).unwrap().contains("tok-123"));
    }

    #[tokio::test]
    async fn test_rejected_token_is_saved_as_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/tokens/verify"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "success": false, "errors": [{"code": 1000, "message": "Invalid API Token"}], "result": null
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), &server.uri());
        let err = registry.register(token_registration()).await.unwrap_err();

        match err {
            OrchestratorError::AccountValidation { account, source } => {
                assert_eq!(account.status, AccountStatus::Error);
                assert_eq!(account.last_error.as_deref(), Some("Invalid Cloudflare API token."));
                assert_eq!(source.to_string(), "Invalid Cloudflare API token.");
            }
            other => panic!("unexpected error: {other}"),
        }
        let stored = registry.list().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, AccountStatus::Error);
    }

    #[tokio::test]
    async fn test_certificate_account_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), "http://127.0.0.1:9");
        let view = registry
            .register(AccountRegistration::Cloudflared {
                label: "cli".to_string(),
                email: None,
            })
            .await
            .unwrap();
        assert_eq!(view.status, AccountStatus::Pending);
        let cert = view.cert_path.clone().unwrap();
        assert!(cert.ends_with(format!("certs/{}/cert.pem", view.id)));

        // No certificate yet: nothing changes
        assert_eq!(registry.revalidate(&view.id).await.unwrap().status, AccountStatus::Pending);

        std::fs::create_dir_all(cert.parent().unwrap()).unwrap();
        std::fs::write(&cert, "pem").unwrap();
        assert_eq!(registry.revalidate(&view.id).await.unwrap().status, AccountStatus::Connected);

        let view = registry.add_domain(&view.id, "Example.COM.").await.unwrap();
        let view = registry.add_domain(&view.id, "example.com").await.unwrap();
        assert_eq!(view.domains, vec!["example.com"]);
        assert_eq!(registry.domains(&view.id).await.unwrap(), vec!["example.com"]);
        assert!(registry.add_domain(&view.id, "not a domain").await.is_err());

        assert!(registry.remove(&view.id).await.unwrap());
        assert!(!registry.remove(&view.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_registration_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), "http://127.0.0.1:9");
        let err = registry
            .register(AccountRegistration::Token {
                label: "main".to_string(),
                email: None,
                account_id: "cf".to_string(),
                api_token: "  ".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(registry.list().await.unwrap().is_empty());
    }
}
