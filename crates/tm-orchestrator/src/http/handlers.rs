//! Request handlers
//!
//! Handlers only translate between HTTP and [`Orchestrator`] calls; every
//! rule lives behind the facade.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use tm_core::api::{
    AccountRegistration, CampaignDeletion, CampaignSummary, CreateTunnelsRequest,
    CreateTunnelsResponse, DeployRequest, DeploySource, DeploymentInfo, LoginPoll, LoginSnapshot,
    UploadedFile,
};
use tm_core::{AccountId, AccountView, DeploymentId, Project, ProjectId, TunnelId, TunnelRecord};

use super::error::HttpError;
use crate::error::OrchestratorError;
use crate::named::ProvisionedTunnel;
use crate::orchestrator::Orchestrator;

type AppState = State<Arc<Orchestrator>>;
type HttpResult<T> = std::result::Result<T, HttpError>;

/// Fields of an upload form
#[derive(Debug, Default)]
struct UploadForm {
    files: Vec<UploadedFile>,
    startup_command: Option<String>,
    project_id: Option<ProjectId>,
    name: Option<String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> HttpResult<Self> {
        let mut form = UploadForm::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| HttpError::bad_request(format!("Failed to read multipart field: {}", e)))?
        {
            let name = field.name().unwrap_or_default().to_string();
            let file_name = field.file_name().map(str::to_string);
            let data = field
                .bytes()
                .await
                .map_err(|e| HttpError::bad_request(format!("Failed to read field data: {}", e)))?;

            match name.as_str() {
                "files" => {
                    let file_name = file_name.unwrap_or_else(|| "upload".to_string());
                    form.files.push(UploadedFile::new(file_name, data.to_vec()));
                }
                "startupCommand" | "startupScript" => {
                    form.startup_command = non_blank(text(&name, &data)?);
                }
                "projectId" => {
                    form.project_id = non_blank(text(&name, &data)?).map(ProjectId::new);
                }
                "name" => form.name = non_blank(text(&name, &data)?),
                _ => tracing::warn!("Ignoring unknown multipart field: {}", name),
            }
        }
        Ok(form)
    }

    /// Deploy request from the form: a project id wins over uploaded files
    fn into_deploy_request(self) -> DeployRequest {
        let source = match self.project_id {
            Some(project_id) => DeploySource::Project { project_id },
            None => DeploySource::Upload { files: self.files },
        };
        DeployRequest {
            source,
            startup_command: self.startup_command,
        }
    }
}

fn text(field: &str, data: &Bytes) -> HttpResult<String> {
    std::str::from_utf8(data)
        .map(str::to_string)
        .map_err(|_| HttpError::bad_request(format!("Field {} must be UTF-8 text", field)))
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub async fn health(State(orchestrator): AppState) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "processes": orchestrator.supervisor().len(),
    }))
}

// Tunnels

pub async fn list_tunnels(State(orchestrator): AppState) -> HttpResult<Json<Vec<TunnelRecord>>> {
    Ok(Json(orchestrator.list_tunnels().await?))
}

pub async fn create_tunnels(
    State(orchestrator): AppState,
    Json(request): Json<CreateTunnelsRequest>,
) -> HttpResult<(StatusCode, Json<CreateTunnelsResponse>)> {
    // Runs to completion even if the client disconnects
    let response = tokio::spawn(async move { orchestrator.create_tunnels(request).await })
        .await
        .map_err(|e| OrchestratorError::Io(std::io::Error::other(e)))??;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn delete_tunnel(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> HttpResult<Json<Value>> {
    let removed = orchestrator.delete_tunnel(&TunnelId::new(id)).await?;
    Ok(Json(json!({ "removed": removed })))
}

pub async fn list_campaigns(State(orchestrator): AppState) -> HttpResult<Json<Vec<CampaignSummary>>> {
    Ok(Json(orchestrator.list_campaigns().await?))
}

pub async fn delete_campaign(
    State(orchestrator): AppState,
    Path(name): Path<String>,
) -> HttpResult<Json<CampaignDeletion>> {
    Ok(Json(orchestrator.delete_campaign(&name).await?))
}

// Deployments

pub async fn list_deployments(State(orchestrator): AppState) -> Json<Vec<DeploymentInfo>> {
    Json(orchestrator.list_deployments().await)
}

pub async fn create_deployment(
    State(orchestrator): AppState,
    multipart: Multipart,
) -> HttpResult<(StatusCode, Json<DeploymentInfo>)> {
    let request = UploadForm::read(multipart).await?.into_deploy_request();
    let info = orchestrator.deploy(request).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn get_deployment(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> HttpResult<Json<DeploymentInfo>> {
    Ok(Json(orchestrator.get_deployment(&DeploymentId::new(id)).await?))
}

pub async fn replace_deployment(
    State(orchestrator): AppState,
    Path(id): Path<String>,
    multipart: Multipart,
) -> HttpResult<Json<DeploymentInfo>> {
    let request = UploadForm::read(multipart).await?.into_deploy_request();
    let info = orchestrator
        .replace_deployment(&DeploymentId::new(id), request)
        .await?;
    Ok(Json(info))
}

pub async fn list_deployment_files(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> HttpResult<Json<Vec<String>>> {
    Ok(Json(
        orchestrator
            .list_deployment_files(&DeploymentId::new(id))
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub path: String,
}

pub async fn read_deployment_file(
    State(orchestrator): AppState,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
) -> HttpResult<impl IntoResponse> {
    let contents = orchestrator
        .read_deployment_file(&DeploymentId::new(id), &query.path)
        .await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        contents,
    ))
}

pub async fn write_deployment_file(
    State(orchestrator): AppState,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
    body: Bytes,
) -> HttpResult<StatusCode> {
    orchestrator
        .write_deployment_file(&DeploymentId::new(id), &query.path, &body)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// Accounts

pub async fn list_accounts(State(orchestrator): AppState) -> HttpResult<Json<Vec<AccountView>>> {
    Ok(Json(orchestrator.list_accounts().await?))
}

pub async fn register_account(
    State(orchestrator): AppState,
    Json(registration): Json<AccountRegistration>,
) -> HttpResult<(StatusCode, Json<AccountView>)> {
    let view = orchestrator.register_account(registration).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn delete_account(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> HttpResult<Json<Value>> {
    let removed = orchestrator.delete_account(&AccountId::new(id)).await?;
    Ok(Json(json!({ "removed": removed })))
}

pub async fn revalidate_account(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> HttpResult<Json<AccountView>> {
    Ok(Json(orchestrator.revalidate_account(&AccountId::new(id)).await?))
}

pub async fn account_domains(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> HttpResult<Json<Vec<String>>> {
    Ok(Json(orchestrator.account_domains(&AccountId::new(id)).await?))
}

#[derive(Debug, Deserialize)]
pub struct DomainBody {
    pub domain: String,
}

pub async fn add_account_domain(
    State(orchestrator): AppState,
    Path(id): Path<String>,
    Json(body): Json<DomainBody>,
) -> HttpResult<Json<AccountView>> {
    Ok(Json(
        orchestrator
            .add_account_domain(&AccountId::new(id), &body.domain)
            .await?,
    ))
}

pub async fn start_login(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> HttpResult<(StatusCode, Json<LoginSnapshot>)> {
    let snapshot = orchestrator.start_login(&AccountId::new(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

pub async fn poll_login(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> HttpResult<Json<LoginPoll>> {
    Ok(Json(orchestrator.poll_login(&AccountId::new(id)).await?))
}

#[derive(Debug, Deserialize)]
pub struct NamedTunnelBody {
    pub hostname: String,
}

pub async fn create_named_tunnel(
    State(orchestrator): AppState,
    Path(id): Path<String>,
    Json(body): Json<NamedTunnelBody>,
) -> HttpResult<(StatusCode, Json<ProvisionedTunnel>)> {
    let provisioned = orchestrator
        .create_named_tunnel(&AccountId::new(id), &body.hostname)
        .await?;
    Ok((StatusCode::CREATED, Json(provisioned)))
}

// Projects

pub async fn list_projects(State(orchestrator): AppState) -> HttpResult<Json<Vec<Project>>> {
    Ok(Json(orchestrator.list_projects().await?))
}

pub async fn create_project(
    State(orchestrator): AppState,
    multipart: Multipart,
) -> HttpResult<(StatusCode, Json<Project>)> {
    let form = UploadForm::read(multipart).await?;
    let name = form
        .name
        .ok_or_else(|| HttpError::bad_request("A project name is required."))?;
    let project = orchestrator
        .create_project(&name, &form.files, form.startup_command)
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn delete_project(
    State(orchestrator): AppState,
    Path(id): Path<String>,
) -> HttpResult<Json<Value>> {
    let removed = orchestrator.delete_project(&ProjectId::new(id)).await?;
    Ok(Json(json!({ "removed": removed })))
}
