//! HTTP surface
//!
//! A thin JSON API over [`Orchestrator`]. There is no authentication layer;
//! bind it to a trusted interface.

mod error;
mod handlers;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::orchestrator::Orchestrator;

pub use error::{status_for, ErrorBody, HttpError};

type ApiRouter = Router<Arc<Orchestrator>>;

/// Multipart overhead allowed on top of the upload limit
const FORM_OVERHEAD: usize = 1024 * 1024;

/// Build the API router
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let body_limit = usize::try_from(orchestrator.config().max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(FORM_OVERHEAD);

    let tunnels: ApiRouter = Router::new()
        .route("/", get(handlers::list_tunnels).post(handlers::create_tunnels))
        .route("/:id", delete(handlers::delete_tunnel));

    let campaigns: ApiRouter = Router::new()
        .route("/", get(handlers::list_campaigns))
        .route("/:name", delete(handlers::delete_campaign));

    let deployments: ApiRouter = Router::new()
        .route("/", get(handlers::list_deployments).post(handlers::create_deployment))
        .route(
            "/:id",
            get(handlers::get_deployment).put(handlers::replace_deployment),
        )
        .route("/:id/files", get(handlers::list_deployment_files))
        .route(
            "/:id/file",
            get(handlers::read_deployment_file).put(handlers::write_deployment_file),
        );

    let accounts: ApiRouter = Router::new()
        .route("/", get(handlers::list_accounts).post(handlers::register_account))
        .route("/:id", delete(handlers::delete_account))
        .route("/:id/validate", post(handlers::revalidate_account))
        .route(
            "/:id/domains",
            get(handlers::account_domains).post(handlers::add_account_domain),
        )
        .route(
            "/:id/login",
            get(handlers::poll_login).post(handlers::start_login),
        )
        .route("/:id/named-tunnels", post(handlers::create_named_tunnel));

    let projects: ApiRouter = Router::new()
        .route("/", get(handlers::list_projects).post(handlers::create_project))
        .route("/:id", delete(handlers::delete_project));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/tunnels", tunnels)
        .nest("/campaigns", campaigns)
        .nest("/deployments", deployments)
        .nest("/accounts", accounts)
        .nest("/projects", projects)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(orchestrator)
}
