//! Mapping orchestrator failures onto HTTP responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use tm_core::AccountView;

use crate::error::OrchestratorError;

/// Error body: the message, plus the account when a validation updated it
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested: Option<usize>,
}

/// Handler error wrapping [`OrchestratorError`]
#[derive(Debug)]
pub struct HttpError(pub OrchestratorError);

impl From<OrchestratorError> for HttpError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl HttpError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(OrchestratorError::Validation(message.into()))
    }
}

/// Status code for an orchestrator failure
pub fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::NotFound { .. } => StatusCode::NOT_FOUND,
        OrchestratorError::AccountNotConnected(_) => StatusCode::CONFLICT,
        OrchestratorError::UnsafeArchive(_)
        | OrchestratorError::PathEscape(_)
        | OrchestratorError::FileTooLarge { .. }
        | OrchestratorError::DomainNotAvailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::AccountValidation { source, .. } => status_for(source),
        OrchestratorError::Store(_) | OrchestratorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        other if other.is_external() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }

        let mut body = ErrorBody {
            error: self.0.to_string(),
            account: None,
            created: None,
            requested: None,
        };
        match self.0 {
            OrchestratorError::AccountValidation { account, .. } => {
                body.account = Some(*account);
            }
            OrchestratorError::BatchAborted {
                created, requested, ..
            } => {
                body.created = Some(created);
                body.requested = Some(requested);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudflare::ApiError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&OrchestratorError::validation("bad")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&OrchestratorError::not_found("tunnel", "tnl_x")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&OrchestratorError::PathEscape("../x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&OrchestratorError::AccountNotConnected("acct_a".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&OrchestratorError::CloudflareApi(ApiError::MissingPermissions)),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&OrchestratorError::ProcessExitedBeforeReady {
                code: Some(1),
                signal: None
            }),
            StatusCode::BAD_GATEWAY
        );
    }
}
