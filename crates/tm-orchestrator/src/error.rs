//! Orchestrator error taxonomy
//!
//! Every component returns [`OrchestratorError`]. Variants are grouped by
//! class: validation, not-found, security boundary, and external resource
//! failures (which carry the underlying tool's message as detail).

use thiserror::Error;

use tm_core::{AccountView, StoreError};

use crate::cloudflare::ApiError;

/// Result alias used across the orchestrator
pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// Pipeline stage a named-tunnel or deployment operation reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CreateTunnel,
    RouteDns,
    Stage,
    Detect,
    Launch,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::CreateTunnel => "create tunnel",
            Stage::RouteDns => "route dns",
            Stage::Stage => "stage files",
            Stage::Detect => "detect runtime",
            Stage::Launch => "launch",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Bad or missing input, rejected before any side effect
    #[error("{0}")]
    Validation(String),

    /// Unknown id
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Archive entry would land outside the staging directory
    #[error("Unsafe archive: {0}")]
    UnsafeArchive(String),

    /// Relative path escapes the application root
    #[error("Path escapes the application root: {0}")]
    PathEscape(String),

    /// File exceeds the read limit
    #[error("File too large to read: {size} bytes (limit {limit})")]
    FileTooLarge { size: u64, limit: u64 },

    /// The external process could not be started
    #[error("Failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The tunnel client exited before reporting a hostname
    #[error("Tunnel client exited before a hostname was assigned (code {}, signal {})",
        fmt_opt(.code), fmt_opt(.signal))]
    ProcessExitedBeforeReady {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// The tunnel client never reported a hostname
    #[error("Tunnel client did not report a hostname within {0:?}")]
    ReadyTimeout(std::time::Duration),

    /// Cloudflare REST API failure
    #[error("{0}")]
    CloudflareApi(#[from] ApiError),

    /// A `cloudflared` subcommand failed
    #[error("cloudflared {stage} failed: {detail}")]
    Cli { stage: Stage, detail: String },

    /// Deployment pipeline failure at a given stage
    #[error("Deployment failed at {stage}: {detail}")]
    Deployment { stage: Stage, detail: String },

    /// Account cannot provision named tunnels yet
    #[error("Account {0} is not connected")]
    AccountNotConnected(String),

    /// Requested hostname is not under any zone the account controls
    #[error("Domain not available for this account: {0}")]
    DomainNotAvailable(String),

    /// A batch stopped part way through
    #[error("Created {created} of {requested} tunnels before failing: {source}")]
    BatchAborted {
        created: usize,
        requested: usize,
        #[source]
        source: Box<OrchestratorError>,
    },

    /// Account validation failed; the account was saved in `error` status
    #[error("{source}")]
    AccountValidation {
        account: Box<AccountView>,
        #[source]
        source: Box<OrchestratorError>,
    },

    /// Login flow failure
    #[error("{0}")]
    Login(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_opt(value: &Option<i32>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl OrchestratorError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether this failure came from an external tool or service
    pub fn is_external(&self) -> bool {
        match self {
            Self::Spawn { .. }
            | Self::ProcessExitedBeforeReady { .. }
            | Self::ReadyTimeout(_)
            | Self::CloudflareApi(_)
            | Self::Cli { .. }
            | Self::Deployment { .. }
            | Self::Login(_) => true,
            Self::BatchAborted { source, .. } | Self::AccountValidation { source, .. } => {
                source.is_external()
            }
            _ => false,
        }
    }
}
