//! tm-core: Core records, store contract and configuration for tunnel-manager
//!
//! This crate provides the shared types used by the orchestrator: the
//! persisted records (tunnels, accounts, projects), the durable record store
//! contract, the request/response command model and configuration loading.

pub mod api;
pub mod config;
pub mod error;
pub mod records;
pub mod store;
pub mod time;
pub mod types;

pub use error::{ConfigError, StoreError};
pub use records::{AccountView, CloudflareAccount, Project, TunnelRecord};
pub use store::{Collection, JsonFileStore, MemoryStore, RecordStore};
pub use types::{
    AccountId, AccountStatus, AuthType, DeploymentId, LoginSessionId, ProjectId, ProxyRotation,
    ProxyType, RuntimeType, TunnelId, TunnelStatus, TunnelType,
};
