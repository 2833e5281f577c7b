//! tm-orchestrator: Tunnel and deployment orchestrator
//!
//! Supervises `cloudflared` quick tunnel processes, drives the interactive
//! certificate login, provisions named tunnels through either the
//! Cloudflare REST API or `cloudflared` subcommands, and runs uploaded
//! application bundles on local ports so they can be tunnelled.

pub mod accounts;
pub mod cloudflare;
pub mod coordinator;
pub mod deploy;
pub mod error;
pub mod http;
pub mod login;
pub mod named;
pub mod orchestrator;
pub mod patterns;
pub mod ports;
pub mod process;
pub mod projects;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testutil;

pub use coordinator::StoreCoordinator;
pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
