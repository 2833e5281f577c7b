//! Ephemeral quick tunnels

mod quick;

pub use quick::{QuickTunnel, TunnelClientManager};
