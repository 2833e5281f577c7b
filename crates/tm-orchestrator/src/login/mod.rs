//! Interactive `cloudflared` login
//!
//! Session states run `starting -> awaiting_auth -> {connected, error}`.
//! A session is `connected` only when the login process exited cleanly and
//! certificate material is on disk.

mod manager;
mod session;

pub use manager::LoginSessionManager;
pub use session::{cert_present, LoginSession};
