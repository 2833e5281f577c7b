//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tm_core::config::OrchestratorConfig;
use tm_orchestrator::{Orchestrator, StoreCoordinator};

/// Write an executable shell script standing in for an external binary
#[cfg(unix)]
pub fn fake_binary(dir: &Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("Failed to write fake binary");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to mark fake binary executable");
    path.to_string_lossy().into_owned()
}

/// `cloudflared` stand-in: quick tunnels print a unique hostname and stay
/// up, logins fail without printing a URL
pub const FAKE_CLOUDFLARED: &str = r#"case "$2" in
  --url)
    echo "INF Requesting new quick Tunnel on trycloudflare.com..."
    echo "INF |  https://quick-$$.trycloudflare.com  |" 1>&2
    exec sleep 30
    ;;
  login)
    echo "ERR failed to reach the login service" 1>&2
    exit 3
    ;;
esac
exit 1"#;

/// Config rooted at `dir` with short timeouts
pub fn test_config(dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        data_dir: dir.join("data"),
        quick_tunnel_ready_timeout: Duration::from_secs(5),
        login_url_wait: Duration::from_secs(5),
        deploy_ready_timeout: Duration::from_millis(300),
        output_chunk_limit: 100,
        ..OrchestratorConfig::default()
    }
}

/// Orchestrator over in-memory stores
pub fn orchestrator(config: OrchestratorConfig) -> Orchestrator {
    Orchestrator::with_stores(config, Arc::new(StoreCoordinator::in_memory()))
}
