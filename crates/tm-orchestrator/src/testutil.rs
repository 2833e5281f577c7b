//! Shared helpers for unit tests

use std::path::Path;

use tm_core::config::OrchestratorConfig;

/// Write an executable shell script standing in for an external binary
#[cfg(unix)]
pub fn fake_binary(dir: &Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

/// Config with every directory under `dir` and short timeouts
pub fn test_config(dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        data_dir: dir.join("data"),
        quick_tunnel_ready_timeout: std::time::Duration::from_secs(5),
        login_url_wait: std::time::Duration::from_secs(5),
        deploy_ready_timeout: std::time::Duration::from_secs(2),
        output_chunk_limit: 100,
        ..OrchestratorConfig::default()
    }
}
