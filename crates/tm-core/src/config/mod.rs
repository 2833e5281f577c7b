//! Configuration management for tunnel-manager

mod orchestrator;
pub mod serde_utils;

pub use orchestrator::OrchestratorConfig;

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnel-manager")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Get the default data directory (stores, certificates, deployments)
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnel-manager")
}

/// Load and validate the orchestrator configuration
///
/// Keys missing from the file take their defaults.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Err(e) => {
            return Err(ConfigError::Invalid(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    let config: OrchestratorConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Write the configuration, replacing any previous file in one rename
pub fn save_config(path: &Path, config: &OrchestratorConfig) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, content)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            ConfigError::Invalid(format!("Failed to write {}: {}", path.display(), e))
        })
}
