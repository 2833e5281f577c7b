//! Runtime detection and launch commands

use std::path::Path;

use tm_core::config::OrchestratorConfig;
use tm_core::RuntimeType;

use crate::error::{OrchestratorError, Result, Stage};
use crate::process::SpawnSpec;

/// Files whose presence marks a script-runtime bundle
pub const SCRIPT_MANIFESTS: &[&str] = &["package.json", "package-lock.json", "yarn.lock", "pnpm-lock.yaml"];

/// Entry files tried in order when no startup command is given
pub const ENTRY_CANDIDATES: &[&str] = &[
    "server.js",
    "app.js",
    "index.js",
    "main.js",
    "src/index.js",
    "src/server.js",
];

/// Interface deployed applications bind to
pub const BIND_HOST: &str = "127.0.0.1";

/// Binaries used to run deployed applications
#[derive(Debug, Clone)]
pub struct RuntimeBinaries {
    pub node: String,
    pub php: String,
    pub shell: String,
}

impl RuntimeBinaries {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            node: config.node_bin.clone(),
            php: config.php_bin.clone(),
            shell: config.shell_bin.clone(),
        }
    }
}

/// How a staged application will be started
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub runtime_type: RuntimeType,
    pub spec: SpawnSpec,
    /// Detected entry file, when one was needed
    pub entry: Option<String>,
}

/// Script runtime if any manifest is present, generic web server otherwise
pub fn detect_runtime(root: &Path) -> RuntimeType {
    if SCRIPT_MANIFESTS.iter().any(|m| root.join(m).is_file()) {
        RuntimeType::Script
    } else {
        RuntimeType::GenericWeb
    }
}

/// First conventional entry file present under `root`
pub fn find_entry(root: &Path) -> Option<&'static str> {
    ENTRY_CANDIDATES
        .iter()
        .copied()
        .find(|candidate| root.join(candidate).is_file())
}

/// Build the command that serves `root` on `port`
///
/// An explicit startup command only applies to script bundles; the generic
/// web server always serves the root directory.
pub fn plan_launch(
    root: &Path,
    port: u16,
    startup_command: Option<&str>,
    bins: &RuntimeBinaries,
) -> Result<LaunchPlan> {
    let runtime_type = detect_runtime(root);
    let base = |command: &str| {
        SpawnSpec::new(command)
            .env("PORT", port.to_string())
            .env("HOST", BIND_HOST)
            .current_dir(root)
    };

    let plan = match runtime_type {
        RuntimeType::Script => match startup_command.map(str::trim).filter(|c| !c.is_empty()) {
            Some(command) => LaunchPlan {
                runtime_type,
                spec: base(bins.shell.as_str()).args(["-c", command]),
                entry: None,
            },
            None => {
                let entry = find_entry(root).ok_or_else(|| OrchestratorError::Deployment {
                    stage: Stage::Detect,
                    detail: format!(
                        "No startup command given and no entry file found (tried {})",
                        ENTRY_CANDIDATES.join(", ")
                    ),
                })?;
                LaunchPlan {
                    runtime_type,
                    spec: base(bins.node.as_str()).arg(entry),
                    entry: Some(entry.to_string()),
                }
            }
        },
        RuntimeType::GenericWeb => {
            if startup_command.is_some() {
                tracing::warn!("Ignoring startup command for generic web bundle at {:?}", root);
            }
            LaunchPlan {
                runtime_type,
                spec: base(bins.php.as_str())
                    .arg("-S")
                    .arg(format!("{}:{}", BIND_HOST, port))
                    .arg("-t")
                    .arg(root.to_string_lossy()),
                entry: None,
            }
        }
    };
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bins() -> RuntimeBinaries {
        RuntimeBinaries {
            node: "node".to_string(),
            php: "php".to_string(),
            shell: "sh".to_string(),
        }
    }

    #[test]
    fn test_php_only_bundle_is_generic_web() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.php"), "<?php").unwrap();

        let plan = plan_launch(dir.path(), 4100, None, &bins()).unwrap();
        assert_eq!(plan.runtime_type, RuntimeType::GenericWeb);
        assert!(plan.entry.is_none());
        assert_eq!(plan.spec.command, "php");
        assert_eq!(
            plan.spec.args,
            vec![
                "-S".to_string(),
                "127.0.0.1:4100".to_string(),
                "-t".to_string(),
                dir.path().to_string_lossy().into_owned()
            ]
        );
    }

    #[test]
    fn test_manifest_with_entry_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/index.js"), "").unwrap();
        std::fs::write(dir.path().join("main.js"), "").unwrap();

        let plan = plan_launch(dir.path(), 4200, None, &bins()).unwrap();
        assert_eq!(plan.runtime_type, RuntimeType::Script);
        assert_eq!(plan.entry.as_deref(), Some("main.js"));
        assert_eq!(plan.spec.args, vec!["main.js".to_string()]);
        assert!(plan.spec.env.contains(&("PORT".to_string(), "4200".to_string())));
    }

    #[test]
    fn test_manifest_without_entry_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("yarn.lock"), "").unwrap();

        let err = plan_launch(dir.path(), 4300, None, &bins()).unwrap_err();
        assert!(matches!(err, OrchestratorError::Deployment { stage: Stage::Detect, .. }));
    }

    #[test]
    fn test_startup_command_skips_entry_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();

        let plan = plan_launch(dir.path(), 4400, Some("npm start"), &bins()).unwrap();
        assert_eq!(plan.spec.command, "sh");
        assert_eq!(plan.spec.args, vec!["-c".to_string(), "npm start".to_string()]);
        assert!(plan.entry.is_none());
    }
}
