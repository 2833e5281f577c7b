//! Deployment runtime
//!
//! Each deployment owns a base directory under the deployments root and at
//! most one supervised process. The port is allocated once and kept for the
//! life of the deployment, so replacing the code never changes its URL.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use tm_core::api::{DeploySource, DeploymentInfo};
use tm_core::config::OrchestratorConfig;
use tm_core::{DeploymentId, ProjectId, RuntimeType};

use super::archive::{copy_tree, resolve_app_root, stage_upload};
use super::paths::{ensure_contained, join_within};
use super::runtime::{plan_launch, RuntimeBinaries, BIND_HOST};
use crate::error::{OrchestratorError, Result, Stage};
use crate::ports::{allocate_port, is_listening};
use crate::process::{ProcessEvent, ProcessId, ProcessSupervisor};

/// Output chunks included when a launch fails
const FAILURE_TAIL: usize = 20;

/// Interval between readiness checks
const READY_POLL: Duration = Duration::from_millis(100);

/// A staged, running application
#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: DeploymentId,
    pub base_dir: PathBuf,
    pub root_dir: PathBuf,
    pub port: u16,
    pub process_id: ProcessId,
    pub pid: Option<u32>,
    pub startup_command: Option<String>,
    pub runtime_type: RuntimeType,
    pub command_line: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn target_url(&self) -> String {
        format!("http://{}:{}", BIND_HOST, self.port)
    }

    pub fn info(&self) -> DeploymentInfo {
        DeploymentInfo {
            id: self.id.clone(),
            port: self.port,
            target_url: self.target_url(),
            runtime_type: self.runtime_type,
            startup_command: self.startup_command.clone(),
            command_line: self.command_line.clone(),
            root_dir: self.root_dir.to_string_lossy().into_owned(),
            process_id: self.process_id,
            pid: self.pid,
        }
    }

    fn apply(&mut self, launched: Launched) {
        self.root_dir = launched.root_dir;
        self.process_id = launched.process_id;
        self.pid = launched.pid;
        self.runtime_type = launched.runtime_type;
        self.command_line = launched.command_line;
        self.updated_at = Utc::now();
    }
}

/// Result of launching into a staged root
struct Launched {
    root_dir: PathBuf,
    process_id: ProcessId,
    pid: Option<u32>,
    runtime_type: RuntimeType,
    command_line: String,
}

/// Stages, runs, replaces and tears down deployments
pub struct DeploymentRuntime {
    supervisor: Arc<ProcessSupervisor>,
    deployments: DashMap<DeploymentId, Arc<Mutex<Deployment>>>,
    deployments_dir: PathBuf,
    projects_dir: PathBuf,
    binaries: RuntimeBinaries,
    ready_timeout: Duration,
    max_read_bytes: u64,
    max_upload_bytes: u64,
}

impl DeploymentRuntime {
    pub fn new(supervisor: Arc<ProcessSupervisor>, config: &OrchestratorConfig) -> Self {
        Self {
            supervisor,
            deployments: DashMap::new(),
            deployments_dir: config.deployments_dir(),
            projects_dir: config.projects_dir(),
            binaries: RuntimeBinaries::from_config(config),
            ready_timeout: config.deploy_ready_timeout,
            max_read_bytes: config.max_read_bytes,
            max_upload_bytes: config.max_upload_bytes,
        }
    }

    /// Stage `source` into a fresh directory and start it on a new port
    pub async fn deploy(
        &self,
        source: &DeploySource,
        startup_command: Option<String>,
    ) -> Result<DeploymentInfo> {
        let id = DeploymentId::generate();
        let base_dir = self.deployments_dir.join(id.as_str());
        tracing::info!("Creating deployment {} in {:?}", id, base_dir);

        let result = async {
            self.stage(source, &base_dir).await?;
            let port = allocate_port().await?;
            let launched = self
                .launch(&id, &base_dir, port, startup_command.as_deref())
                .await?;
            Ok::<_, OrchestratorError>((port, launched))
        }
        .await;

        let (port, launched) = match result {
            Ok(ok) => ok,
            Err(e) => {
                tracing::error!("Deployment {} failed: {}", id, e);
                remove_dir(&base_dir).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let deployment = Deployment {
            id: id.clone(),
            base_dir,
            root_dir: launched.root_dir,
            port,
            process_id: launched.process_id,
            pid: launched.pid,
            startup_command,
            runtime_type: launched.runtime_type,
            command_line: launched.command_line,
            created_at: now,
            updated_at: now,
        };
        let info = deployment.info();
        self.deployments.insert(id, Arc::new(Mutex::new(deployment)));
        tracing::info!("Deployment {} serving at {}", info.id, info.target_url);
        Ok(info)
    }

    /// Swap a deployment's files and process, keeping its id and port
    ///
    /// Without a new startup command the previous one is reused. The new
    /// source is staged and checked beside the running version first; a
    /// rejected source leaves the deployment untouched, and a failed launch
    /// puts the previous files and process back.
    pub async fn replace(
        &self,
        id: &DeploymentId,
        source: &DeploySource,
        startup_command: Option<String>,
    ) -> Result<DeploymentInfo> {
        let entry = self.entry(id)?;
        let mut deployment = entry.lock().await;
        tracing::info!("Replacing deployment {} on port {}", id, deployment.port);

        let base_dir = deployment.base_dir.clone();
        let staging = sibling_dir(&base_dir, "staging");
        let previous = sibling_dir(&base_dir, "previous");
        remove_dir(&staging).await;
        remove_dir(&previous).await;

        let startup_command = startup_command.or_else(|| deployment.startup_command.clone());
        if let Err(e) = self
            .prepare(source, &staging, deployment.port, startup_command.as_deref())
            .await
        {
            tracing::warn!("Rejected replacement for deployment {}: {}", id, e);
            remove_dir(&staging).await;
            return Err(e);
        }

        if self.supervisor.terminate(deployment.process_id).await.is_some() {
            tracing::debug!("Stopped previous process {} of deployment {}", deployment.process_id, id);
        }

        if let Err(e) = swap_dirs(&base_dir, &staging, &previous).await {
            tracing::error!("Failed to swap files of deployment {}: {}", id, e);
            remove_dir(&staging).await;
            self.relaunch(&mut deployment).await;
            return Err(e.into());
        }

        match self
            .launch(id, &base_dir, deployment.port, startup_command.as_deref())
            .await
        {
            Ok(launched) => {
                remove_dir(&previous).await;
                deployment.apply(launched);
                deployment.startup_command = startup_command;
                Ok(deployment.info())
            }
            Err(e) => {
                tracing::error!("Replacement of deployment {} failed, restoring: {}", id, e);
                remove_dir(&base_dir).await;
                match tokio::fs::rename(&previous, &base_dir).await {
                    Ok(()) => self.relaunch(&mut deployment).await,
                    Err(restore) => tracing::error!(
                        "Could not restore files of deployment {} from {:?}: {}",
                        id,
                        previous,
                        restore
                    ),
                }
                Err(e)
            }
        }
    }

    /// Read a file relative to the application root
    pub async fn read_file(&self, id: &DeploymentId, relative: &str) -> Result<Vec<u8>> {
        let root = self.root_dir(id).await?;
        let path = join_within(&root, relative)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(OrchestratorError::not_found("file", relative));
        }
        let resolved = ensure_contained(&root, &path, relative).await?;

        let size = tokio::fs::metadata(&resolved).await?.len();
        if size > self.max_read_bytes {
            return Err(OrchestratorError::FileTooLarge {
                size,
                limit: self.max_read_bytes,
            });
        }
        Ok(tokio::fs::read(&resolved).await?)
    }

    /// Write a file relative to the application root, creating parents
    pub async fn write_file(&self, id: &DeploymentId, relative: &str, contents: &[u8]) -> Result<()> {
        let root = self.root_dir(id).await?;
        let path = join_within(&root, relative)?;
        let parent = path
            .parent()
            .ok_or_else(|| OrchestratorError::PathEscape(relative.to_string()))?;

        tokio::fs::create_dir_all(parent).await?;
        ensure_contained(&root, parent, relative).await?;
        if tokio::fs::symlink_metadata(&path)
            .await
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
        {
            ensure_contained(&root, &path, relative).await?;
        }

        tokio::fs::write(&path, contents).await?;
        tracing::debug!("Wrote {} bytes to {} in deployment {}", contents.len(), relative, id);
        Ok(())
    }

    /// Regular files under the application root, relative and sorted
    pub async fn list_files(&self, id: &DeploymentId) -> Result<Vec<String>> {
        let root = self.root_dir(id).await?;
        let mut files = Vec::new();
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Ok(relative) = path.strip_prefix(&root) {
                        files.push(relative.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Kill the process and remove the directory
    ///
    /// Returns `false` for unknown ids, so repeated teardown is harmless.
    pub async fn destroy(&self, id: &DeploymentId) -> bool {
        let Some((_, entry)) = self.deployments.remove(id) else {
            return false;
        };
        let deployment = entry.lock().await;
        tracing::info!("Destroying deployment {}", id);
        self.supervisor.terminate(deployment.process_id).await;
        remove_dir(&deployment.base_dir).await;
        true
    }

    pub async fn get(&self, id: &DeploymentId) -> Option<DeploymentInfo> {
        let entry = self.deployments.get(id).map(|e| Arc::clone(&e))?;
        let deployment = entry.lock().await;
        Some(deployment.info())
    }

    pub async fn list(&self) -> Vec<DeploymentInfo> {
        let entries: Vec<_> = self.deployments.iter().map(|e| Arc::clone(&e)).collect();
        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            infos.push(entry.lock().await.info());
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.deployments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty()
    }

    fn entry(&self, id: &DeploymentId) -> Result<Arc<Mutex<Deployment>>> {
        self.deployments
            .get(id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| OrchestratorError::not_found("deployment", id))
    }

    async fn root_dir(&self, id: &DeploymentId) -> Result<PathBuf> {
        let entry = self.entry(id)?;
        let root = entry.lock().await.root_dir.clone();
        Ok(root)
    }

    /// Materialize `source` into a new `base_dir`
    async fn stage(&self, source: &DeploySource, base_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(base_dir).await?;
        match source {
            DeploySource::Upload { files } => {
                let written = stage_upload(files, base_dir, self.max_upload_bytes).await?;
                tracing::debug!("Staged {} uploaded file(s) into {:?}", written, base_dir);
            }
            DeploySource::Project { project_id } => {
                let project_dir = self.project_dir(project_id);
                if !tokio::fs::try_exists(&project_dir).await? {
                    return Err(OrchestratorError::not_found("project", project_id));
                }
                copy_tree(&project_dir, base_dir)
                    .await
                    .map_err(|e| OrchestratorError::Deployment {
                        stage: Stage::Stage,
                        detail: format!("copying project {}: {}", project_id, e),
                    })?;
            }
        }
        Ok(())
    }

    /// Stage into `dir` and check it can be launched, without starting anything
    async fn prepare(
        &self,
        source: &DeploySource,
        dir: &Path,
        port: u16,
        startup_command: Option<&str>,
    ) -> Result<()> {
        self.stage(source, dir).await?;
        let root_dir = resolve_app_root(dir).await?;
        plan_launch(&root_dir, port, startup_command, &self.binaries)?;
        Ok(())
    }

    /// Start the deployment's current files again with its current command
    async fn relaunch(&self, deployment: &mut Deployment) {
        let launched = self
            .launch(
                &deployment.id,
                &deployment.base_dir,
                deployment.port,
                deployment.startup_command.as_deref(),
            )
            .await;
        match launched {
            Ok(launched) => {
                deployment.apply(launched);
                tracing::info!("Deployment {} restored on port {}", deployment.id, deployment.port);
            }
            Err(e) => tracing::error!("Deployment {} could not be restarted: {}", deployment.id, e),
        }
    }

    fn project_dir(&self, project_id: &ProjectId) -> PathBuf {
        self.projects_dir.join(project_id.as_str())
    }

    async fn launch(
        &self,
        id: &DeploymentId,
        base_dir: &Path,
        port: u16,
        startup_command: Option<&str>,
    ) -> Result<Launched> {
        let root_dir = resolve_app_root(base_dir).await?;
        let plan = plan_launch(&root_dir, port, startup_command, &self.binaries)?;
        let command_line = plan.spec.command_line();
        tracing::info!(
            "Deployment {} runtime {} on port {}: {}",
            id,
            plan.runtime_type,
            port,
            command_line
        );

        let mut handle = self
            .supervisor
            .spawn(plan.spec)
            .map_err(|e| OrchestratorError::Deployment {
                stage: Stage::Launch,
                detail: e.to_string(),
            })?;
        self.wait_ready(id, port, &mut handle.events).await?;
        log_exit(id.clone(), handle.id, handle.events);

        Ok(Launched {
            root_dir,
            process_id: handle.id,
            pid: handle.pid,
            runtime_type: plan.runtime_type,
            command_line,
        })
    }

    /// Wait for the port to accept connections
    ///
    /// A process that exits first fails the launch; running past the
    /// timeout without listening only logs a warning.
    async fn wait_ready(
        &self,
        id: &DeploymentId,
        port: u16,
        events: &mut mpsc::UnboundedReceiver<ProcessEvent>,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        let mut output: Vec<String> = Vec::new();

        loop {
            if is_listening(port).await {
                tracing::debug!("Deployment {} accepting connections on {}", id, port);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "Deployment {} not accepting connections on {} after {:?}",
                    id,
                    port,
                    self.ready_timeout
                );
                return Ok(());
            }

            let tick = tokio::time::sleep(READY_POLL);
            tokio::pin!(tick);
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(ProcessEvent::Output(chunk)) => {
                            output.push(chunk);
                            if output.len() > FAILURE_TAIL {
                                output.remove(0);
                            }
                        }
                        Some(ProcessEvent::Exited(info)) => {
                            let code = info
                                .code
                                .map(|c| c.to_string())
                                .unwrap_or_else(|| "unknown".to_string());
                            let tail = output.concat();
                            return Err(OrchestratorError::Deployment {
                                stage: Stage::Launch,
                                detail: if tail.trim().is_empty() {
                                    format!("process exited with code {}", code)
                                } else {
                                    format!("process exited with code {}: {}", code, tail.trim())
                                },
                            });
                        }
                        None => {
                            return Err(OrchestratorError::Deployment {
                                stage: Stage::Launch,
                                detail: "process exited".to_string(),
                            });
                        }
                    },
                    _ = &mut tick => break,
                }
            }
        }
    }
}

fn log_exit(id: DeploymentId, process_id: ProcessId, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ProcessEvent::Exited(info) = event {
                tracing::info!(
                    "Deployment {} process {} exited (code {:?}, signal {:?})",
                    id,
                    process_id,
                    info.code,
                    info.signal
                );
            }
        }
    });
}

/// `<deployments>/<id>.<suffix>`, next to the deployment's own directory
fn sibling_dir(base_dir: &Path, suffix: &str) -> PathBuf {
    let mut name = base_dir.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    base_dir.with_file_name(name)
}

/// Move `current` to `previous` and `staged` into its place
async fn swap_dirs(current: &Path, staged: &Path, previous: &Path) -> std::io::Result<()> {
    let had_current = tokio::fs::try_exists(current).await?;
    if had_current {
        tokio::fs::rename(current, previous).await?;
    }
    if let Err(e) = tokio::fs::rename(staged, current).await {
        if had_current {
            if let Err(back) = tokio::fs::rename(previous, current).await {
                tracing::warn!("Failed to move {:?} back to {:?}: {}", previous, current, back);
            }
        }
        return Err(e);
    }
    Ok(())
}

async fn remove_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {:?}: {}", dir, e);
        }
    }
}
