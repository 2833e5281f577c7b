//! Saved project snapshots
//!
//! A project is a staged copy of uploaded files kept under
//! `<data_dir>/projects/<id>`. Deployments copy it; they never run from it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use tm_core::api::UploadedFile;
use tm_core::config::OrchestratorConfig;
use tm_core::{Project, ProjectId};

use crate::coordinator::StoreCoordinator;
use crate::deploy::stage_upload;
use crate::error::{OrchestratorError, Result};

pub struct ProjectLibrary {
    coordinator: Arc<StoreCoordinator>,
    projects_dir: PathBuf,
    max_upload_bytes: u64,
}

impl ProjectLibrary {
    pub fn new(coordinator: Arc<StoreCoordinator>, config: &OrchestratorConfig) -> Self {
        Self {
            coordinator,
            projects_dir: config.projects_dir(),
            max_upload_bytes: config.max_upload_bytes,
        }
    }

    /// Stage `files` as a new project
    pub async fn create(
        &self,
        name: &str,
        files: &[UploadedFile],
        startup_script: Option<String>,
    ) -> Result<Project> {
        let name = name.trim();
        if name.is_empty() {
            return Err(OrchestratorError::validation("A project name is required."));
        }
        if files.is_empty() {
            return Err(OrchestratorError::validation(
                "At least one file must be uploaded.",
            ));
        }
        let startup_script = startup_script
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let project = Project {
            id: ProjectId::generate(),
            name: name.to_string(),
            startup_script,
            created_at: Utc::now(),
        };
        let dir = self.dir(&project.id);
        tokio::fs::create_dir_all(&dir).await?;
        if let Err(e) = stage_upload(files, &dir, self.max_upload_bytes).await {
            discard_dir(&dir).await;
            return Err(e);
        }

        let saved = project.clone();
        if let Err(e) = self
            .coordinator
            .update(self.coordinator.projects.as_ref(), |all| {
                all.push(saved);
                Some(())
            })
            .await
        {
            discard_dir(&dir).await;
            return Err(e.into());
        }
        tracing::info!("Saved project {} ({})", project.id, project.name);
        Ok(project)
    }

    pub async fn list(&self) -> Result<Vec<Project>> {
        let mut projects = self.coordinator.load(self.coordinator.projects.as_ref()).await?;
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    pub async fn get(&self, id: &ProjectId) -> Result<Project> {
        self.coordinator
            .load(self.coordinator.projects.as_ref())
            .await?
            .into_iter()
            .find(|p| &p.id == id)
            .ok_or_else(|| OrchestratorError::not_found("project", id))
    }

    /// Remove the record and its files; `false` if it was already gone
    pub async fn delete(&self, id: &ProjectId) -> Result<bool> {
        let removed = self
            .coordinator
            .update(self.coordinator.projects.as_ref(), |all| {
                let before = all.len();
                all.retain(|p| &p.id != id);
                (all.len() != before).then_some(())
            })
            .await?
            .is_some();

        discard_dir(&self.dir(id)).await;
        if removed {
            tracing::info!("Deleted project {}", id);
        }
        Ok(removed)
    }

    fn dir(&self, id: &ProjectId) -> PathBuf {
        self.projects_dir.join(id.as_str())
    }
}

async fn discard_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove project files {:?}: {}", dir, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_config;

    fn library(dir: &Path) -> ProjectLibrary {
        ProjectLibrary::new(Arc::new(StoreCoordinator::in_memory()), &test_config(dir))
    }

    #[tokio::test]
    async fn test_create_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path());

        let project = library
            .create(
                " shop ",
                &[UploadedFile::new("index.php", b"<?php".to_vec())],
                Some("  ".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(project.name, "shop");
        assert!(project.startup_script.is_none());

        let files = dir.path().join("data/projects").join(project.id.as_str());
        assert!(files.join("index.php").is_file());
        assert_eq!(library.list().await.unwrap(), vec![project.clone()]);
        assert_eq!(library.get(&project.id).await.unwrap(), project);

        assert!(library.delete(&project.id).await.unwrap());
        assert!(!files.exists());
        assert!(!library.delete(&project.id).await.unwrap());
        assert!(matches!(
            library.get(&project.id).await,
            Err(OrchestratorError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_staging_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path());
        let err = library
            .create("bad", &[UploadedFile::new("bundle.zip", b"not a zip".to_vec())], None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(library.list().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path().join("data/projects")).unwrap().count(), 0);
    }
}
