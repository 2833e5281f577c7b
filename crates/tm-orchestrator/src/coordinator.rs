//! Store coordinator for whole-collection updates
//!
//! Collections are loaded and saved whole, so two concurrent
//! read-modify-write cycles on the same collection would lose one of the
//! writes. The `StoreCoordinator` serializes every update behind a single
//! RwLock; plain reads take the shared side.
//!
//! Operations that touch more than one collection (or a collection and a
//! running resource, like deleting a tunnel and its process) hold the write
//! guard for the whole sequence:
//!
//! ```ignore
//! let _guard = coordinator.write().await;
//! let mut tunnels = coordinator.tunnels.list().await?;
//! // ... stop processes, mutate ...
//! coordinator.tunnels.save(&tunnels).await?;
//! ```

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tm_core::{
    CloudflareAccount, Collection, JsonFileStore, MemoryStore, Project, RecordStore, StoreError,
    TunnelRecord,
};

/// Owns the durable collections and the lock guarding their updates
pub struct StoreCoordinator {
    /// Coordination only; protects no data of its own
    inner: RwLock<()>,

    pub tunnels: Arc<dyn RecordStore<TunnelRecord>>,
    pub accounts: Arc<dyn RecordStore<CloudflareAccount>>,
    pub projects: Arc<dyn RecordStore<Project>>,
}

impl StoreCoordinator {
    pub fn new(
        tunnels: Arc<dyn RecordStore<TunnelRecord>>,
        accounts: Arc<dyn RecordStore<CloudflareAccount>>,
        projects: Arc<dyn RecordStore<Project>>,
    ) -> Self {
        Self {
            inner: RwLock::new(()),
            tunnels,
            accounts,
            projects,
        }
    }

    /// JSON-file collections under `data_dir`
    pub fn json(data_dir: &Path) -> Self {
        Self::new(
            Arc::new(JsonFileStore::<TunnelRecord>::new(data_dir)),
            Arc::new(JsonFileStore::<CloudflareAccount>::new(data_dir)),
            Arc::new(JsonFileStore::<Project>::new(data_dir)),
        )
    }

    /// Empty in-memory collections
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::<TunnelRecord>::new()),
            Arc::new(MemoryStore::<CloudflareAccount>::new()),
            Arc::new(MemoryStore::<Project>::new()),
        )
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.write().await
    }

    /// Snapshot of a collection
    pub async fn load<T: Collection>(&self, store: &dyn RecordStore<T>) -> Result<Vec<T>, StoreError> {
        let _guard = self.read().await;
        store.list().await
    }

    /// Load, mutate and save a collection under the write lock
    ///
    /// Nothing is saved when `apply` returns `None`.
    pub async fn update<T, R, F>(&self, store: &dyn RecordStore<T>, apply: F) -> Result<Option<R>, StoreError>
    where
        T: Collection,
        F: FnOnce(&mut Vec<T>) -> Option<R>,
    {
        let _guard = self.write().await;
        let mut records = store.list().await?;
        let result = apply(&mut records);
        if result.is_some() {
            store.save(&records).await?;
        }
        Ok(result)
    }
}
