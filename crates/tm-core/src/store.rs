//! Durable record store
//!
//! Collections are loaded and saved whole. `save` replaces the entire
//! collection atomically (write to a temp file, then rename), so callers
//! mutate a loaded `Vec` and hand it back.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::StoreError;

/// A record type persisted as a named collection
pub trait Collection: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection name, used as file stem and top-level JSON key
    const NAME: &'static str;
}

/// Whole-collection load/save contract
#[async_trait]
pub trait RecordStore<T: Collection>: Send + Sync {
    /// Load every record in the collection
    async fn list(&self) -> Result<Vec<T>, StoreError>;

    /// Replace the collection with `records`
    async fn save(&self, records: &[T]) -> Result<(), StoreError>;
}

/// JSON-file backed store: `<dir>/<collection>.json` holding `{ "<collection>": [...] }`
pub struct JsonFileStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Collection> JsonFileStore<T> {
    /// Create a store rooted at `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(format!("{}.json", T::NAME)),
            _marker: PhantomData,
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn ensure_dir(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) =
                    tokio::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).await
                {
                    tracing::warn!("Failed to restrict permissions on {:?}: {}", parent, e);
                }
            }
        }
        Ok(())
    }

    /// Move an unreadable file aside so the next save cannot overwrite it
    async fn quarantine(&self) {
        let aside = self.path.with_extension(format!(
            "json.corrupt-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        ));
        match tokio::fs::rename(&self.path, &aside).await {
            Ok(()) => tracing::warn!(
                "Collection file {:?} is unreadable, moved to {:?}; starting empty",
                self.path,
                aside
            ),
            Err(e) => tracing::warn!(
                "Collection file {:?} is unreadable and could not be moved aside: {}",
                self.path,
                e
            ),
        }
    }
}

#[async_trait]
impl<T: Collection> RecordStore<T> for JsonFileStore<T> {
    async fn list(&self) -> Result<Vec<T>, StoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        // A corrupt or foreign file reads as an empty collection once moved aside
        let records = serde_json::from_slice::<Value>(&raw)
            .ok()
            .and_then(|mut doc| doc.get_mut(T::NAME).map(Value::take))
            .and_then(|items| serde_json::from_value::<Vec<T>>(items).ok());

        match records {
            Some(records) => Ok(records),
            None => {
                self.quarantine().await;
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, records: &[T]) -> Result<(), StoreError> {
        self.ensure_dir().await?;

        let items = serde_json::to_value(records).map_err(|source| StoreError::Encode {
            collection: T::NAME,
            source,
        })?;
        let mut doc = Map::new();
        doc.insert(T::NAME.to_string(), items);
        let body =
            serde_json::to_vec_pretty(&Value::Object(doc)).map_err(|source| StoreError::Encode {
                collection: T::NAME,
                source,
            })?;

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, body)
            .await
            .map_err(|e| self.io_error(e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| self.io_error(e))?;
        }
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        tracing::debug!("Saved {} {} record(s)", records.len(), T::NAME);
        Ok(())
    }
}

/// In-memory store, used in tests and for ephemeral runs
pub struct MemoryStore<T> {
    records: Mutex<Vec<T>>,
}

impl<T: Collection> MemoryStore<T> {
    /// Create an empty store
    pub fn new() -> Self {
        Self::with_records(Vec::new())
    }

    /// Create a store seeded with `records`
    pub fn with_records(records: Vec<T>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

impl<T: Collection> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Collection> RecordStore<T> for MemoryStore<T> {
    async fn list(&self) -> Result<Vec<T>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    async fn save(&self, records: &[T]) -> Result<(), StoreError> {
        *self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = records.to_vec();
        Ok(())
    }
}
