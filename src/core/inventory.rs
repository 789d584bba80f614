use std::{
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    core::{
        backend::{Backend, BackendContext, BackendError},
        droplet::Droplet,
    },
    utils::GracefulShutdown,
};

/// Errors related to inventory management and persistence
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InventoryError {
    #[error("Unable to read inventory file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to parse inventory file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Unable to serialize inventory: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Unable to write inventory file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Backend with id {0} already exists")]
    DuplicateId(String),

    #[error("Backend with id {0} not found")]
    NotFound(String),

    #[error("Unable to save inventory - server is shutting down.")]
    ShuttingDown,
}

/// Result type for inventory operations
pub type InventoryResult<T> = Result<T, InventoryError>;

/// On-disk layout: a list of `[[droplet]]` tables.
#[derive(Debug, Default, Serialize, Deserialize)]
struct InventoryFile {
    #[serde(default, rename = "droplet")]
    droplets: Vec<Droplet>,
}

/// Ordered registry of backends. Owns their lifecycles.
pub struct Inventory {
    backends: RwLock<Vec<Arc<Backend>>>,
    ctx: BackendContext,
}

impl Inventory {
    /// An empty inventory creating backends with `ctx`.
    pub fn new(ctx: BackendContext) -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            ctx,
        }
    }

    /// Read an inventory file and start a backend for every droplet in it.
    ///
    /// Nothing is kept if any droplet is invalid.
    pub async fn load(path: impl AsRef<Path>, ctx: BackendContext) -> InventoryResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| InventoryError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let file: InventoryFile =
            toml::from_str(&content).map_err(|source| InventoryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let inventory = Self::new(ctx);
        for droplet in file.droplets {
            if let Err(e) = inventory.add_droplet(droplet) {
                inventory.close().await;
                return Err(e);
            }
        }

        tracing::info!(
            path = %path.display(),
            backends = inventory.len(),
            "Loaded inventory"
        );
        Ok(inventory)
    }

    /// Write every persistable backend to `path`, replacing the file.
    ///
    /// Refused once shutdown has started so the file is never left half written.
    pub async fn save(
        &self,
        path: impl AsRef<Path>,
        shutdown: &GracefulShutdown,
    ) -> InventoryResult<()> {
        let _lock = shutdown.try_lock().ok_or(InventoryError::ShuttingDown)?;
        let path = path.as_ref();

        let file = InventoryFile {
            droplets: self
                .read()
                .iter()
                .filter_map(|backend| backend.droplet().cloned())
                .collect(),
        };
        let content = toml::to_string(&file)?;

        tokio::fs::write(path, content)
            .await
            .map_err(|source| InventoryError::Write {
                path: path.to_path_buf(),
                source,
            })?;

        tracing::info!(
            path = %path.display(),
            droplets = file.droplets.len(),
            "Saved inventory"
        );
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Backend>>> {
        self.backends.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Backend>>> {
        self.backends.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settings and clients new backends are created with.
    pub fn context(&self) -> &BackendContext {
        &self.ctx
    }

    /// Append a backend. Its id must not already be present.
    pub fn add_backend(&self, backend: Arc<Backend>) -> InventoryResult<()> {
        let mut backends = self.write();
        if backends.iter().any(|b| b.id() == backend.id()) {
            return Err(InventoryError::DuplicateId(backend.id().to_string()));
        }
        backends.push(backend);
        Ok(())
    }

    /// Create a backend for `droplet` and append it.
    pub fn add_droplet(&self, droplet: Droplet) -> InventoryResult<Arc<Backend>> {
        let id = droplet.id.to_string();
        if self.backend(&id).is_some() {
            return Err(InventoryError::DuplicateId(id));
        }
        let backend = Backend::from_droplet(droplet, &self.ctx)?;
        self.add_backend(backend.clone())?;
        Ok(backend)
    }

    /// Remove a backend and stop its monitor.
    pub async fn remove(&self, id: &str) -> InventoryResult<Arc<Backend>> {
        let removed = {
            let mut backends = self.write();
            let index = backends
                .iter()
                .position(|b| b.id() == id)
                .ok_or_else(|| InventoryError::NotFound(id.to_string()))?;
            backends.remove(index)
        };
        removed.close().await;
        Ok(removed)
    }

    pub fn backend(&self, id: &str) -> Option<Arc<Backend>> {
        self.read().iter().find(|b| b.id() == id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().iter().map(|b| b.id().to_string()).collect()
    }

    /// A snapshot of the current backends, in order.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.read().clone()
    }

    /// Run `f` over the backends while holding the read lock.
    pub fn with_backends<R>(&self, f: impl FnOnce(&[Arc<Backend>]) -> R) -> R {
        f(&self.read())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Stop every backend's monitor. Safe to call more than once.
    pub async fn close(&self) {
        for backend in self.backends() {
            backend.close().await;
        }
    }
}
