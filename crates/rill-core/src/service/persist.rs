// Persistence collaborators
// Write-through storage for values whose backend is not purely in memory

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use rill_api::codec;
use rill_common::{Result, RillError};

use crate::service::key::Key;
use crate::service::value::{Backend, Value};

/// Stores and loads values on behalf of their home node
#[async_trait]
pub trait Persist: Send + Sync {
    /// Backend tag this store serves
    fn backend(&self) -> Backend;

    async fn store(&self, key: &Key, value: &Value) -> Result<()>;

    async fn load(&self, key: &Key) -> Result<Option<Value>>;

    async fn delete(&self, key: &Key) -> Result<()>;
}

/// One file per key under a directory
pub struct FilePersist {
    dir: PathBuf,
}

impl FilePersist {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            RillError::ConfigError(format!("cannot create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &Key) -> PathBuf {
        self.dir
            .join(format!("{}.val", const_hex::encode(key.bytes())))
    }
}

#[async_trait]
impl Persist for FilePersist {
    fn backend(&self) -> Backend {
        Backend::File
    }

    async fn store(&self, key: &Key, value: &Value) -> Result<()> {
        let path = self.path_for(key);
        let bytes = codec::encode(value)?;
        // Write then rename so a reader never sees half a value
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(key = %key, bytes = bytes.len(), "Stored value");
        Ok(())
    }

    async fn load(&self, key: &Key) -> Result<Option<Value>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => codec::decode(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Map-backed store for tests and single-process use
#[derive(Default)]
pub struct MemoryPersist {
    values: DashMap<Key, Value>,
}

impl MemoryPersist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl Persist for MemoryPersist {
    fn backend(&self) -> Backend {
        Backend::File
    }

    async fn store(&self, key: &Key, value: &Value) -> Result<()> {
        self.values.insert(key.clone(), value.clone());
        Ok(())
    }

    async fn load(&self, key: &Key) -> Result<Option<Value>> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}
