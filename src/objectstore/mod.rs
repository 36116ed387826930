// Object-store contract.
//
// The platform treats the store as an external collaborator: PUT/GET/LIST/
// DELETE plus a lifecycle hook that moves a prefix between storage classes
// (cold tenants end up in a deep-archive class with restore latency). A
// filesystem implementation backs all-in-one deployments and tests; the
// in-memory one backs unit tests.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{PlatformError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Standard,
    DeepArchive,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Lifecycle transition for every object under the prefix.
    async fn set_storage_class(&self, prefix: &str, class: StorageClass) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, (StorageClass, Vec<u8>)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class_of(&self, key: &str) -> Option<StorageClass> {
        self.objects.read().get(key).map(|(c, _)| *c)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects
            .write()
            .insert(key.to_string(), (StorageClass::Standard, bytes));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .get(key)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| PlatformError::NotFound(format!("object {}", key)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    async fn set_storage_class(&self, prefix: &str, class: StorageClass) -> Result<()> {
        let mut objects = self.objects.write();
        for (key, entry) in objects.iter_mut() {
            if key.starts_with(prefix) {
                entry.0 = class;
            }
        }
        Ok(())
    }
}

/// Bucket laid out under a local directory; object keys map to paths.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        if key.contains("..") {
            return Err(PlatformError::InvalidInput(format!("bad object key {}", key)));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_of(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PlatformError::NotFound(format!("object {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        out.push(key);
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_of(key)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_storage_class(&self, _prefix: &str, _class: StorageClass) -> Result<()> {
        // Local filesystems have one storage class; the transition is a
        // no-op recorded by the caller in tenant activity.
        Ok(())
    }
}
