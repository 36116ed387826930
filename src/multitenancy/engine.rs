// Embedded per-tenant database engine contract.
//
// The real engine is an external collaborator; the platform only needs
// open/execute/checkpoint/close and a size reading. The file-backed
// implementation below is the reference used by all-in-one deployments and
// tests: it journals statements to the tenant's database file, which is
// exactly the shape the replicator contract needs to ship.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::common::TenantId;
use crate::error::{PlatformError, Result};

#[async_trait]
pub trait TenantEngine: Send + Sync {
    /// Run one statement against the tenant database.
    async fn execute(&self, statement: &str) -> Result<String>;

    /// Flush buffered state to the database file.
    async fn checkpoint(&self) -> Result<()>;

    /// Close handles; the instance is being evicted.
    async fn close(&self) -> Result<()>;

    fn database_size_mb(&self) -> f64;

    fn database_path(&self) -> &Path;
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn open(&self, tenant_id: &TenantId, db_path: &Path) -> Result<Arc<dyn TenantEngine>>;
}

/// Journal-file engine: each executed statement is appended to the
/// database file.
pub struct FileEngine {
    db_path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl FileEngine {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(db_path)
            .await?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            file: tokio::sync::Mutex::new(Some(file)),
        })
    }
}

#[async_trait]
impl TenantEngine for FileEngine {
    async fn execute(&self, statement: &str) -> Result<String> {
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| PlatformError::Unavailable("engine closed".into()))?;
        file.write_all(statement.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok("ok".to_string())
    }

    async fn checkpoint(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    fn database_size_mb(&self) -> f64 {
        std::fs::metadata(&self.db_path)
            .map(|m| m.len() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0)
    }

    fn database_path(&self) -> &Path {
        &self.db_path
    }
}

pub struct FileEngineFactory;

#[async_trait]
impl EngineFactory for FileEngineFactory {
    async fn open(&self, _tenant_id: &TenantId, db_path: &Path) -> Result<Arc<dyn TenantEngine>> {
        Ok(Arc::new(FileEngine::open(db_path).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_appends_and_close_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let engine = FileEngine::open(&path).await.unwrap();
        engine.execute("insert 1").await.unwrap();
        engine.execute("insert 2").await.unwrap();
        engine.checkpoint().await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "insert 1\ninsert 2\n");

        engine.close().await.unwrap();
        assert!(engine.execute("insert 3").await.is_err());
    }
}
