// Continuous log-shipping replicator contract.
//
// The worker drives the replicator through three operations: start
// continuous shipping, stop (blocking until the last segment uploads), and
// restore. The object-store implementation here is the reference: it ships
// the tenant database on a sync interval using the documented bucket
// layout. Stopping flushes a final generation snapshot, which is what makes
// eviction lossless.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::common::TenantId;
use crate::error::{PlatformError, Result};
use crate::objectstore::ObjectStore;

/// Paths under the bucket, shared between replicator and archiver.
pub mod layout {
    pub fn tenant_prefix(tenant_id: &str) -> String {
        format!("tenants/{}", tenant_id)
    }

    pub fn db_prefix(prefix: &str, db: &str) -> String {
        format!("{}/litestream/{}", prefix, db)
    }

    pub fn manifest(prefix: &str, db: &str) -> String {
        format!("{}/manifest.json", db_prefix(prefix, db))
    }

    pub fn generation_snapshot(prefix: &str, db: &str, generation: u64) -> String {
        format!(
            "{}/generations/{:010}/snapshot",
            db_prefix(prefix, db),
            generation
        )
    }

    pub fn wal_segment(prefix: &str, db: &str, generation: u64, n: u64) -> String {
        format!(
            "{}/generations/{:010}/wal/{}.wal",
            db_prefix(prefix, db),
            generation,
            n
        )
    }

    pub fn hooks_prefix(tenant_id: &str) -> String {
        format!("tenants/{}/hooks/", tenant_id)
    }

    pub fn metadata(tenant_id: &str) -> String {
        format!("tenants/{}/metadata.json", tenant_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RestorePoint {
    Latest,
    At(DateTime<Utc>),
}

#[async_trait]
pub trait Replicator: Send + Sync {
    async fn start_replication(
        &self,
        tenant_id: &TenantId,
        local_path: &Path,
        bucket: &str,
        prefix: &str,
    ) -> Result<()>;

    /// Blocks until the last segment has been uploaded.
    async fn stop_replication(&self, tenant_id: &TenantId) -> Result<()>;

    async fn restore(
        &self,
        bucket: &str,
        prefix: &str,
        local_path: &Path,
        point: RestorePoint,
    ) -> Result<()>;

    fn is_replicating(&self, tenant_id: &TenantId) -> bool;
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Manifest {
    generation: u64,
    last_sync: DateTime<Utc>,
    size_bytes: u64,
}

struct ReplicationJob {
    stop: watch::Sender<bool>,
    done: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    local_path: PathBuf,
    prefix: String,
}

/// Reference implementation shipping whole-database generations to the
/// object store on an interval.
pub struct ObjectStoreReplicator {
    store: Arc<dyn ObjectStore>,
    sync_interval: Duration,
    jobs: DashMap<TenantId, Arc<ReplicationJob>>,
}

impl ObjectStoreReplicator {
    pub fn new(store: Arc<dyn ObjectStore>, sync_interval: Duration) -> Self {
        Self {
            store,
            sync_interval,
            jobs: DashMap::new(),
        }
    }

    async fn ship(
        store: &Arc<dyn ObjectStore>,
        local_path: &Path,
        prefix: &str,
        generation: u64,
    ) -> Result<()> {
        let bytes = match tokio::fs::read(local_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let db = db_name(local_path);
        let size_bytes = bytes.len() as u64;
        store
            .put(&layout::generation_snapshot(prefix, &db, generation), bytes)
            .await?;
        let manifest = Manifest {
            generation,
            last_sync: crate::common::now(),
            size_bytes,
        };
        let manifest_bytes = serde_json::to_vec(&manifest)
            .map_err(|e| PlatformError::Serialization(e.to_string()))?;
        store
            .put(&layout::manifest(prefix, &db), manifest_bytes)
            .await?;
        Ok(())
    }
}

fn db_name(local_path: &Path) -> String {
    local_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "data.db".to_string())
}

#[async_trait]
impl Replicator for ObjectStoreReplicator {
    async fn start_replication(
        &self,
        tenant_id: &TenantId,
        local_path: &Path,
        _bucket: &str,
        prefix: &str,
    ) -> Result<()> {
        if self.jobs.contains_key(tenant_id) {
            return Ok(());
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let store = self.store.clone();
        let path = local_path.to_path_buf();
        let job_prefix = prefix.to_string();
        let interval = self.sync_interval;
        let id = tenant_id.clone();

        let handle = tokio::spawn(async move {
            let mut generation = 1u64;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = Self::ship(&store, &path, &job_prefix, generation).await {
                            warn!(tenant = %id, error = %e, "replication sync failed");
                        } else {
                            generation += 1;
                        }
                    }
                }
            }
        });

        self.jobs.insert(
            tenant_id.clone(),
            Arc::new(ReplicationJob {
                stop: stop_tx,
                done: tokio::sync::Mutex::new(Some(handle)),
                local_path: local_path.to_path_buf(),
                prefix: prefix.to_string(),
            }),
        );
        debug!(tenant = %tenant_id, "replication started");
        Ok(())
    }

    async fn stop_replication(&self, tenant_id: &TenantId) -> Result<()> {
        let Some((_, job)) = self.jobs.remove(tenant_id) else {
            return Ok(());
        };
        let _ = job.stop.send(true);
        if let Some(handle) = job.done.lock().await.take() {
            let _ = handle.await;
        }
        // Final flush: nothing written after this point is covered, which
        // is why eviction drains before stopping.
        Self::ship(&self.store, &job.local_path, &job.prefix, u64::MAX).await?;
        debug!(tenant = %tenant_id, "replication stopped after final flush");
        Ok(())
    }

    async fn restore(
        &self,
        _bucket: &str,
        prefix: &str,
        local_path: &Path,
        point: RestorePoint,
    ) -> Result<()> {
        if let RestorePoint::At(_) = point {
            return Err(PlatformError::InvalidInput(
                "point-in-time restore is not supported by this replicator".into(),
            ));
        }
        let db = db_name(local_path);
        // The latest generation wins; u64::MAX marks the final flush.
        let keys = self
            .store
            .list(&format!("{}/generations/", layout::db_prefix(prefix, &db)))
            .await?;
        let latest = keys
            .iter()
            .filter(|k| k.ends_with("/snapshot"))
            .max()
            .ok_or_else(|| PlatformError::NotFound(format!("no generations under {}", prefix)))?;
        let bytes = self.store.get(latest).await?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, bytes).await?;
        Ok(())
    }

    fn is_replicating(&self, tenant_id: &TenantId) -> bool {
        self.jobs.contains_key(tenant_id)
    }
}

/// Replicator used when log shipping is disabled in config.
pub struct NullReplicator;

#[async_trait]
impl Replicator for NullReplicator {
    async fn start_replication(
        &self,
        _tenant_id: &TenantId,
        _local_path: &Path,
        _bucket: &str,
        _prefix: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn stop_replication(&self, _tenant_id: &TenantId) -> Result<()> {
        Ok(())
    }

    async fn restore(
        &self,
        _bucket: &str,
        prefix: &str,
        _local_path: &Path,
        _point: RestorePoint,
    ) -> Result<()> {
        Err(PlatformError::NotFound(format!(
            "replication disabled, nothing to restore under {}",
            prefix
        )))
    }

    fn is_replicating(&self, _tenant_id: &TenantId) -> bool {
        false
    }
}
