// Three-tier archival: hot tenants ride in memory with continuous
// replication; idle ones first lose their replicator, then their cache
// slot (warm), and finally move to the object store's deep-archive class
// (cold). Runs hourly on every worker over the tenants it hosts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::common::{now, TenantId};
use crate::multitenancy::cache::TenantCache;
use crate::multitenancy::replicator::layout;
use crate::networking::ControlPlaneClient;
use crate::objectstore::{ObjectStore, StorageClass};
use crate::registry::types::{StorageTier, TenantActivity};

#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    /// Idle time before continuous replication stops.
    pub replication_stop_after: Duration,
    /// Idle time before eviction to the warm tier.
    pub warm_after: Duration,
    /// Idle time before the cold lifecycle transition.
    pub cold_after: Duration,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            replication_stop_after: Duration::days(3),
            warm_after: Duration::days(7),
            cold_after: Duration::days(90),
        }
    }
}

struct WarmRecord {
    last_access: DateTime<Utc>,
    prefix: String,
}

pub struct Archiver {
    config: ArchiverConfig,
    cache: Arc<TenantCache>,
    store: Arc<dyn ObjectStore>,
    client: Option<Arc<ControlPlaneClient>>,
    /// Tenants this worker evicted to warm, watched for the cold cutoff.
    warm: Mutex<HashMap<TenantId, WarmRecord>>,
}

impl Archiver {
    pub fn new(
        config: ArchiverConfig,
        cache: Arc<TenantCache>,
        store: Arc<dyn ObjectStore>,
        client: Option<Arc<ControlPlaneClient>>,
    ) -> Self {
        Self {
            config,
            cache,
            store,
            client,
            warm: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run_once(&self) {
        let at = now();
        self.pass_cached(at).await;
        self.pass_warm(at).await;
    }

    async fn pass_cached(&self, at: DateTime<Utc>) {
        for id in self.cache.cached_ids().await {
            let Some(instance) = self.cache.get(&id).await else {
                continue;
            };
            let idle = at - instance.last_access();

            if idle > self.config.warm_after {
                info!(tenant = %id, idle_days = idle.num_days(), "archiving idle tenant to warm");
                let prefix = instance.prefix.clone();
                let last_access = instance.last_access();
                match self.cache.evict(&id).await {
                    Ok(()) => {
                        self.warm.lock().insert(
                            id.clone(),
                            WarmRecord {
                                last_access,
                                prefix,
                            },
                        );
                        self.report_tier(&id, last_access, StorageTier::Warm, Some(at))
                            .await;
                    }
                    Err(e) => warn!(tenant = %id, error = %e, "warm eviction failed"),
                }
            } else if idle > self.config.replication_stop_after && instance.is_replicating() {
                info!(tenant = %id, idle_days = idle.num_days(), "stopping replication for idle tenant");
                if let Err(e) = self.cache.pause_replication(&id).await {
                    warn!(tenant = %id, error = %e, "replication pause failed");
                }
            }
        }
    }

    async fn pass_warm(&self, at: DateTime<Utc>) {
        let due: Vec<(TenantId, DateTime<Utc>, String)> = {
            let warm = self.warm.lock();
            warm.iter()
                .filter(|(_, r)| at - r.last_access > self.config.cold_after)
                .map(|(id, r)| (id.clone(), r.last_access, r.prefix.clone()))
                .collect()
        };
        for (id, last_access, prefix) in due {
            info!(tenant = %id, "transitioning tenant to cold storage");
            let lifecycle_prefix = if prefix.is_empty() {
                layout::tenant_prefix(&id)
            } else {
                prefix
            };
            if let Err(e) = self
                .store
                .set_storage_class(&lifecycle_prefix, StorageClass::DeepArchive)
                .await
            {
                warn!(tenant = %id, error = %e, "cold lifecycle transition failed");
                continue;
            }
            self.warm.lock().remove(&id);
            self.report_tier(&id, last_access, StorageTier::Cold, Some(at)).await;
        }
    }

    async fn report_tier(
        &self,
        id: &TenantId,
        last_access: DateTime<Utc>,
        tier: StorageTier,
        archive_date: Option<DateTime<Utc>>,
    ) {
        let Some(client) = &self.client else { return };
        let mut activity = TenantActivity::new(id.clone());
        activity.last_access = last_access;
        activity.storage_tier = tier;
        activity.archive_date = archive_date;
        if let Err(e) = client.save_activity(activity).await {
            warn!(tenant = %id, error = %e, "tier report failed");
        }
    }

    /// Number of tenants currently tracked as warm.
    pub fn warm_count(&self) -> usize {
        self.warm.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multitenancy::cache::CacheConfig;
    use crate::multitenancy::engine::FileEngineFactory;
    use crate::multitenancy::replicator::ObjectStoreReplicator;
    use crate::objectstore::MemoryObjectStore;
    use crate::registry::types::Tenant;
    use crate::resources::ResourceManager;

    async fn setup(
        config: ArchiverConfig,
    ) -> (Archiver, Arc<TenantCache>, Arc<MemoryObjectStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let store_dyn: Arc<dyn ObjectStore> = store.clone();
        let replicator = Arc::new(ObjectStoreReplicator::new(
            store_dyn.clone(),
            std::time::Duration::from_millis(20),
        ));
        let cache = Arc::new(TenantCache::new(
            CacheConfig::new(10, dir.path()),
            Arc::new(FileEngineFactory),
            replicator,
            Arc::new(ResourceManager::new()),
            None,
        ));
        let archiver = Archiver::new(config, cache.clone(), store_dyn, None);
        (archiver, cache, store, dir)
    }

    #[tokio::test]
    async fn test_replication_stops_then_warm_then_cold() {
        let config = ArchiverConfig {
            replication_stop_after: Duration::days(3),
            warm_after: Duration::days(7),
            cold_after: Duration::days(90),
        };
        let (archiver, cache, store, dir) = setup(config).await;

        // Seed and load a tenant, then age it past each threshold.
        let mut tenant = Tenant::new("ten_a", "ten_a.example.com", "u_1");
        tenant.storage_quota_mb = 10;
        tenant.api_requests_quota = 1_000;
        let db_path = dir.path().join("tenants").join("ten_a").join("data.db");
        tokio::fs::create_dir_all(db_path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&db_path, b"x").await.unwrap();
        let instance = cache.load(&tenant).await.unwrap();

        // Past the replication-stop threshold but not warm yet.
        instance.set_last_access(now() - Duration::days(4));
        archiver.run_once().await;
        let instance = cache.get(&"ten_a".to_string()).await.unwrap();
        assert!(!instance.is_replicating());

        // Past the warm threshold: evicted and tracked.
        instance.set_last_access(now() - Duration::days(8));
        archiver.run_once().await;
        assert!(cache.get(&"ten_a".to_string()).await.is_none());
        assert_eq!(archiver.warm_count(), 1);

        // Past the cold threshold: lifecycle transition fires.
        {
            let mut warm = archiver.warm.lock();
            let record = warm.get_mut(&"ten_a".to_string()).unwrap();
            record.last_access = now() - Duration::days(91);
        }
        archiver.run_once().await;
        assert_eq!(archiver.warm_count(), 0);
        assert_eq!(
            store.class_of("tenants/ten_a/litestream/data.db/manifest.json"),
            Some(StorageClass::DeepArchive)
        );
    }
}
