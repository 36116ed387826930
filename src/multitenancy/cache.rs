// Worker tenant cache: weighted admission, LRU eviction, and the
// load/evict protocols that keep the replicator covering every byte.
//
// Locking: the instance map is an async RwLock taken first; each
// instance's lifecycle lock is taken second. Request admission touches
// neither. Load and evict both run their whole protocol under the map
// write lock, which serializes capacity decisions; the request path stays
// lock-free so in-flight traffic is never stalled by a load.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::common::{now, TenantId};
use crate::error::{PlatformError, Result};
use crate::multitenancy::engine::EngineFactory;
use crate::multitenancy::instance::{InstanceState, TenantInstance};
use crate::multitenancy::replicator::{Replicator, RestorePoint};
use crate::networking::ControlPlaneClient;
use crate::registry::types::{StorageTier, Tenant, TenantActivity, TenantStatus};
use crate::resources::{tier_for_quotas, ResourceManager};

/// Hard cap on draining in-flight requests during eviction.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Capacity in weighted units (micro=1 ... enterprise=20).
    pub capacity_weight: u32,
    pub drain_timeout: Duration,
    pub data_dir: PathBuf,
    pub delete_files_on_evict: bool,
}

impl CacheConfig {
    pub fn new(capacity_weight: u32, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            capacity_weight,
            drain_timeout: DRAIN_TIMEOUT,
            data_dir: data_dir.into(),
            delete_files_on_evict: false,
        }
    }
}

pub struct TenantCache {
    config: CacheConfig,
    instances: RwLock<HashMap<TenantId, Arc<TenantInstance>>>,
    used_weight: AtomicU32,
    engines: Arc<dyn EngineFactory>,
    replicator: Arc<dyn Replicator>,
    resources: Arc<ResourceManager>,
    /// Best-effort control-plane reporting; absent in unit tests.
    client: Option<Arc<ControlPlaneClient>>,
}

impl TenantCache {
    pub fn new(
        config: CacheConfig,
        engines: Arc<dyn EngineFactory>,
        replicator: Arc<dyn Replicator>,
        resources: Arc<ResourceManager>,
        client: Option<Arc<ControlPlaneClient>>,
    ) -> Self {
        Self {
            config,
            instances: RwLock::new(HashMap::new()),
            used_weight: AtomicU32::new(0),
            engines,
            replicator,
            resources,
            client,
        }
    }

    pub fn used_weight(&self) -> u32 {
        self.used_weight.load(Ordering::Acquire)
    }

    pub fn capacity_weight(&self) -> u32 {
        self.config.capacity_weight
    }

    pub fn replicator(&self) -> &Arc<dyn Replicator> {
        &self.replicator
    }

    pub async fn get(&self, id: &TenantId) -> Option<Arc<TenantInstance>> {
        self.instances.read().await.get(id).cloned()
    }

    pub async fn cached_ids(&self) -> Vec<TenantId> {
        self.instances.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    fn db_path(&self, id: &TenantId) -> PathBuf {
        self.config.data_dir.join("tenants").join(id).join("data.db")
    }

    /// Load a tenant into the cache, restoring from the object store when
    /// the database is not on local disk.
    pub async fn load(&self, tenant: &Tenant) -> Result<Arc<TenantInstance>> {
        // Fast path under the read lock.
        if let Some(instance) = self.get(&tenant.id).await {
            match instance.state() {
                InstanceState::Active | InstanceState::Loading => {
                    instance.touch();
                    return Ok(instance);
                }
                InstanceState::Evicting | InstanceState::Evicted => {
                    return Err(PlatformError::Unavailable(format!(
                        "tenant {} is evicting",
                        tenant.id
                    )));
                }
            }
        }

        let mut instances = self.instances.write().await;
        if let Some(instance) = instances.get(&tenant.id) {
            instance.touch();
            return Ok(instance.clone());
        }

        let tier = tier_for_quotas(tenant.storage_quota_mb, tenant.api_requests_quota);
        let weight = tier.weight();
        if weight > self.config.capacity_weight {
            return Err(PlatformError::NoCapacity(format!(
                "tenant {} weight {} exceeds cache capacity {}",
                tenant.id, weight, self.config.capacity_weight
            )));
        }

        // Evict LRU victims until the weighted occupancy admits us.
        while self.used_weight() + weight > self.config.capacity_weight {
            let victim = Self::lru_victim(&instances);
            let Some(victim_id) = victim else {
                return Err(PlatformError::NoCapacity(format!(
                    "cache full and nothing evictable for tenant {}",
                    tenant.id
                )));
            };
            debug!(victim = %victim_id, incoming = %tenant.id, "evicting for capacity");
            self.evict_locked(&mut instances, &victim_id).await?;
        }

        let instance = TenantInstance::new(
            tenant.id.clone(),
            tier,
            self.db_path(&tenant.id),
            tenant.bucket.clone(),
            tenant.prefix.clone(),
        );
        instances.insert(tenant.id.clone(), instance.clone());
        self.used_weight.fetch_add(weight, Ordering::AcqRel);

        match self.bootstrap(&instance).await {
            Ok(()) => {
                self.resources.track(&tenant.id, tier);
                self.report_loaded(&instance).await;
                info!(tenant = %tenant.id, tier = %tier, "tenant loaded");
                Ok(instance)
            }
            Err(e) => {
                // Clean up partial state before surfacing the failure.
                instances.remove(&tenant.id);
                self.used_weight.fetch_sub(weight, Ordering::AcqRel);
                let _ = self.replicator.stop_replication(&tenant.id).await;
                if let Some(dir) = self.db_path(&tenant.id).parent() {
                    let _ = tokio::fs::remove_dir_all(dir).await;
                }
                warn!(tenant = %tenant.id, error = %e, "tenant load failed");
                Err(e)
            }
        }
    }

    /// Steps (a)-(f) of the load protocol, under the instance lock.
    async fn bootstrap(&self, instance: &Arc<TenantInstance>) -> Result<()> {
        let mut state = instance.lock_state().await;

        if !instance.db_path.exists() {
            self.replicator
                .restore(
                    &instance.bucket,
                    &instance.prefix,
                    &instance.db_path,
                    RestorePoint::Latest,
                )
                .await?;
        }

        let engine = self.engines.open(&instance.id, &instance.db_path).await?;
        instance.set_engine(Some(engine));

        self.replicator
            .start_replication(
                &instance.id,
                &instance.db_path,
                &instance.bucket,
                &instance.prefix,
            )
            .await?;
        instance.set_replicating(true);

        instance.touch();
        instance.set_state(&mut state, InstanceState::Active);
        Ok(())
    }

    async fn report_loaded(&self, instance: &Arc<TenantInstance>) {
        let Some(client) = &self.client else { return };
        let mut activity = TenantActivity::new(instance.id.clone());
        activity.last_access = now();
        activity.storage_tier = StorageTier::Hot;
        if let Err(e) = client.save_activity(activity).await {
            warn!(tenant = %instance.id, error = %e, "activity report failed");
        }
        if let Err(e) = client
            .update_tenant_status(&instance.id, TenantStatus::Active)
            .await
        {
            warn!(tenant = %instance.id, error = %e, "status report failed");
        }
    }

    fn lru_victim(instances: &HashMap<TenantId, Arc<TenantInstance>>) -> Option<TenantId> {
        instances
            .values()
            .filter(|i| i.state() == InstanceState::Active)
            .min_by_key(|i| i.last_access())
            .map(|i| i.id.clone())
    }

    /// Evict one tenant: drain, stop replication, close the engine, drop
    /// the cache entry.
    pub async fn evict(&self, id: &TenantId) -> Result<()> {
        let mut instances = self.instances.write().await;
        self.evict_locked(&mut instances, id).await
    }

    async fn evict_locked(
        &self,
        instances: &mut HashMap<TenantId, Arc<TenantInstance>>,
        id: &TenantId,
    ) -> Result<()> {
        let instance = instances
            .get(id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("tenant {} not cached", id)))?;

        let mut state = instance.lock_state().await;
        instance.set_state(&mut state, InstanceState::Evicting);

        let leftover = instance.await_drained(self.config.drain_timeout).await;
        if leftover > 0 {
            warn!(tenant = %id, leftover, "drain cap hit, aborting in-flight requests");
        }

        // Replication stops only after the drain, so the final flush covers
        // every acknowledged write.
        if instance.is_replicating() {
            self.replicator.stop_replication(id).await?;
            instance.set_replicating(false);
        }

        if let Some(engine) = instance.engine() {
            engine.close().await?;
            instance.set_engine(None);
        }

        instance.set_state(&mut state, InstanceState::Evicted);
        drop(state);

        instances.remove(id);
        self.used_weight
            .fetch_sub(instance.weight, Ordering::AcqRel);
        self.resources.forget(id);

        if self.config.delete_files_on_evict {
            if let Some(dir) = instance.db_path.parent() {
                let _ = tokio::fs::remove_dir_all(dir).await;
            }
        }

        if let Some(client) = &self.client {
            if let Err(e) = client.update_tenant_status(id, TenantStatus::Evicted).await {
                warn!(tenant = %id, error = %e, "eviction status report failed");
            }
        }

        info!(tenant = %id, "tenant evicted");
        Ok(())
    }

    /// Stop continuous replication for an idle tenant but keep it cached.
    pub async fn pause_replication(&self, id: &TenantId) -> Result<()> {
        let instance = self
            .get(id)
            .await
            .ok_or_else(|| PlatformError::NotFound(format!("tenant {} not cached", id)))?;
        if instance.is_replicating() {
            self.replicator.stop_replication(id).await?;
            instance.set_replicating(false);
            debug!(tenant = %id, "replication paused for idle tenant");
        }
        Ok(())
    }

    /// Evict everything; used on worker shutdown.
    pub async fn stop_all(&self) {
        let ids = self.cached_ids().await;
        for id in ids {
            if let Err(e) = self.evict(&id).await {
                warn!(tenant = %id, error = %e, "shutdown eviction failed");
            }
        }
    }
}
