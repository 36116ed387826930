// Per-tenant admission control at the gateway.
//
// Checks run in a fixed order: daily request count, storage ceiling for
// uploads, then the token-bucket rate limit. Quotas are pulled from the
// control plane on first sight of a tenant and refreshed every 30 seconds;
// daily counters reset at local midnight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::TenantId;
use crate::error::{PlatformError, QuotaResource, Result};
use crate::networking::ControlPlaneClient;

/// Refresh interval for tracked tenants.
pub const QUOTA_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Sustained 10 rps with bursts of 100.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_per_sec: 10.0,
        }
    }
}

/// Classic token bucket over a monotonic clock.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            tokens: config.capacity,
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct TrackedTenant {
    storage_quota_mb: AtomicU64,
    api_requests_quota: AtomicU64,
    storage_used_mb: AtomicU64,
    requests_today: AtomicU64,
    bucket: Mutex<TokenBucket>,
}

impl TrackedTenant {
    fn new(storage_quota_mb: u64, api_requests_quota: u64, rate: RateLimitConfig) -> Self {
        Self {
            storage_quota_mb: AtomicU64::new(storage_quota_mb),
            api_requests_quota: AtomicU64::new(api_requests_quota),
            storage_used_mb: AtomicU64::new(0),
            requests_today: AtomicU64::new(0),
            bucket: Mutex::new(TokenBucket::new(rate)),
        }
    }
}

pub struct QuotaEnforcer {
    tenants: DashMap<TenantId, Arc<TrackedTenant>>,
    client: Option<Arc<ControlPlaneClient>>,
    rate: RateLimitConfig,
}

impl QuotaEnforcer {
    pub fn new(client: Option<Arc<ControlPlaneClient>>) -> Self {
        Self {
            tenants: DashMap::new(),
            client,
            rate: RateLimitConfig::default(),
        }
    }

    pub fn with_rate(mut self, rate: RateLimitConfig) -> Self {
        self.rate = rate;
        self
    }

    /// Register quotas directly; also the landing point for sync updates.
    pub fn track(&self, id: &TenantId, storage_quota_mb: u64, api_requests_quota: u64, storage_used_mb: u64) {
        let entry = self
            .tenants
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(TrackedTenant::new(
                    storage_quota_mb,
                    api_requests_quota,
                    self.rate,
                ))
            })
            .clone();
        entry
            .storage_quota_mb
            .store(storage_quota_mb, Ordering::Release);
        entry
            .api_requests_quota
            .store(api_requests_quota, Ordering::Release);
        entry
            .storage_used_mb
            .store(storage_used_mb, Ordering::Release);
    }

    pub fn forget(&self, id: &TenantId) {
        self.tenants.remove(id);
    }

    async fn tracked(&self, id: &TenantId) -> Result<Arc<TrackedTenant>> {
        if let Some(entry) = self.tenants.get(id) {
            return Ok(entry.clone());
        }
        // Cache miss: pull authoritative quotas before admitting anything.
        let Some(client) = &self.client else {
            return Err(PlatformError::NotFound(format!("tenant {}", id)));
        };
        let tenant = client.get_tenant(id).await?;
        self.track(
            id,
            tenant.storage_quota_mb,
            tenant.api_requests_quota,
            tenant.storage_used_mb,
        );
        self.tenants
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| PlatformError::Internal("tenant vanished after insert".into()))
    }

    /// Admission gate run before forwarding a request. `upload_mb` is set
    /// for requests that grow tenant storage.
    pub async fn check_admission(&self, id: &TenantId, upload_mb: Option<u64>) -> Result<()> {
        let tracked = self.tracked(id).await?;

        let daily = tracked.requests_today.load(Ordering::Acquire);
        let daily_quota = tracked.api_requests_quota.load(Ordering::Acquire);
        if daily >= daily_quota {
            return Err(PlatformError::Quota {
                resource: QuotaResource::ApiRequests,
                current: daily,
                limit: daily_quota,
            });
        }

        if let Some(upload) = upload_mb {
            let used = tracked.storage_used_mb.load(Ordering::Acquire);
            let quota = tracked.storage_quota_mb.load(Ordering::Acquire);
            if used + upload > quota {
                return Err(PlatformError::Quota {
                    resource: QuotaResource::Storage,
                    current: used + upload,
                    limit: quota,
                });
            }
        }

        if !tracked.bucket.lock().try_acquire() {
            return Err(PlatformError::Quota {
                resource: QuotaResource::RateLimit,
                current: 0,
                limit: self.rate.capacity as u64,
            });
        }

        tracked.requests_today.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Refresh every tracked tenant from the control plane.
    pub async fn sync_quotas(&self) {
        let Some(client) = &self.client else { return };
        let ids: Vec<TenantId> = self.tenants.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            match client.get_tenant(&id).await {
                Ok(tenant) => self.track(
                    &id,
                    tenant.storage_quota_mb,
                    tenant.api_requests_quota,
                    tenant.storage_used_mb,
                ),
                Err(PlatformError::NotFound(_)) => {
                    debug!(tenant = %id, "dropping quota entry for missing tenant");
                    self.forget(&id);
                }
                Err(e) => warn!(tenant = %id, error = %e, "quota sync failed"),
            }
        }
    }

    pub fn reset_daily_counters(&self) {
        for entry in self.tenants.iter() {
            entry.requests_today.store(0, Ordering::Release);
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.tenants.len()
    }
}

/// Sleep duration until the next local midnight, for the reset timer.
pub fn until_local_midnight() -> Duration {
    let now = Local::now();
    let tomorrow = (now + chrono::Duration::days(1)).date_naive();
    match tomorrow.and_hms_opt(0, 0, 0) {
        Some(midnight) => (midnight - now.naive_local())
            .to_std()
            .unwrap_or(Duration::from_secs(60)),
        None => Duration::from_secs(3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enforcer() -> QuotaEnforcer {
        QuotaEnforcer::new(None)
    }

    #[tokio::test]
    async fn test_daily_quota_denial() {
        let e = enforcer();
        let id = "ten_1".to_string();
        e.track(&id, 100, 2, 0);
        e.check_admission(&id, None).await.unwrap();
        e.check_admission(&id, None).await.unwrap();
        let err = e.check_admission(&id, None).await.unwrap_err();
        match err {
            PlatformError::Quota { resource, current, limit } => {
                assert_eq!(resource, QuotaResource::ApiRequests);
                assert_eq!((current, limit), (2, 2));
            }
            other => panic!("unexpected: {}", other),
        }
        e.reset_daily_counters();
        e.check_admission(&id, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_storage_ceiling() {
        let e = enforcer();
        let id = "ten_1".to_string();
        e.track(&id, 100, 1_000, 0);
        e.check_admission(&id, Some(60)).await.unwrap();
        // Usage counters come from the control plane; simulate the sync.
        e.track(&id, 100, 1_000, 60);
        let err = e.check_admission(&id, Some(50)).await.unwrap_err();
        assert!(matches!(
            err,
            PlatformError::Quota {
                resource: QuotaResource::Storage,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_burst_bound() {
        let e = QuotaEnforcer::new(None).with_rate(RateLimitConfig {
            capacity: 5.0,
            refill_per_sec: 1.0,
        });
        let id = "ten_1".to_string();
        e.track(&id, 100, 1_000_000, 0);

        let mut allowed = 0;
        for _ in 0..50 {
            if e.check_admission(&id, None).await.is_ok() {
                allowed += 1;
            }
        }
        // Burst of 5 plus at most ~1 refilled token in the elapsed time.
        assert!(allowed <= 6, "allowed {} exceeds burst bound", allowed);
        assert!(allowed >= 5);
    }

    #[tokio::test]
    async fn test_unknown_tenant_without_client() {
        let e = enforcer();
        let err = e
            .check_admission(&"ghost".to_string(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::NotFound(_)));
    }

    #[test]
    fn test_midnight_timer_positive() {
        let until = until_local_midnight();
        assert!(until > Duration::from_secs(0));
        assert!(until <= Duration::from_secs(24 * 3600));
    }
}
