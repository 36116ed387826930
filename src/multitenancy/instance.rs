// An in-memory tenant instance bound to local disk and a replicator job.
//
// Lifecycle transitions happen under the instance's own lock; the cache
// always takes its map lock first and the instance lock second, so the two
// never deadlock. Request admission is lock-free.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::common::{now, TenantId};
use crate::error::{PlatformError, Result};
use crate::multitenancy::engine::TenantEngine;
use crate::resources::TenantTier;

/// In-memory lifecycle of a cached tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Loading,
    Active,
    Evicting,
    Evicted,
}

pub struct TenantInstance {
    pub id: TenantId,
    pub tier: TenantTier,
    pub weight: u32,
    pub db_path: PathBuf,
    pub bucket: String,
    pub prefix: String,
    state: tokio::sync::Mutex<InstanceState>,
    state_snapshot: RwLock<InstanceState>,
    engine: RwLock<Option<Arc<dyn TenantEngine>>>,
    in_flight: AtomicUsize,
    last_access: RwLock<DateTime<Utc>>,
    /// False once continuous replication has been stopped for idleness.
    replicating: AtomicBool,
    drained: Notify,
}

impl std::fmt::Debug for TenantInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantInstance")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("weight", &self.weight)
            .field("db_path", &self.db_path)
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("state_snapshot", &*self.state_snapshot.read())
            .field("in_flight", &self.in_flight)
            .field("replicating", &self.replicating)
            .finish()
    }
}

impl TenantInstance {
    pub fn new(
        id: TenantId,
        tier: TenantTier,
        db_path: PathBuf,
        bucket: String,
        prefix: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            weight: tier.weight(),
            tier,
            db_path,
            bucket,
            prefix,
            state: tokio::sync::Mutex::new(InstanceState::Loading),
            state_snapshot: RwLock::new(InstanceState::Loading),
            engine: RwLock::new(None),
            in_flight: AtomicUsize::new(0),
            last_access: RwLock::new(now()),
            replicating: AtomicBool::new(false),
            drained: Notify::new(),
        })
    }

    /// Take the lifecycle lock. Callers must already hold the cache lock
    /// if they hold it at all.
    pub async fn lock_state(&self) -> tokio::sync::MutexGuard<'_, InstanceState> {
        self.state.lock().await
    }

    pub fn set_state(&self, guard: &mut tokio::sync::MutexGuard<'_, InstanceState>, state: InstanceState) {
        **guard = state;
        *self.state_snapshot.write() = state;
    }

    /// Lock-free view for admission and LRU ranking.
    pub fn state(&self) -> InstanceState {
        *self.state_snapshot.read()
    }

    pub fn engine(&self) -> Option<Arc<dyn TenantEngine>> {
        self.engine.read().clone()
    }

    pub fn set_engine(&self, engine: Option<Arc<dyn TenantEngine>>) {
        *self.engine.write() = engine;
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        *self.last_access.read()
    }

    pub fn touch(&self) {
        *self.last_access.write() = now();
    }

    pub fn set_last_access(&self, at: DateTime<Utc>) {
        *self.last_access.write() = at;
    }

    pub fn set_replicating(&self, on: bool) {
        self.replicating.store(on, Ordering::Release);
    }

    pub fn is_replicating(&self) -> bool {
        self.replicating.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Admit one request. Refused while the instance is evicting.
    pub fn begin_request(self: &Arc<Self>) -> Result<RequestGuard> {
        match self.state() {
            InstanceState::Active | InstanceState::Loading => {}
            InstanceState::Evicting | InstanceState::Evicted => {
                return Err(PlatformError::Unavailable(format!(
                    "tenant {} is evicting",
                    self.id
                )));
            }
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.touch();
        Ok(RequestGuard {
            instance: self.clone(),
        })
    }

    /// Wait for in-flight requests to finish, up to the drain cap.
    /// Returns the number still running when it gave up.
    pub async fn await_drained(&self, cap: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + cap;
        loop {
            if self.in_flight() == 0 {
                return 0;
            }
            let mut wait = std::pin::pin!(self.drained.notified());
            // Register interest before re-checking, so a guard dropped in
            // between cannot strand us until the cap.
            wait.as_mut().enable();
            if self.in_flight() == 0 {
                return 0;
            }
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                return self.in_flight();
            }
        }
    }
}

/// Decrements the in-flight count on drop and wakes any drain waiter.
pub struct RequestGuard {
    instance: Arc<TenantInstance>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let before = self.instance.in_flight.fetch_sub(1, Ordering::AcqRel);
        if before == 1 {
            self.instance.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> Arc<TenantInstance> {
        TenantInstance::new(
            "ten_1".to_string(),
            TenantTier::Small,
            PathBuf::from("/tmp/hivedb-instance/data.db"),
            "bkt".to_string(),
            "tenants/ten_1".to_string(),
        )
    }

    #[tokio::test]
    async fn test_eviction_refuses_new_requests() {
        let inst = instance();
        {
            let mut state = inst.lock_state().await;
            inst.set_state(&mut state, InstanceState::Active);
        }
        let guard = inst.begin_request().unwrap();
        {
            let mut state = inst.lock_state().await;
            inst.set_state(&mut state, InstanceState::Evicting);
        }
        assert!(inst.begin_request().is_err());
        drop(guard);
        assert_eq!(inst.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let inst = instance();
        {
            let mut state = inst.lock_state().await;
            inst.set_state(&mut state, InstanceState::Active);
        }
        let guard = inst.begin_request().unwrap();
        let drainer = {
            let inst = inst.clone();
            tokio::spawn(async move { inst.await_drained(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(guard);
        assert_eq!(drainer.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_gives_up_at_cap() {
        let inst = instance();
        {
            let mut state = inst.lock_state().await;
            inst.set_state(&mut state, InstanceState::Active);
        }
        let _guard = inst.begin_request().unwrap();
        let left = inst.await_drained(Duration::from_millis(50)).await;
        assert_eq!(left, 1);
    }
}
