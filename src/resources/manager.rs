// Per-tenant resource tracking, tier classification, and hotspot
// detection on the worker.
//
// The request path only bumps counters behind a per-tenant lock; heavier
// evaluation happens on the collector tick. Installed callbacks fire on
// spawned tasks so the manager never blocks on them.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::common::{now, TenantId};
use crate::resources::tiers::{classify, TenantMeasurements, TenantTier};
use crate::resources::windows::SlidingWindow;

/// Score above which a tenant is a hotspot.
pub const HOTSPOT_THRESHOLD: f64 = 0.7;

/// 24h requests above this multiple of the 7-day daily average is a spike.
pub const SPIKE_RATIO: f64 = 3.0;

const SPIKE_ALLOWANCE: Duration = Duration::hours(1);
const SPIKE_UPGRADE_AFTER: Duration = Duration::hours(6);
const TIER_DOWNGRADE_WINDOW: Duration = Duration::hours(24);

pub type HotspotCallback = Arc<dyn Fn(&TenantId, &TenantMeasurements) + Send + Sync>;
pub type TierChangeCallback = Arc<dyn Fn(&TenantId, TenantTier, TenantTier) + Send + Sync>;
pub type QuotaViolationCallback = Arc<dyn Fn(&TenantId, &str, f64, f64) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_hotspot: Option<HotspotCallback>,
    on_tier_change: Option<TierChangeCallback>,
    on_quota_violation: Option<QuotaViolationCallback>,
}

struct TenantState {
    tier: TenantTier,
    tier_since: DateTime<Utc>,
    measurements: TenantMeasurements,
    /// Requests per minute over the last hour.
    rpm: SlidingWindow,
    /// Requests per day over the last week.
    daily: SlidingWindow,
    /// Errors per minute over the last hour.
    errors: SlidingWindow,
    query_ms_ema: f64,
    spike_started: Option<DateTime<Utc>>,
    upgrade_proposed: bool,
}

impl TenantState {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            tier: TenantTier::Micro,
            tier_since: at,
            measurements: TenantMeasurements::default(),
            rpm: SlidingWindow::new(60, Duration::minutes(1), at),
            daily: SlidingWindow::new(7, Duration::days(1), at),
            errors: SlidingWindow::new(60, Duration::minutes(1), at),
            query_ms_ema: 0.0,
            spike_started: None,
            upgrade_proposed: false,
        }
    }
}

/// Point-in-time resource sample from the collector.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    pub database_mb: f64,
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub io_ops_per_sec: f64,
}

pub struct ResourceManager {
    tenants: DashMap<TenantId, Arc<Mutex<TenantState>>>,
    callbacks: RwLock<Callbacks>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
            callbacks: RwLock::new(Callbacks::default()),
        }
    }

    pub fn on_hotspot(&self, cb: HotspotCallback) {
        self.callbacks.write().on_hotspot = Some(cb);
    }

    pub fn on_tier_change(&self, cb: TierChangeCallback) {
        self.callbacks.write().on_tier_change = Some(cb);
    }

    pub fn on_quota_violation(&self, cb: QuotaViolationCallback) {
        self.callbacks.write().on_quota_violation = Some(cb);
    }

    fn state(&self, id: &TenantId) -> Arc<Mutex<TenantState>> {
        self.tenants
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TenantState::new(now()))))
            .clone()
    }

    pub fn track(&self, id: &TenantId, tier: TenantTier) {
        let state = self.state(id);
        let mut state = state.lock();
        state.tier = tier;
        state.tier_since = now();
    }

    pub fn forget(&self, id: &TenantId) {
        self.tenants.remove(id);
    }

    pub fn tier(&self, id: &TenantId) -> TenantTier {
        self.state(id).lock().tier
    }

    pub fn measurements(&self, id: &TenantId) -> TenantMeasurements {
        self.state(id).lock().measurements
    }

    /// Request-path accounting; cheap and per-tenant locked.
    pub fn record_request(&self, id: &TenantId, query_ms: f64, is_error: bool) {
        let at = now();
        let state = self.state(id);
        let mut state = state.lock();
        state.rpm.record(1, at);
        state.daily.record(1, at);
        if is_error {
            state.errors.record(1, at);
        }
        state.query_ms_ema = if state.query_ms_ema == 0.0 {
            query_ms
        } else {
            0.2 * query_ms + 0.8 * state.query_ms_ema
        };
    }

    /// Collector-path sample ingestion (every <= 30 s per tenant).
    pub fn observe(&self, id: &TenantId, sample: ResourceSample) {
        let at = now();
        let state = self.state(id);
        let mut state = state.lock();
        let requests_1h = state.rpm.sum(at);
        let peak_rpm = state.rpm.max_slot(at);
        let requests_24h = state.daily.sum(at).max(requests_1h);
        let errors_1h = state.errors.sum(at);
        state.measurements = TenantMeasurements {
            database_mb: sample.database_mb,
            requests_24h,
            peak_rpm,
            avg_query_ms: state.query_ms_ema,
            error_rate: if requests_1h == 0 {
                0.0
            } else {
                errors_1h as f64 / requests_1h as f64
            },
            memory_mb: sample.memory_mb,
            cpu_percent: sample.cpu_percent,
            io_ops_per_sec: sample.io_ops_per_sec,
        };
    }

    /// Weighted pressure against the tenant's own tier envelope.
    pub fn hotspot_score(&self, id: &TenantId) -> f64 {
        let state = self.state(id);
        let state = state.lock();
        let quotas = state.tier.quotas();
        let m = &state.measurements;
        0.25 * (m.database_mb / quotas.database_mb)
            + 0.25 * (m.requests_24h as f64 / quotas.requests_per_day as f64)
            + 0.30 * (m.cpu_percent / quotas.cpu_percent)
            + 0.20 * (m.memory_mb / quotas.memory_mb)
    }

    pub fn is_hotspot(&self, id: &TenantId) -> bool {
        self.hotspot_score(id) > HOTSPOT_THRESHOLD
    }

    pub fn is_spiking(&self, id: &TenantId) -> bool {
        let at = now();
        let state = self.state(id);
        let mut state = state.lock();
        Self::spiking_locked(&mut state, at)
    }

    fn spiking_locked(state: &mut TenantState, at: DateTime<Utc>) -> bool {
        let avg_daily = state.daily.avg_per_slot(at);
        if avg_daily == 0.0 {
            return false;
        }
        state.measurements.requests_24h as f64 / avg_daily > SPIKE_RATIO
    }

    /// CPU/memory ceilings currently in force: the tier envelope, doubled
    /// while a spike allowance is active.
    pub fn effective_limits(&self, id: &TenantId) -> (f64, f64) {
        let at = now();
        let state = self.state(id);
        let state = state.lock();
        let quotas = state.tier.quotas();
        let boosted = matches!(state.spike_started, Some(start) if at - start < SPIKE_ALLOWANCE);
        if boosted {
            (quotas.cpu_percent * 2.0, quotas.memory_mb * 2.0)
        } else {
            (quotas.cpu_percent, quotas.memory_mb)
        }
    }

    /// A noisy neighbor gets evicted when it runs at twice its envelope.
    pub fn should_evict(&self, id: &TenantId) -> bool {
        let state = self.state(id);
        let state = state.lock();
        let quotas = state.tier.quotas();
        state.measurements.cpu_percent > 2.0 * quotas.cpu_percent
            || state.measurements.database_mb > 2.0 * quotas.database_mb
    }

    /// Evaluation pass, run by the worker's collector loop. Reclassifies
    /// tiers, tracks spikes, and fires callbacks off-thread.
    pub fn evaluate(&self, id: &TenantId) {
        let at = now();
        let state_arc = self.state(id);
        let mut state = state_arc.lock();

        // Tier classification with the 24h no-downgrade window.
        let measured_tier = classify(&state.measurements);
        let old_tier = state.tier;
        let downgrade_allowed = at - state.tier_since >= TIER_DOWNGRADE_WINDOW;
        let new_tier = if measured_tier > old_tier {
            measured_tier
        } else if measured_tier < old_tier && downgrade_allowed {
            measured_tier
        } else {
            old_tier
        };
        if new_tier != old_tier {
            info!(tenant = %id, from = %old_tier, to = %new_tier, "tier change");
            state.tier = new_tier;
            state.tier_since = at;
            self.fire_tier_change(id, old_tier, new_tier);
        }

        // Spike tracking and the sustained-spike upgrade proposal.
        if Self::spiking_locked(&mut state, at) {
            let started = *state.spike_started.get_or_insert(at);
            if at - started >= SPIKE_UPGRADE_AFTER && !state.upgrade_proposed {
                if let Some(next) = state.tier.next_up() {
                    warn!(tenant = %id, "sustained spike, proposing tier upgrade");
                    state.upgrade_proposed = true;
                    self.fire_tier_change(id, state.tier, next);
                }
            }
        } else {
            state.spike_started = None;
            state.upgrade_proposed = false;
        }

        // Hotspot and hard violations.
        let quotas = state.tier.quotas();
        let m = state.measurements;
        drop(state);

        if self.is_hotspot(id) {
            debug!(tenant = %id, "hotspot detected");
            self.fire_hotspot(id, &m);
        }
        if m.cpu_percent > quotas.cpu_percent {
            self.fire_violation(id, "cpu", m.cpu_percent, quotas.cpu_percent);
        }
        if m.memory_mb > quotas.memory_mb {
            self.fire_violation(id, "memory", m.memory_mb, quotas.memory_mb);
        }
        if m.database_mb > quotas.database_mb {
            self.fire_violation(id, "database", m.database_mb, quotas.database_mb);
        }
    }

    pub fn tracked_tenants(&self) -> Vec<TenantId> {
        self.tenants.iter().map(|e| e.key().clone()).collect()
    }

    /// Advance every tenant's windows past elapsed slots; run by the
    /// worker's minute rotator so idle tenants decay without traffic.
    pub fn rotate_windows(&self) {
        let at = now();
        for entry in self.tenants.iter() {
            let mut state = entry.value().lock();
            state.rpm.sum(at);
            state.daily.sum(at);
            state.errors.sum(at);
        }
    }

    fn fire_hotspot(&self, id: &TenantId, m: &TenantMeasurements) {
        if let Some(cb) = self.callbacks.read().on_hotspot.clone() {
            let id = id.clone();
            let m = *m;
            tokio::spawn(async move { cb(&id, &m) });
        }
    }

    fn fire_tier_change(&self, id: &TenantId, old: TenantTier, new: TenantTier) {
        if let Some(cb) = self.callbacks.read().on_tier_change.clone() {
            let id = id.clone();
            tokio::spawn(async move { cb(&id, old, new) });
        }
    }

    fn fire_violation(&self, id: &TenantId, kind: &'static str, current: f64, limit: f64) {
        if let Some(cb) = self.callbacks.read().on_quota_violation.clone() {
            let id = id.clone();
            tokio::spawn(async move { cb(&id, kind, current, limit) });
        }
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager_with(id: &str, sample: ResourceSample) -> (ResourceManager, TenantId) {
        let manager = ResourceManager::new();
        let id: TenantId = id.to_string();
        manager.track(&id, TenantTier::Micro);
        manager.observe(&id, sample);
        (manager, id)
    }

    #[tokio::test]
    async fn test_upgrade_is_immediate() {
        let (manager, id) = manager_with(
            "ten_1",
            ResourceSample {
                database_mb: 50.0, // over micro's 10 MB
                memory_mb: 30.0,
                cpu_percent: 2.0,
                ..Default::default()
            },
        );
        manager.evaluate(&id);
        assert_eq!(manager.tier(&id), TenantTier::Small);
    }

    #[tokio::test]
    async fn test_no_downgrade_within_window() {
        let (manager, id) = manager_with(
            "ten_1",
            ResourceSample {
                database_mb: 50.0,
                ..Default::default()
            },
        );
        manager.evaluate(&id);
        assert_eq!(manager.tier(&id), TenantTier::Small);

        // Load drops back to micro levels, but the tier was just set.
        manager.observe(
            &id,
            ResourceSample {
                database_mb: 1.0,
                ..Default::default()
            },
        );
        manager.evaluate(&id);
        assert_eq!(manager.tier(&id), TenantTier::Small);
    }

    #[tokio::test]
    async fn test_hotspot_score_and_flag() {
        let (manager, id) = manager_with(
            "ten_1",
            ResourceSample {
                database_mb: 9.0,  // 0.9 of micro db
                memory_mb: 45.0,   // 0.9 of micro memory
                cpu_percent: 4.5,  // 0.9 of micro cpu
                ..Default::default()
            },
        );
        // 0.25*0.9 + 0.25*0 + 0.30*0.9 + 0.20*0.9 = 0.675
        assert!(!manager.is_hotspot(&id));
        manager.observe(
            &id,
            ResourceSample {
                database_mb: 10.0,
                memory_mb: 50.0,
                cpu_percent: 5.0,
                ..Default::default()
            },
        );
        // 0.25 + 0.30 + 0.20 = 0.75 > 0.7
        assert!(manager.is_hotspot(&id));
    }

    #[tokio::test]
    async fn test_should_evict_on_double_quota() {
        let (manager, id) = manager_with(
            "ten_1",
            ResourceSample {
                cpu_percent: 11.0, // > 2 * micro's 5%
                ..Default::default()
            },
        );
        assert!(manager.should_evict(&id));
    }

    #[tokio::test]
    async fn test_violation_callback_fires() {
        let (manager, id) = manager_with(
            "ten_1",
            ResourceSample {
                memory_mb: 60.0, // over micro's 50 MB
                ..Default::default()
            },
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        manager.on_quota_violation(Arc::new(move |_, kind, _, _| {
            if kind == "memory" {
                h.fetch_add(1, Ordering::SeqCst);
            }
        }));
        manager.evaluate(&id);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
