// Tenant tiers and their quota envelopes.

use serde::{Deserialize, Serialize};

/// Service tier, ordered smallest to largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantTier {
    Micro,
    Small,
    Medium,
    Large,
    Enterprise,
}

pub const ALL_TIERS: [TenantTier; 5] = [
    TenantTier::Micro,
    TenantTier::Small,
    TenantTier::Medium,
    TenantTier::Large,
    TenantTier::Enterprise,
];

/// Per-tier resource envelope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierQuotas {
    pub database_mb: f64,
    pub requests_per_day: u64,
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

impl TenantTier {
    /// Weight used by the worker cache's weighted admission.
    pub fn weight(&self) -> u32 {
        match self {
            TenantTier::Micro => 1,
            TenantTier::Small => 2,
            TenantTier::Medium => 5,
            TenantTier::Large => 10,
            TenantTier::Enterprise => 20,
        }
    }

    pub fn quotas(&self) -> TierQuotas {
        match self {
            TenantTier::Micro => TierQuotas {
                database_mb: 10.0,
                requests_per_day: 1_000,
                memory_mb: 50.0,
                cpu_percent: 5.0,
            },
            TenantTier::Small => TierQuotas {
                database_mb: 100.0,
                requests_per_day: 10_000,
                memory_mb: 200.0,
                cpu_percent: 10.0,
            },
            TenantTier::Medium => TierQuotas {
                database_mb: 1_000.0,
                requests_per_day: 100_000,
                memory_mb: 1_024.0,
                cpu_percent: 25.0,
            },
            TenantTier::Large => TierQuotas {
                database_mb: 5_000.0,
                requests_per_day: 1_000_000,
                memory_mb: 4_096.0,
                cpu_percent: 50.0,
            },
            TenantTier::Enterprise => TierQuotas {
                database_mb: 50_000.0,
                requests_per_day: 10_000_000,
                memory_mb: 16_384.0,
                cpu_percent: 100.0,
            },
        }
    }

    pub fn next_up(&self) -> Option<TenantTier> {
        match self {
            TenantTier::Micro => Some(TenantTier::Small),
            TenantTier::Small => Some(TenantTier::Medium),
            TenantTier::Medium => Some(TenantTier::Large),
            TenantTier::Large => Some(TenantTier::Enterprise),
            TenantTier::Enterprise => None,
        }
    }
}

impl std::fmt::Display for TenantTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TenantTier::Micro => "micro",
            TenantTier::Small => "small",
            TenantTier::Medium => "medium",
            TenantTier::Large => "large",
            TenantTier::Enterprise => "enterprise",
        };
        write!(f, "{}", s)
    }
}

/// Measured load for one tenant, refreshed by the collectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantMeasurements {
    pub database_mb: f64,
    pub requests_24h: u64,
    /// Peak requests per minute over the sliding 60-minute window.
    pub peak_rpm: u64,
    pub avg_query_ms: f64,
    /// Errors / requests over the last rolling hour.
    pub error_rate: f64,
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub io_ops_per_sec: f64,
}

impl TenantMeasurements {
    /// True when every measurement fits inside the tier's envelope.
    pub fn fits(&self, quotas: &TierQuotas) -> bool {
        self.database_mb <= quotas.database_mb
            && self.requests_24h <= quotas.requests_per_day
            && self.memory_mb <= quotas.memory_mb
            && self.cpu_percent <= quotas.cpu_percent
    }
}

/// The smallest tier whose quotas envelope the measurements.
pub fn classify(measurements: &TenantMeasurements) -> TenantTier {
    for tier in ALL_TIERS {
        if measurements.fits(&tier.quotas()) {
            return tier;
        }
    }
    TenantTier::Enterprise
}

/// Initial tier for a tenant that has no measurements yet, derived from
/// its configured quotas.
pub fn tier_for_quotas(storage_quota_mb: u64, requests_per_day: u64) -> TenantTier {
    for tier in ALL_TIERS {
        let q = tier.quotas();
        if storage_quota_mb as f64 <= q.database_mb && requests_per_day <= q.requests_per_day {
            return tier;
        }
    }
    TenantTier::Enterprise
}
