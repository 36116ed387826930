// Tenant tiering and resource tracking on the worker.

pub mod manager;
pub mod tiers;
pub mod windows;

pub use manager::{ResourceManager, ResourceSample};
pub use tiers::{classify, tier_for_quotas, TenantMeasurements, TenantTier, TierQuotas, ALL_TIERS};
pub use windows::SlidingWindow;
