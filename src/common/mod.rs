// Shared identifiers and primitives used across the platform.

pub mod tasks;

use chrono::{DateTime, Utc};

/// Stable textual tenant identity.
pub type TenantId = String;

/// Stable textual user identity.
pub type UserId = String;

/// Stable textual worker/control-plane node identity.
pub type NodeId = String;

/// Current UTC instant. All persisted timestamps go through this.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Epoch milliseconds for wire envelopes.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
