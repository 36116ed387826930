// Records owned by the replicated metadata store.
//
// Everything here is serialized to JSON both on the wire and inside the KV,
// so field names follow the wire convention (camelCase) and every record
// carries its own identity.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{now, NodeId, TenantId, UserId};

/// Tenant lifecycle status.
///
/// created -> assigning -> deploying -> active <-> idle -> (evicted) ->
/// archived -> deleted. Only active <-> idle is reversible without a load
/// from the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Created,
    Assigning,
    Deploying,
    Active,
    Idle,
    Evicted,
    Archived,
    Deleted,
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TenantStatus::Created => "created",
            TenantStatus::Assigning => "assigning",
            TenantStatus::Deploying => "deploying",
            TenantStatus::Active => "active",
            TenantStatus::Idle => "idle",
            TenantStatus::Evicted => "evicted",
            TenantStatus::Archived => "archived",
            TenantStatus::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: TenantId,
    pub domain: String,
    pub owner_user_id: UserId,
    pub status: TenantStatus,
    pub storage_quota_mb: u64,
    /// Allowed API requests per day.
    pub api_requests_quota: u64,
    pub storage_used_mb: u64,
    pub api_requests_today: u64,
    pub assigned_node_id: Option<NodeId>,
    pub assigned_at: Option<DateTime<Utc>>,
    /// Object-store location of this tenant's data.
    pub bucket: String,
    pub prefix: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Tenant {
    pub fn new(id: impl Into<TenantId>, domain: impl Into<String>, owner: impl Into<UserId>) -> Self {
        let ts = now();
        let id = id.into();
        Self {
            prefix: format!("tenants/{}", id),
            id,
            domain: domain.into(),
            owner_user_id: owner.into(),
            status: TenantStatus::Created,
            storage_quota_mb: 100,
            api_requests_quota: 10_000,
            storage_used_mb: 0,
            api_requests_today: 0,
            assigned_node_id: None,
            assigned_at: None,
            bucket: String::new(),
            created: ts,
            updated: ts,
        }
    }

    pub fn touch(&mut self) {
        self.updated = now();
    }

    /// Deleted tenants keep their metadata but never appear in listings or
    /// placement.
    pub fn is_listed(&self) -> bool {
        self.status != TenantStatus::Deleted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterUser {
    pub id: UserId,
    pub email: String,
    pub password_hash: String,
    pub verified: bool,
    /// Ceiling on tenants this user may own.
    pub max_tenants: u32,
    pub default_storage_quota_mb: u64,
    pub default_api_requests_quota: u64,
    pub last_login: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl ClusterUser {
    pub fn new(id: impl Into<UserId>, email: impl Into<String>, password_hash: impl Into<String>) -> Self {
        let ts = now();
        Self {
            id: id.into(),
            email: email.into(),
            password_hash: password_hash.into(),
            verified: false,
            max_tenants: 5,
            default_storage_quota_mb: 100,
            default_api_requests_quota: 10_000,
            last_login: None,
            created: ts,
            updated: ts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Draining,
}

/// Most recent resource readings a node reported with its heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub cpu_frac: f64,
    pub mem_frac: f64,
    pub disk_used_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    pub status: NodeStatus,
    /// Capacity in weighted tenant units.
    pub capacity: u32,
    pub active_tenants: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub resources: ResourceSnapshot,
}

impl NodeInfo {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            status: NodeStatus::Online,
            capacity,
            active_tenants: 0,
            last_heartbeat: now(),
            resources: ResourceSnapshot::default(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    /// Heartbeat older than `timeout` means the node is presumed dead.
    pub fn heartbeat_stale(&self, timeout: Duration, at: DateTime<Utc>) -> bool {
        at - self.last_heartbeat > timeout
    }
}

/// The latest decision for a tenant is the authoritative assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementDecision {
    pub tenant_id: TenantId,
    pub node_id: NodeId,
    pub node_address: String,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

/// Activity tier governing where a tenant's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Hot,
    Warm,
    Cold,
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageTier::Hot => write!(f, "hot"),
            StorageTier::Warm => write!(f, "warm"),
            StorageTier::Cold => write!(f, "cold"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantActivity {
    pub tenant_id: TenantId,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
    pub storage_tier: StorageTier,
    pub requests_24h: u64,
    pub requests_7d: u64,
    pub archive_date: Option<DateTime<Utc>>,
    pub restore_count: u32,
    pub last_restore: Option<DateTime<Utc>>,
}

impl TenantActivity {
    pub fn new(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            last_access: now(),
            access_count: 0,
            storage_tier: StorageTier::Hot,
            requests_24h: 0,
            requests_7d: 0,
            archive_date: None,
            restore_count: 0,
            last_restore: None,
        }
    }

    pub fn idle_for(&self, at: DateTime<Utc>) -> Duration {
        at - self.last_access
    }
}

/// Single-use email verification token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationToken {
    pub token: String,
    pub user_id: UserId,
    pub email: String,
    pub expires: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub used: bool,
}

impl VerificationToken {
    pub fn new(
        token: impl Into<String>,
        user_id: impl Into<UserId>,
        email: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let ts = now();
        Self {
            token: token.into(),
            user_id: user_id.into(),
            email: email.into(),
            expires: ts + ttl,
            created: ts,
            used: false,
        }
    }

    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        at >= self.expires
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_defaults() {
        let t = Tenant::new("ten_1", "t1.example.com", "u_1");
        assert_eq!(t.status, TenantStatus::Created);
        assert_eq!(t.prefix, "tenants/ten_1");
        assert!(t.assigned_node_id.is_none());
        assert!(t.is_listed());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let s = serde_json::to_string(&TenantStatus::Assigning).unwrap();
        assert_eq!(s, "\"assigning\"");
    }

    #[test]
    fn test_token_expiry() {
        let tok = VerificationToken::new("abc", "u_1", "a@b.c", Duration::hours(24));
        assert!(!tok.is_expired(now()));
        assert!(tok.is_expired(now() + Duration::hours(25)));
    }

    #[test]
    fn test_heartbeat_staleness() {
        let mut n = NodeInfo::new("n_a", "http://10.0.0.5:8091", 100);
        assert!(!n.heartbeat_stale(Duration::seconds(30), now()));
        n.last_heartbeat = now() - Duration::seconds(120);
        assert!(n.heartbeat_stale(Duration::seconds(30), now()));
    }
}
