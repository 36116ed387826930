// Public surface of the replicated metadata store.
//
// Reads are served from the local KV with no log round-trip: stale on a
// lagging follower, read-your-writes on the leader. Every mutation is
// encoded as a RaftCommand and submitted through the injected command log;
// the FSM applies it after quorum commit (or synchronously in single-peer
// mode).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::clustering::CommandLog;
use crate::common::{now, NodeId, TenantId, UserId};
use crate::error::{PlatformError, Result};
use crate::registry::commands::RaftCommand;
use crate::registry::keys;
use crate::registry::kv::KvEngine;
use crate::registry::snapshot::{self, SnapshotLoader};
use crate::registry::types::{
    ClusterUser, NodeInfo, PlacementDecision, StorageTier, Tenant, TenantActivity, TenantStatus,
    VerificationToken,
};

pub struct MetadataStore {
    kv: Arc<KvEngine>,
    log: Arc<dyn CommandLog>,
    node_id: String,
}

impl MetadataStore {
    pub fn new(kv: Arc<KvEngine>, log: Arc<dyn CommandLog>, node_id: impl Into<String>) -> Self {
        Self {
            kv,
            log,
            node_id: node_id.into(),
        }
    }

    pub fn kv(&self) -> &Arc<KvEngine> {
        &self.kv
    }

    pub fn is_leader(&self) -> bool {
        self.log.is_leader()
    }

    pub fn leader_addr(&self) -> Option<String> {
        self.log.leader_addr()
    }

    fn read<T: DeserializeOwned>(&self, key: &str, what: &str) -> Result<T> {
        let bytes = self
            .kv
            .get(key)
            .ok_or_else(|| PlatformError::NotFound(what.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| PlatformError::Serialization(e.to_string()))
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Vec<T> {
        self.kv
            .scan_prefix(prefix)
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_slice(&v).ok())
            .collect()
    }

    // ---- tenants ----

    pub async fn create_tenant(&self, tenant: Tenant) -> Result<Tenant> {
        self.log
            .submit(RaftCommand::CreateTenant {
                tenant: tenant.clone(),
            })
            .await?;
        Ok(tenant)
    }

    pub async fn update_tenant(&self, mut tenant: Tenant) -> Result<Tenant> {
        tenant.touch();
        self.log
            .submit(RaftCommand::UpdateTenant {
                tenant: tenant.clone(),
            })
            .await?;
        Ok(tenant)
    }

    pub async fn update_tenant_status(&self, id: &TenantId, status: TenantStatus) -> Result<()> {
        self.log
            .submit(RaftCommand::UpdateTenantStatus {
                tenant_id: id.clone(),
                status,
                updated: Some(now()),
            })
            .await?;
        Ok(())
    }

    /// Deletion keeps the record as a tombstone; only the domain index and
    /// placement disappear.
    pub async fn delete_tenant(&self, id: &TenantId) -> Result<()> {
        self.update_tenant_status(id, TenantStatus::Deleted).await
    }

    pub fn get_tenant(&self, id: &TenantId) -> Result<Tenant> {
        self.read(&keys::tenant(id), &format!("tenant {}", id))
    }

    pub fn get_tenant_by_domain(&self, domain: &str) -> Result<Tenant> {
        let id_bytes = self
            .kv
            .get(&keys::tenant_domain(domain))
            .ok_or_else(|| PlatformError::NotFound(format!("domain {}", domain)))?;
        let id = String::from_utf8(id_bytes)
            .map_err(|e| PlatformError::Serialization(e.to_string()))?;
        self.get_tenant(&id)
    }

    pub fn list_tenants(
        &self,
        limit: usize,
        offset: usize,
        owner: Option<&UserId>,
    ) -> Vec<Tenant> {
        self.scan::<Tenant>(keys::TENANT_PREFIX)
            .into_iter()
            .filter(|t| t.is_listed())
            .filter(|t| owner.map_or(true, |o| &t.owner_user_id == o))
            .skip(offset)
            .take(limit)
            .collect()
    }

    // ---- users ----

    pub async fn create_user(&self, user: ClusterUser) -> Result<ClusterUser> {
        self.log
            .submit(RaftCommand::CreateUser { user: user.clone() })
            .await?;
        Ok(user)
    }

    pub async fn update_user(&self, mut user: ClusterUser) -> Result<ClusterUser> {
        user.updated = now();
        self.log
            .submit(RaftCommand::UpdateUser { user: user.clone() })
            .await?;
        Ok(user)
    }

    pub fn get_user(&self, id: &UserId) -> Result<ClusterUser> {
        self.read(&keys::user(id), &format!("user {}", id))
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<ClusterUser> {
        let id_bytes = self
            .kv
            .get(&keys::user_email(email))
            .ok_or_else(|| PlatformError::NotFound(format!("email {}", email)))?;
        let id = String::from_utf8(id_bytes)
            .map_err(|e| PlatformError::Serialization(e.to_string()))?;
        self.get_user(&id)
    }

    pub fn list_users(&self, limit: usize, offset: usize) -> Vec<ClusterUser> {
        self.scan::<ClusterUser>(keys::USER_PREFIX)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect()
    }

    // ---- nodes ----

    pub async fn save_node(&self, node: NodeInfo) -> Result<()> {
        self.log.submit(RaftCommand::SaveNode { node }).await?;
        Ok(())
    }

    pub fn get_node(&self, id: &NodeId) -> Result<NodeInfo> {
        self.read(&keys::node(id), &format!("node {}", id))
    }

    pub fn list_nodes(&self) -> Vec<NodeInfo> {
        self.scan(keys::NODE_PREFIX)
    }

    // ---- placement ----

    pub async fn save_placement(&self, decision: PlacementDecision) -> Result<()> {
        self.log
            .submit(RaftCommand::SavePlacement { decision })
            .await?;
        Ok(())
    }

    pub fn get_placement(&self, tenant_id: &TenantId) -> Result<PlacementDecision> {
        self.read(
            &keys::placement(tenant_id),
            &format!("placement for {}", tenant_id),
        )
    }

    // ---- activity ----

    pub async fn save_activity(&self, activity: TenantActivity) -> Result<()> {
        self.log
            .submit(RaftCommand::SaveActivity { activity })
            .await?;
        Ok(())
    }

    pub fn get_activity(&self, tenant_id: &TenantId) -> Result<TenantActivity> {
        self.read(
            &keys::activity(tenant_id),
            &format!("activity for {}", tenant_id),
        )
    }

    pub fn list_inactive_tenants(&self, since: DateTime<Utc>) -> Vec<TenantActivity> {
        self.scan::<TenantActivity>(keys::ACTIVITY_PREFIX)
            .into_iter()
            .filter(|a| a.last_access < since)
            .collect()
    }

    pub fn list_activities_by_tier(&self, tier: StorageTier) -> Vec<TenantActivity> {
        self.scan::<TenantActivity>(keys::ACTIVITY_PREFIX)
            .into_iter()
            .filter(|a| a.storage_tier == tier)
            .collect()
    }

    // ---- verification tokens ----

    pub async fn save_token(&self, token: VerificationToken) -> Result<()> {
        self.log.submit(RaftCommand::SaveToken { token }).await?;
        Ok(())
    }

    /// A spent or expired token reads as invalid, matching the atomic
    /// consumption path.
    pub fn get_token(&self, token: &str) -> Result<VerificationToken> {
        let bytes = self
            .kv
            .get(&keys::token(token))
            .ok_or(PlatformError::TokenInvalid)?;
        let record: VerificationToken = serde_json::from_slice(&bytes)
            .map_err(|e| PlatformError::Serialization(e.to_string()))?;
        if record.used || record.is_expired(now()) {
            return Err(PlatformError::TokenInvalid);
        }
        Ok(record)
    }

    /// Atomic check-and-consume. At most one caller ever gets the record.
    pub async fn use_verification_token(&self, token: &str) -> Result<VerificationToken> {
        let value = self
            .log
            .submit(RaftCommand::MarkTokenUsed {
                token: token.to_string(),
            })
            .await?
            .ok_or(PlatformError::TokenInvalid)?;
        serde_json::from_value(value).map_err(|e| PlatformError::Serialization(e.to_string()))
    }

    /// Legacy path; internally routed through the atomic consumption.
    pub async fn mark_token_used(&self, token: &str) -> Result<()> {
        self.use_verification_token(token).await.map(|_| ())
    }

    // ---- snapshots ----

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        snapshot::build(&self.kv.export_all(), &self.node_id)
    }

    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let entries = SnapshotLoader::new().load(bytes)?;
        self.kv.clear_and_load(entries)
    }
}
