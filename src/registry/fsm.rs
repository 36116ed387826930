// State machine adapter between the command log and the local KV.
//
// The log hands over raw command bytes; this is the only place they are
// decoded. Apply must be deterministic: every timestamp comes from the
// command payload, never from the applying peer's clock, so replicas
// converge byte-for-byte. Deterministic rejections (duplicate domain, spent
// token) are normal outcomes returned to the submitter; only infrastructure
// failures are fatal to a peer.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{PlatformError, Result};
use crate::registry::commands::RaftCommand;
use crate::registry::keys;
use crate::registry::kv::{KvEngine, KvOp};
use crate::registry::snapshot::{self, SnapshotLoader};
use crate::registry::types::{Tenant, TenantStatus, VerificationToken};

/// Contract the log engine drives. The engine owns the FSM; storage reaches
/// the engine only through the injected command-log interface.
pub trait StateMachine: Send + Sync {
    /// Apply one committed command. Returns an optional response payload
    /// for the submitting peer.
    fn apply(&self, command: &[u8]) -> Result<Option<Value>>;

    /// Serialize the full state image.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace state with a snapshot image.
    fn restore(&self, bytes: &[u8]) -> Result<()>;
}

/// True for apply errors that occur identically on every replica and are
/// surfaced to the submitter instead of crashing the peer.
pub fn is_deterministic_rejection(err: &PlatformError) -> bool {
    matches!(
        err,
        PlatformError::AlreadyExists(_)
            | PlatformError::NotFound(_)
            | PlatformError::TokenInvalid
            | PlatformError::InvalidInput(_)
    )
}

pub struct RegistryFsm {
    kv: Arc<KvEngine>,
    node_id: String,
    loader: SnapshotLoader,
}

impl RegistryFsm {
    pub fn new(kv: Arc<KvEngine>, node_id: impl Into<String>) -> Self {
        Self {
            kv,
            node_id: node_id.into(),
            loader: SnapshotLoader::new(),
        }
    }

    pub fn kv(&self) -> &Arc<KvEngine> {
        &self.kv
    }

    fn get_tenant(&self, id: &str) -> Result<Tenant> {
        let bytes = self
            .kv
            .get(&keys::tenant(&id.to_string()))
            .ok_or_else(|| PlatformError::NotFound(format!("tenant {}", id)))?;
        serde_json::from_slice(&bytes).map_err(|e| PlatformError::Serialization(e.to_string()))
    }

    fn apply_command(&self, cmd: RaftCommand) -> Result<Option<Value>> {
        match cmd {
            RaftCommand::CreateTenant { tenant } => {
                let id_key = keys::tenant(&tenant.id);
                let domain_key = keys::tenant_domain(&tenant.domain);
                if self.kv.contains(&id_key) {
                    return Err(PlatformError::AlreadyExists(format!("tenant {}", tenant.id)));
                }
                if self.kv.contains(&domain_key) {
                    return Err(PlatformError::AlreadyExists(format!(
                        "domain {}",
                        tenant.domain
                    )));
                }
                let value = encode(&tenant)?;
                self.kv.apply_batch(vec![
                    KvOp::put(id_key, value),
                    KvOp::put(domain_key, tenant.id.clone().into_bytes()),
                ])?;
                Ok(None)
            }

            RaftCommand::UpdateTenant { tenant } => {
                let existing = self.get_tenant(&tenant.id)?;
                let mut ops = Vec::new();
                if existing.domain != tenant.domain {
                    let new_domain_key = keys::tenant_domain(&tenant.domain);
                    if self.kv.contains(&new_domain_key) {
                        return Err(PlatformError::AlreadyExists(format!(
                            "domain {}",
                            tenant.domain
                        )));
                    }
                    ops.push(KvOp::delete(keys::tenant_domain(&existing.domain)));
                    ops.push(KvOp::put(new_domain_key, tenant.id.clone().into_bytes()));
                }
                ops.push(KvOp::put(keys::tenant(&tenant.id), encode(&tenant)?));
                self.kv.apply_batch(ops)?;
                Ok(None)
            }

            RaftCommand::UpdateTenantStatus {
                tenant_id,
                status,
                updated,
            } => {
                let mut tenant = self.get_tenant(&tenant_id)?;
                if tenant.status == status {
                    // Idempotent: re-applying the same transition changes
                    // nothing, including the updated timestamp.
                    return Ok(None);
                }
                tenant.status = status;
                if let Some(ts) = updated {
                    tenant.updated = ts;
                }
                let mut ops = vec![KvOp::put(keys::tenant(&tenant_id), encode(&tenant)?)];
                if status == TenantStatus::Deleted {
                    // A deleted tenant keeps its metadata but drops out of
                    // domain resolution and placement.
                    ops.push(KvOp::delete(keys::tenant_domain(&tenant.domain)));
                    ops.push(KvOp::delete(keys::placement(&tenant_id)));
                }
                self.kv.apply_batch(ops)?;
                Ok(None)
            }

            RaftCommand::CreateUser { user } => {
                let id_key = keys::user(&user.id);
                let email_key = keys::user_email(&user.email);
                if self.kv.contains(&id_key) {
                    return Err(PlatformError::AlreadyExists(format!("user {}", user.id)));
                }
                if self.kv.contains(&email_key) {
                    return Err(PlatformError::AlreadyExists(format!("email {}", user.email)));
                }
                let value = encode(&user)?;
                self.kv.apply_batch(vec![
                    KvOp::put(id_key, value),
                    KvOp::put(email_key, user.id.clone().into_bytes()),
                ])?;
                Ok(None)
            }

            RaftCommand::UpdateUser { user } => {
                let existing_bytes = self
                    .kv
                    .get(&keys::user(&user.id))
                    .ok_or_else(|| PlatformError::NotFound(format!("user {}", user.id)))?;
                let existing: crate::registry::types::ClusterUser =
                    serde_json::from_slice(&existing_bytes)
                        .map_err(|e| PlatformError::Serialization(e.to_string()))?;
                let mut ops = Vec::new();
                if existing.email != user.email {
                    let new_email_key = keys::user_email(&user.email);
                    if self.kv.contains(&new_email_key) {
                        return Err(PlatformError::AlreadyExists(format!(
                            "email {}",
                            user.email
                        )));
                    }
                    ops.push(KvOp::delete(keys::user_email(&existing.email)));
                    ops.push(KvOp::put(new_email_key, user.id.clone().into_bytes()));
                }
                ops.push(KvOp::put(keys::user(&user.id), encode(&user)?));
                self.kv.apply_batch(ops)?;
                Ok(None)
            }

            RaftCommand::SaveNode { node } => {
                self.kv.put(keys::node(&node.id), encode(&node)?)?;
                Ok(None)
            }

            RaftCommand::SavePlacement { decision } => {
                // The decision also rewrites the tenant's assignment so both
                // land in one apply step.
                let mut tenant = self.get_tenant(&decision.tenant_id)?;
                tenant.assigned_node_id = Some(decision.node_id.clone());
                tenant.assigned_at = Some(decision.decided_at);
                tenant.updated = decision.decided_at;
                self.kv.apply_batch(vec![
                    KvOp::put(keys::placement(&decision.tenant_id), encode(&decision)?),
                    KvOp::put(keys::tenant(&decision.tenant_id), encode(&tenant)?),
                ])?;
                Ok(None)
            }

            RaftCommand::SaveActivity { activity } => {
                self.kv
                    .put(keys::activity(&activity.tenant_id), encode(&activity)?)?;
                Ok(None)
            }

            RaftCommand::SaveToken { token } => {
                let ttl = token.expires - token.created;
                self.kv
                    .put_with_ttl(keys::token(&token.token), encode(&token)?, ttl)?;
                Ok(None)
            }

            RaftCommand::MarkTokenUsed { token } => {
                let key = keys::token(&token);
                let bytes = self.kv.get(&key).ok_or(PlatformError::TokenInvalid)?;
                let mut record: VerificationToken = serde_json::from_slice(&bytes)
                    .map_err(|e| PlatformError::Serialization(e.to_string()))?;
                if record.used || record.is_expired(crate::common::now()) {
                    return Err(PlatformError::TokenInvalid);
                }
                record.used = true;
                let remaining = record.expires - crate::common::now();
                self.kv.put_with_ttl(key, encode(&record)?, remaining)?;
                let value = serde_json::to_value(&record)
                    .map_err(|e| PlatformError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
        }
    }
}

impl StateMachine for RegistryFsm {
    fn apply(&self, command: &[u8]) -> Result<Option<Value>> {
        let cmd = RaftCommand::decode(command)?;
        debug!(kind = cmd.kind(), "applying command");
        self.apply_command(cmd)
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        snapshot::build(&self.kv.export_all(), &self.node_id)
    }

    fn restore(&self, bytes: &[u8]) -> Result<()> {
        let entries = self.loader.load(bytes)?;
        self.kv.clear_and_load(entries)
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| PlatformError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::types::{ClusterUser, NodeInfo, PlacementDecision};
    use chrono::Duration;

    fn fsm() -> RegistryFsm {
        RegistryFsm::new(Arc::new(KvEngine::new("/tmp/hivedb-fsm-test")), "cp-1")
    }

    fn apply(fsm: &RegistryFsm, cmd: RaftCommand) -> Result<Option<Value>> {
        fsm.apply(&cmd.encode().unwrap())
    }

    #[test]
    fn test_create_tenant_writes_both_indexes() {
        let fsm = fsm();
        let tenant = Tenant::new("ten_1", "t1.example.com", "u_1");
        apply(&fsm, RaftCommand::CreateTenant { tenant }).unwrap();
        assert!(fsm.kv().contains("tenant:ten_1"));
        assert_eq!(
            fsm.kv().get("tenant_domain:t1.example.com"),
            Some(b"ten_1".to_vec())
        );
    }

    #[test]
    fn test_duplicate_domain_rejected() {
        let fsm = fsm();
        apply(
            &fsm,
            RaftCommand::CreateTenant {
                tenant: Tenant::new("ten_1", "t1.example.com", "u_1"),
            },
        )
        .unwrap();
        let err = apply(
            &fsm,
            RaftCommand::CreateTenant {
                tenant: Tenant::new("ten_2", "t1.example.com", "u_1"),
            },
        )
        .unwrap_err();
        assert!(matches!(err, PlatformError::AlreadyExists(_)));
        assert!(is_deterministic_rejection(&err));
    }

    #[test]
    fn test_delete_removes_domain_index_keeps_record() {
        let fsm = fsm();
        apply(
            &fsm,
            RaftCommand::CreateTenant {
                tenant: Tenant::new("ten_1", "t1.example.com", "u_1"),
            },
        )
        .unwrap();
        apply(
            &fsm,
            RaftCommand::UpdateTenantStatus {
                tenant_id: "ten_1".to_string(),
                status: TenantStatus::Deleted,
                updated: Some(crate::common::now()),
            },
        )
        .unwrap();
        assert!(fsm.kv().contains("tenant:ten_1"));
        assert!(!fsm.kv().contains("tenant_domain:t1.example.com"));
    }

    #[test]
    fn test_status_update_is_idempotent() {
        let fsm = fsm();
        apply(
            &fsm,
            RaftCommand::CreateTenant {
                tenant: Tenant::new("ten_1", "t1.example.com", "u_1"),
            },
        )
        .unwrap();
        let cmd = RaftCommand::UpdateTenantStatus {
            tenant_id: "ten_1".to_string(),
            status: TenantStatus::Active,
            updated: Some(crate::common::now()),
        };
        apply(&fsm, cmd.clone()).unwrap();
        let after_first = fsm.kv().get("tenant:ten_1").unwrap();
        apply(&fsm, cmd).unwrap();
        let after_second = fsm.kv().get("tenant:ten_1").unwrap();
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn test_token_consumed_once() {
        let fsm = fsm();
        apply(
            &fsm,
            RaftCommand::SaveToken {
                token: VerificationToken::new("abc", "u_1", "a@b.c", Duration::hours(24)),
            },
        )
        .unwrap();
        let first = apply(
            &fsm,
            RaftCommand::MarkTokenUsed {
                token: "abc".to_string(),
            },
        )
        .unwrap();
        assert_eq!(first.unwrap()["userId"], "u_1");
        let err = apply(
            &fsm,
            RaftCommand::MarkTokenUsed {
                token: "abc".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, PlatformError::TokenInvalid));
    }

    #[test]
    fn test_placement_updates_tenant_assignment() {
        let fsm = fsm();
        apply(
            &fsm,
            RaftCommand::CreateTenant {
                tenant: Tenant::new("ten_1", "t1.example.com", "u_1"),
            },
        )
        .unwrap();
        let decided_at = crate::common::now();
        apply(
            &fsm,
            RaftCommand::SavePlacement {
                decision: PlacementDecision {
                    tenant_id: "ten_1".to_string(),
                    node_id: "n_a".to_string(),
                    node_address: "http://10.0.0.5:8091".to_string(),
                    reason: "least-loaded".to_string(),
                    decided_at,
                },
            },
        )
        .unwrap();
        let tenant: Tenant =
            serde_json::from_slice(&fsm.kv().get("tenant:ten_1").unwrap()).unwrap();
        assert_eq!(tenant.assigned_node_id.as_deref(), Some("n_a"));
        assert_eq!(tenant.assigned_at, Some(decided_at));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let fsm = fsm();
        apply(
            &fsm,
            RaftCommand::CreateTenant {
                tenant: Tenant::new("ten_1", "t1.example.com", "u_1"),
            },
        )
        .unwrap();
        apply(
            &fsm,
            RaftCommand::SaveNode {
                node: NodeInfo::new("n_a", "http://10.0.0.5:8091", 100),
            },
        )
        .unwrap();
        let image = fsm.snapshot().unwrap();
        let before = fsm.kv().export_all();

        let other = RegistryFsm::new(Arc::new(KvEngine::new("/tmp/hivedb-fsm-test2")), "cp-2");
        other.kv().put("stale", b"x".to_vec()).unwrap();
        other.restore(&image).unwrap();
        assert_eq!(other.kv().export_all(), before);
    }

    #[test]
    fn test_email_uniqueness() {
        let fsm = fsm();
        apply(
            &fsm,
            RaftCommand::CreateUser {
                user: ClusterUser::new("u_1", "a@b.c", "hash"),
            },
        )
        .unwrap();
        let err = apply(
            &fsm,
            RaftCommand::CreateUser {
                user: ClusterUser::new("u_2", "a@b.c", "hash"),
            },
        )
        .unwrap_err();
        assert!(matches!(err, PlatformError::AlreadyExists(_)));
    }
}
