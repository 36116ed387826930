// The replicated command set.
//
// A RaftCommand is the only mutator of the replicated KV. Commands travel
// through the log as opaque JSON bytes; the FSM adapter is the single place
// that decodes them.

use serde::{Deserialize, Serialize};

use crate::common::TenantId;
use crate::error::{PlatformError, Result};
use crate::registry::types::{
    ClusterUser, NodeInfo, PlacementDecision, Tenant, TenantActivity, TenantStatus,
    VerificationToken,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaftCommand {
    CreateTenant {
        tenant: Tenant,
    },
    UpdateTenant {
        tenant: Tenant,
    },
    UpdateTenantStatus {
        tenant_id: TenantId,
        status: TenantStatus,
        /// Supplied by the submitter so that apply stays deterministic
        /// across replicas.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated: Option<chrono::DateTime<chrono::Utc>>,
    },
    CreateUser {
        user: ClusterUser,
    },
    UpdateUser {
        user: ClusterUser,
    },
    SaveNode {
        node: NodeInfo,
    },
    SavePlacement {
        decision: PlacementDecision,
    },
    SaveActivity {
        activity: TenantActivity,
    },
    SaveToken {
        token: VerificationToken,
    },
    /// Atomic check-and-consume; also the internal route for the legacy
    /// non-atomic mark-used path.
    MarkTokenUsed {
        token: String,
    },
}

impl RaftCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| PlatformError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| PlatformError::Encode(e.to_string()))
    }

    /// Wire tag, used for tracing.
    pub fn kind(&self) -> &'static str {
        match self {
            RaftCommand::CreateTenant { .. } => "create_tenant",
            RaftCommand::UpdateTenant { .. } => "update_tenant",
            RaftCommand::UpdateTenantStatus { .. } => "update_tenant_status",
            RaftCommand::CreateUser { .. } => "create_user",
            RaftCommand::UpdateUser { .. } => "update_user",
            RaftCommand::SaveNode { .. } => "save_node",
            RaftCommand::SavePlacement { .. } => "save_placement",
            RaftCommand::SaveActivity { .. } => "save_activity",
            RaftCommand::SaveToken { .. } => "save_token",
            RaftCommand::MarkTokenUsed { .. } => "mark_token_used",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_encode_decode_round_trip() {
        let commands = vec![
            RaftCommand::CreateTenant {
                tenant: Tenant::new("ten_1", "t1.example.com", "u_1"),
            },
            RaftCommand::UpdateTenantStatus {
                tenant_id: "ten_1".to_string(),
                status: TenantStatus::Active,
                updated: Some(crate::common::now()),
            },
            RaftCommand::SaveNode {
                node: NodeInfo::new("n_a", "http://10.0.0.5:8091", 100),
            },
            RaftCommand::SaveToken {
                token: VerificationToken::new("abc", "u_1", "a@b.c", Duration::hours(24)),
            },
            RaftCommand::MarkTokenUsed {
                token: "abc".to_string(),
            },
        ];
        for cmd in commands {
            let bytes = cmd.encode().unwrap();
            let decoded = RaftCommand::decode(&bytes).unwrap();
            assert_eq!(cmd, decoded);
        }
    }

    #[test]
    fn test_wire_tag_is_snake_case() {
        let cmd = RaftCommand::UpdateTenantStatus {
            tenant_id: "ten_1".to_string(),
            status: TenantStatus::Idle,
            updated: None,
        };
        let v: serde_json::Value = serde_json::from_slice(&cmd.encode().unwrap()).unwrap();
        assert_eq!(v["type"], "update_tenant_status");
        assert_eq!(v["status"], "idle");
    }
}
