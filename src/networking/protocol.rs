// IPC message envelopes.
//
// Every payload is a tagged sum type keyed on `type`; nothing on the wire
// is a free-form map. Request/reply carries control-plane queries and CRUD
// from workers and gateways; broadcasts fan out advisory events that
// subscribers answer by re-reading authoritative state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::common::{now_millis, NodeId, TenantId};
use crate::error::{PlatformError, Result};
use crate::registry::types::{NodeInfo, ResourceSnapshot, Tenant, TenantActivity, TenantStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum RequestPayload {
    GetTenant {
        tenant_id: TenantId,
    },
    GetTenantByDomain {
        domain: String,
    },
    AssignTenant {
        tenant_id: TenantId,
    },
    RegisterNode {
        node: NodeInfo,
    },
    Heartbeat {
        node_id: NodeId,
        active_tenants: u32,
        resources: ResourceSnapshot,
    },
    CreateTenant {
        tenant: Tenant,
    },
    UpdateTenantStatus {
        tenant_id: TenantId,
        status: TenantStatus,
    },
    SaveActivity {
        activity: TenantActivity,
    },
    GetPlacement {
        tenant_id: TenantId,
    },
    GetNode {
        node_id: NodeId,
    },
    /// Upgrade this connection to a broadcast stream.
    Subscribe {
        topics: Vec<String>,
    },
}

impl RequestPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestPayload::GetTenant { .. } => "getTenant",
            RequestPayload::GetTenantByDomain { .. } => "getTenantByDomain",
            RequestPayload::AssignTenant { .. } => "assignTenant",
            RequestPayload::RegisterNode { .. } => "registerNode",
            RequestPayload::Heartbeat { .. } => "heartbeat",
            RequestPayload::CreateTenant { .. } => "createTenant",
            RequestPayload::UpdateTenantStatus { .. } => "updateTenantStatus",
            RequestPayload::SaveActivity { .. } => "saveActivity",
            RequestPayload::GetPlacement { .. } => "getPlacement",
            RequestPayload::GetNode { .. } => "getNode",
            RequestPayload::Subscribe { .. } => "subscribe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    #[serde(flatten)]
    pub request: RequestPayload,
    pub request_id: String,
    pub timestamp: i64,
}

impl RequestEnvelope {
    pub fn new(request: RequestPayload) -> Self {
        Self {
            request,
            request_id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| PlatformError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| PlatformError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set on not-leader failures so the client can redirect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_addr: Option<String>,
    pub request_id: String,
    pub timestamp: i64,
}

impl ReplyEnvelope {
    pub fn ok(request_id: &str, data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            leader_addr: None,
            request_id: request_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn err(request_id: &str, error: &PlatformError) -> Self {
        let leader_addr = match error {
            PlatformError::NotLeader { leader_addr } => leader_addr.clone(),
            _ => None,
        };
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            leader_addr,
            request_id: request_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| PlatformError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| PlatformError::Serialization(e.to_string()))
    }

    /// Turn a failed reply back into a typed error on the client side.
    pub fn into_result(self) -> Result<Option<Value>> {
        if self.success {
            return Ok(self.data);
        }
        let message = self.error.unwrap_or_else(|| "unknown error".to_string());
        if self.leader_addr.is_some() {
            return Err(PlatformError::NotLeader {
                leader_addr: self.leader_addr,
            });
        }
        if message.starts_with("not found") {
            return Err(PlatformError::NotFound(message));
        }
        if message.starts_with("already exists") {
            return Err(PlatformError::AlreadyExists(message));
        }
        if message.starts_with("no capacity") {
            return Err(PlatformError::NoCapacity(message));
        }
        Err(PlatformError::Network(message))
    }
}

/// Best-effort broadcast topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BroadcastEvent {
    #[serde(rename = "tenant.migrating")]
    TenantMigrating {
        tenant_id: TenantId,
        from_node: NodeId,
        to_node: NodeId,
    },
    #[serde(rename = "node.down")]
    NodeDown { node_id: NodeId },
    #[serde(rename = "routing.invalidate")]
    RoutingInvalidate { tenant_id: Option<TenantId> },
}

impl BroadcastEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            BroadcastEvent::TenantMigrating { .. } => "tenant.migrating",
            BroadcastEvent::NodeDown { .. } => "node.down",
            BroadcastEvent::RoutingInvalidate { .. } => "routing.invalidate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: BroadcastEvent,
    pub timestamp: i64,
}

impl EventEnvelope {
    pub fn new(event: BroadcastEvent) -> Self {
        Self {
            event,
            timestamp: now_millis(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| PlatformError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| PlatformError::Serialization(e.to_string()))
    }
}
