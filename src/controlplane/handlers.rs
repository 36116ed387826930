// Request/reply dispatch for the control-plane IPC surface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::common::now;
use crate::error::{PlatformError, Result};
use crate::networking::protocol::RequestPayload;
use crate::networking::RequestHandler;
use crate::placement::PlacementService;
use crate::registry::types::NodeStatus;
use crate::registry::MetadataStore;

pub struct ControlPlaneHandler {
    store: Arc<MetadataStore>,
    placement: Arc<PlacementService>,
    /// Replication address -> IPC address, so NotLeader redirects point
    /// clients at something they can actually dial.
    leader_ipc_map: HashMap<String, String>,
}

impl ControlPlaneHandler {
    pub fn new(
        store: Arc<MetadataStore>,
        placement: Arc<PlacementService>,
        leader_ipc_map: HashMap<String, String>,
    ) -> Self {
        Self {
            store,
            placement,
            leader_ipc_map,
        }
    }

    fn map_leader(&self, err: PlatformError) -> PlatformError {
        match err {
            PlatformError::NotLeader {
                leader_addr: Some(raft_addr),
            } => {
                let mapped = self
                    .leader_ipc_map
                    .get(&raft_addr)
                    .cloned()
                    .unwrap_or(raft_addr);
                PlatformError::NotLeader {
                    leader_addr: Some(mapped),
                }
            }
            other => other,
        }
    }

    fn json<T: serde::Serialize>(value: &T) -> Result<Option<Value>> {
        serde_json::to_value(value)
            .map(Some)
            .map_err(|e| PlatformError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl RequestHandler for ControlPlaneHandler {
    async fn handle(&self, request: RequestPayload) -> Result<Option<Value>> {
        debug!(kind = request.kind(), "ipc request");
        let outcome = match request {
            RequestPayload::GetTenant { tenant_id } => {
                Self::json(&self.store.get_tenant(&tenant_id)?)
            }
            RequestPayload::GetTenantByDomain { domain } => {
                Self::json(&self.store.get_tenant_by_domain(&domain)?)
            }
            RequestPayload::AssignTenant { tenant_id } => {
                let decision = self.placement.assign_tenant(&tenant_id).await?;
                Self::json(&decision)
            }
            RequestPayload::RegisterNode { mut node } => {
                node.last_heartbeat = now();
                if node.status != NodeStatus::Draining {
                    node.status = NodeStatus::Online;
                }
                self.store.save_node(node).await?;
                Ok(None)
            }
            RequestPayload::Heartbeat {
                node_id,
                active_tenants,
                resources,
            } => {
                let mut node = self.store.get_node(&node_id)?;
                node.active_tenants = active_tenants;
                node.resources = resources;
                node.last_heartbeat = now();
                // Heartbeats revive offline nodes but never un-drain.
                if node.status == NodeStatus::Offline {
                    node.status = NodeStatus::Online;
                }
                self.store.save_node(node).await?;
                Ok(None)
            }
            RequestPayload::CreateTenant { tenant } => {
                Self::json(&self.store.create_tenant(tenant).await?)
            }
            RequestPayload::UpdateTenantStatus { tenant_id, status } => {
                self.store.update_tenant_status(&tenant_id, status).await?;
                Ok(None)
            }
            RequestPayload::SaveActivity { activity } => {
                self.store.save_activity(activity).await?;
                Ok(None)
            }
            RequestPayload::GetPlacement { tenant_id } => {
                Self::json(&self.store.get_placement(&tenant_id)?)
            }
            RequestPayload::GetNode { node_id } => Self::json(&self.store.get_node(&node_id)?),
            RequestPayload::Subscribe { .. } => Err(PlatformError::InvalidInput(
                "subscribe is handled at the connection layer".into(),
            )),
        };
        outcome.map_err(|e| self.map_leader(e))
    }
}
