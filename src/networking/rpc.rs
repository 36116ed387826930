// Request/reply client for talking to the control plane.
//
// At-most-once semantics: one TCP exchange per attempt, client-side retry
// with capped exponential backoff on transient failures, and leader
// redirect on NotLeader replies. Any configured control-plane address may
// be contacted; the client remembers the last one that worked.

use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{PlatformError, Result};
use crate::networking::codec;
use crate::networking::protocol::{ReplyEnvelope, RequestEnvelope, RequestPayload};
use crate::registry::types::{NodeInfo, PlacementDecision, Tenant, TenantActivity, TenantStatus};

/// Default bound on one route/CRUD query.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_ATTEMPTS: u32 = 4;
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

pub struct ControlPlaneClient {
    addrs: Vec<String>,
    /// Last address that answered; tried first on the next request.
    preferred: Mutex<Option<String>>,
    timeout: Duration,
}

impl ControlPlaneClient {
    pub fn new(addrs: Vec<String>) -> Self {
        Self {
            addrs,
            preferred: Mutex::new(None),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn candidates(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.addrs.len() + 1);
        if let Some(preferred) = self.preferred.lock().clone() {
            out.push(preferred);
        }
        for addr in &self.addrs {
            if !out.contains(addr) {
                out.push(addr.clone());
            }
        }
        out
    }

    /// Issue one request with retry, redirect, and backoff.
    pub async fn request(&self, payload: RequestPayload) -> Result<Option<Value>> {
        let mut last_err = PlatformError::Unavailable("no control-plane address".into());
        let mut redirect: Option<String> = None;

        for attempt in 0..MAX_ATTEMPTS {
            let targets = match redirect.take() {
                Some(addr) => vec![addr],
                None => self.candidates(),
            };
            for addr in targets {
                match self.request_once(&addr, payload.clone()).await {
                    Ok(data) => {
                        *self.preferred.lock() = Some(addr);
                        return Ok(data);
                    }
                    Err(PlatformError::NotLeader { leader_addr }) => {
                        debug!(addr = %addr, leader = ?leader_addr, "redirected to leader");
                        if let Some(leader) = leader_addr {
                            redirect = Some(leader.clone());
                            *self.preferred.lock() = Some(leader);
                        }
                        last_err = PlatformError::NotLeader { leader_addr: None };
                    }
                    Err(e) if e.is_transient() => {
                        debug!(addr = %addr, error = %e, "control-plane attempt failed");
                        last_err = e;
                    }
                    Err(e) => return Err(e),
                }
            }
            let backoff = BACKOFF_BASE
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(BACKOFF_CAP);
            tokio::time::sleep(backoff).await;
        }
        Err(last_err)
    }

    async fn request_once(&self, addr: &str, payload: RequestPayload) -> Result<Option<Value>> {
        let envelope = RequestEnvelope::new(payload);
        let io = async {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| PlatformError::Network(format!("connect {}: {}", addr, e)))?;
            codec::write_frame(&mut stream, &envelope.encode()?).await?;
            let bytes = codec::read_frame(&mut stream)
                .await?
                .ok_or_else(|| PlatformError::Network(format!("{} closed connection", addr)))?;
            ReplyEnvelope::decode(&bytes)
        };
        let reply = tokio::time::timeout(self.timeout, io)
            .await
            .map_err(|_| PlatformError::Timeout(format!("request to {}", addr)))??;
        reply.into_result()
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, data: Option<Value>, what: &str) -> Result<T> {
        let value = data.ok_or_else(|| PlatformError::NotFound(what.to_string()))?;
        serde_json::from_value(value).map_err(|e| PlatformError::Serialization(e.to_string()))
    }

    // ---- typed helpers ----

    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Tenant> {
        let data = self
            .request(RequestPayload::GetTenant {
                tenant_id: tenant_id.to_string(),
            })
            .await?;
        self.decode(data, "tenant")
    }

    pub async fn get_tenant_by_domain(&self, domain: &str) -> Result<Tenant> {
        let data = self
            .request(RequestPayload::GetTenantByDomain {
                domain: domain.to_string(),
            })
            .await?;
        self.decode(data, "tenant")
    }

    pub async fn assign_tenant(&self, tenant_id: &str) -> Result<PlacementDecision> {
        let data = self
            .request(RequestPayload::AssignTenant {
                tenant_id: tenant_id.to_string(),
            })
            .await?;
        self.decode(data, "placement")
    }

    pub async fn get_placement(&self, tenant_id: &str) -> Result<PlacementDecision> {
        let data = self
            .request(RequestPayload::GetPlacement {
                tenant_id: tenant_id.to_string(),
            })
            .await?;
        self.decode(data, "placement")
    }

    pub async fn get_node(&self, node_id: &str) -> Result<NodeInfo> {
        let data = self
            .request(RequestPayload::GetNode {
                node_id: node_id.to_string(),
            })
            .await?;
        self.decode(data, "node")
    }

    pub async fn register_node(&self, node: NodeInfo) -> Result<()> {
        self.request(RequestPayload::RegisterNode { node }).await?;
        Ok(())
    }

    pub async fn heartbeat(
        &self,
        node_id: &str,
        active_tenants: u32,
        resources: crate::registry::types::ResourceSnapshot,
    ) -> Result<()> {
        self.request(RequestPayload::Heartbeat {
            node_id: node_id.to_string(),
            active_tenants,
            resources,
        })
        .await?;
        Ok(())
    }

    pub async fn update_tenant_status(&self, tenant_id: &str, status: TenantStatus) -> Result<()> {
        self.request(RequestPayload::UpdateTenantStatus {
            tenant_id: tenant_id.to_string(),
            status,
        })
        .await?;
        Ok(())
    }

    pub async fn save_activity(&self, activity: TenantActivity) -> Result<()> {
        self.request(RequestPayload::SaveActivity { activity })
            .await?;
        Ok(())
    }
}
