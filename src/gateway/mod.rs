// The edge gateway: tenant extraction, route cache, circuit breaking,
// quota enforcement, and the reverse proxy, assembled into one process
// role with its background loops.

pub mod breaker;
pub mod extract;
pub mod proxy;
pub mod routes;

pub use breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState};
pub use extract::{extract_tenant, TenantRef};
pub use proxy::{error_response, router, GatewayState};
pub use routes::{RouteCache, RouteEntry, ROUTE_TTL};

use std::sync::Arc;

use tracing::info;

use crate::common::tasks::TaskGroup;
use crate::config::PlatformConfig;
use crate::error::{PlatformError, Result};
use crate::networking::protocol::BroadcastEvent;
use crate::networking::pubsub::subscribe_events;
use crate::networking::ControlPlaneClient;
use crate::quota::{QuotaEnforcer, QUOTA_SYNC_INTERVAL};

pub struct Gateway {
    state: Arc<GatewayState>,
    tasks: TaskGroup,
}

impl Gateway {
    /// Build the gateway state and start its listener and loops.
    pub async fn start(config: &PlatformConfig) -> Result<Gateway> {
        let client = Arc::new(ControlPlaneClient::new(config.control_plane_addrs.clone()));
        let state = Arc::new(GatewayState {
            client: client.clone(),
            routes: Arc::new(RouteCache::default()),
            breakers: Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            quota: Arc::new(QuotaEnforcer::new(Some(client.clone()))),
            http: reqwest::Client::builder()
                .build()
                .map_err(|e| PlatformError::Configuration(e.to_string()))?,
            jwt_secret: config.jwt_secret.clone(),
        });

        let mut tasks = TaskGroup::new();

        // HTTP listener.
        let listener = tokio::net::TcpListener::bind(&config.http_bind_addr).await?;
        info!(addr = %config.http_bind_addr, "gateway listening");
        let app = router(state.clone());
        tasks.spawn("gateway-http", move |mut shutdown| async move {
            let serve = axum::serve(listener, app);
            tokio::select! {
                _ = shutdown.cancelled() => {}
                outcome = serve => {
                    if let Err(e) = outcome {
                        tracing::error!(error = %e, "gateway listener failed");
                    }
                }
            }
        });

        // Quota refresh every 30 s.
        {
            let quota = state.quota.clone();
            tasks.spawn_periodic("quota-sync", QUOTA_SYNC_INTERVAL, move || {
                let quota = quota.clone();
                async move { quota.sync_quotas().await }
            });
        }

        // Daily counter reset at local midnight.
        {
            let quota = state.quota.clone();
            tasks.spawn("quota-daily-reset", move |mut shutdown| async move {
                loop {
                    let until = crate::quota::until_local_midnight();
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(until) => {
                            info!("resetting daily request counters");
                            quota.reset_daily_counters();
                        }
                    }
                }
            });
        }

        // Broadcast-driven route invalidation.
        {
            let routes = state.routes.clone();
            let addrs = config.control_plane_addrs.clone();
            tasks.spawn("route-invalidation", move |shutdown| async move {
                subscribe_events(
                    addrs,
                    vec![
                        "tenant.migrating".to_string(),
                        "node.down".to_string(),
                        "routing.invalidate".to_string(),
                    ],
                    move |event| match event {
                        BroadcastEvent::TenantMigrating { tenant_id, .. } => {
                            routes.invalidate_tenant(&tenant_id);
                        }
                        BroadcastEvent::NodeDown { node_id } => {
                            // Addresses are cached, not node ids; a full
                            // flush is cheap and the CP is authoritative.
                            tracing::debug!(node = %node_id, "node down, flushing routes");
                            routes.invalidate_all();
                        }
                        BroadcastEvent::RoutingInvalidate { tenant_id } => match tenant_id {
                            Some(id) => routes.invalidate_tenant(&id),
                            None => routes.invalidate_all(),
                        },
                    },
                    shutdown,
                )
                .await
            });
        }

        Ok(Gateway { state, tasks })
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    pub async fn stop(&mut self) {
        self.tasks.shutdown().await;
        info!("gateway stopped");
    }
}
