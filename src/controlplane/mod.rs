// Control-plane peer assembly: replicated store, command log engine,
// placement, IPC listener, broadcast bus, and the background loops
// (health scan, rebalance, KV maintenance).

pub mod handlers;
pub mod health;
pub mod sessions;

pub use handlers::ControlPlaneHandler;
pub use health::{HealthScanner, HEARTBEAT_TIMEOUT_SECS};
pub use sessions::SessionManager;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::clustering::transport::serve_replication;
use crate::clustering::{
    ClusterLayout, CommandLog, DirectCommandLog, RaftEngine, SnapshotStore, TcpRaftTransport,
};
use crate::common::tasks::TaskGroup;
use crate::config::PlatformConfig;
use crate::error::Result;
use crate::networking::protocol::BroadcastEvent;
use crate::networking::{serve_ipc, BroadcastBus};
use crate::placement::{PlacementConfig, PlacementService};
use crate::registry::types::PlacementDecision;
use crate::registry::{KvEngine, MetadataStore, RegistryFsm};

const HEALTH_SCAN_INTERVAL: Duration = Duration::from_secs(10);
const REBALANCE_INTERVAL: Duration = Duration::from_secs(300);
const KV_GC_INTERVAL: Duration = Duration::from_secs(300);
const KV_COMPACTION_INTERVAL: Duration = Duration::from_secs(3600);
const DISK_CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub struct ControlPlane {
    store: Arc<MetadataStore>,
    placement: Arc<PlacementService>,
    bus: Arc<BroadcastBus>,
    sessions: Arc<SessionManager>,
    raft: Option<Arc<RaftEngine>>,
    tasks: TaskGroup,
}

impl ControlPlane {
    pub async fn start(config: &PlatformConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let kv = Arc::new(KvEngine::new(&config.data_dir));
        let fsm = Arc::new(RegistryFsm::new(kv.clone(), config.node_id.clone()));

        let mut tasks = TaskGroup::new();

        let (log, raft): (Arc<dyn CommandLog>, Option<Arc<RaftEngine>>) = if config.single_peer() {
            info!("single-peer mode, commands apply directly");
            let direct = DirectCommandLog::new(fsm.clone(), config.ipc_bind_addr.clone())
                .with_snapshots(SnapshotStore::new(&config.data_dir), 10_000);
            direct.recover()?;
            (Arc::new(direct), None)
        } else {
            let layout = ClusterLayout::new(&config.raft_bind_addr, &config.raft_peers)?;
            info!(
                peers = config.raft_peers.len(),
                self_id = layout.self_id,
                "joining replication group"
            );
            let engine = RaftEngine::new(
                layout,
                fsm.clone(),
                Arc::new(TcpRaftTransport::default()),
                SnapshotStore::new(&config.data_dir),
            );
            engine.start().await?;

            let listener = TcpListener::bind(&config.raft_bind_addr).await?;
            let handler = engine.rpc_handler();
            tasks.spawn("raft-listener", move |shutdown| async move {
                serve_replication(listener, handler, shutdown).await;
            });

            (engine.clone(), Some(engine))
        };

        let store = Arc::new(MetadataStore::new(
            kv.clone(),
            log,
            config.node_id.clone(),
        ));
        let placement = Arc::new(PlacementService::new(
            store.clone(),
            PlacementConfig::default(),
        ));
        let bus = Arc::new(BroadcastBus::new());
        let sessions = Arc::new(SessionManager::new(store.clone(), config.jwt_secret.clone()));

        // IPC listener.
        let leader_ipc_map: HashMap<String, String> = config
            .raft_peers
            .iter()
            .cloned()
            .zip(config.control_plane_addrs.iter().cloned())
            .collect();
        let handler = Arc::new(ControlPlaneHandler::new(
            store.clone(),
            placement.clone(),
            leader_ipc_map,
        ));
        let ipc_listener = TcpListener::bind(&config.ipc_bind_addr).await?;
        info!(addr = %config.ipc_bind_addr, "control plane listening");
        {
            let bus = bus.clone();
            tasks.spawn("ipc-listener", move |shutdown| async move {
                serve_ipc(ipc_listener, handler, bus, shutdown).await;
            });
        }

        // Node health scan, leader-gated inside.
        {
            let scanner = Arc::new(HealthScanner::new(store.clone(), bus.clone()));
            tasks.spawn_periodic("health-scan", HEALTH_SCAN_INTERVAL, move || {
                let scanner = scanner.clone();
                async move { scanner.scan().await }
            });
        }

        // Rebalance scan, leader only.
        {
            let store = store.clone();
            let placement = placement.clone();
            let bus = bus.clone();
            tasks.spawn_periodic("rebalance", REBALANCE_INTERVAL, move || {
                let store = store.clone();
                let placement = placement.clone();
                let bus = bus.clone();
                async move {
                    if !store.is_leader() {
                        return;
                    }
                    rebalance_pass(&store, &placement, &bus).await;
                }
            });
        }

        // KV maintenance.
        {
            let kv = kv.clone();
            tasks.spawn_periodic("kv-gc", KV_GC_INTERVAL, move || {
                let kv = kv.clone();
                async move {
                    let swept = kv.sweep_expired();
                    if swept > 0 {
                        info!(swept, "kv gc collected expired entries");
                    }
                }
            });
        }
        {
            let kv = kv.clone();
            tasks.spawn_periodic("kv-compaction", KV_COMPACTION_INTERVAL, move || {
                let kv = kv.clone();
                async move {
                    kv.compact();
                }
            });
        }
        {
            let kv = kv.clone();
            tasks.spawn_periodic("disk-check", DISK_CHECK_INTERVAL, move || {
                let kv = kv.clone();
                async move {
                    kv.check_disk_usage();
                }
            });
        }

        Ok(Self {
            store,
            placement,
            bus,
            sessions,
            raft,
            tasks,
        })
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn placement(&self) -> &Arc<PlacementService> {
        &self.placement
    }

    pub fn bus(&self) -> &Arc<BroadcastBus> {
        &self.bus
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub async fn stop(&mut self) {
        self.tasks.shutdown().await;
        if let Some(raft) = &self.raft {
            raft.stop().await;
        }
        info!("control plane stopped");
    }
}

/// Execute one leader rebalance pass: re-place each proposed tenant and
/// announce the migration so gateways drop stale routes.
async fn rebalance_pass(
    store: &Arc<MetadataStore>,
    placement: &Arc<PlacementService>,
    bus: &Arc<BroadcastBus>,
) {
    for proposed in placement.plan_rebalance() {
        let address = match store.get_node(&proposed.to_node) {
            Ok(node) => node.address,
            Err(e) => {
                warn!(node = %proposed.to_node, error = %e, "rebalance target vanished");
                continue;
            }
        };
        let decision = PlacementDecision {
            tenant_id: proposed.tenant_id.clone(),
            node_id: proposed.to_node.clone(),
            node_address: address,
            reason: "rebalance".to_string(),
            decided_at: crate::common::now(),
        };
        match store.save_placement(decision).await {
            Ok(()) => {
                info!(
                    tenant = %proposed.tenant_id,
                    from = %proposed.from_node,
                    to = %proposed.to_node,
                    "rebalancing tenant"
                );
                bus.publish(BroadcastEvent::TenantMigrating {
                    tenant_id: proposed.tenant_id,
                    from_node: proposed.from_node,
                    to_node: proposed.to_node,
                });
            }
            Err(e) => warn!(tenant = %proposed.tenant_id, error = %e, "rebalance placement failed"),
        }
    }
}
