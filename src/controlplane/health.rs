// Node health tracking: a heartbeat older than the timeout marks the node
// offline and announces it. Node records are never deleted.

use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};

use crate::common::now;
use crate::networking::protocol::BroadcastEvent;
use crate::networking::BroadcastBus;
use crate::registry::types::NodeStatus;
use crate::registry::MetadataStore;

/// Heartbeat age after which a node is presumed dead.
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 30;

pub struct HealthScanner {
    store: Arc<MetadataStore>,
    bus: Arc<BroadcastBus>,
    timeout: Duration,
}

impl HealthScanner {
    pub fn new(store: Arc<MetadataStore>, bus: Arc<BroadcastBus>) -> Self {
        Self {
            store,
            bus,
            timeout: Duration::seconds(HEARTBEAT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// One scan pass. Only the leader mutates; followers skip.
    pub async fn scan(&self) {
        if !self.store.is_leader() {
            return;
        }
        let at = now();
        for mut node in self.store.list_nodes() {
            // Draining and already-offline nodes keep their status.
            if node.status != NodeStatus::Online {
                continue;
            }
            if node.heartbeat_stale(self.timeout, at) {
                info!(node = %node.id, "heartbeat expired, marking offline");
                node.status = NodeStatus::Offline;
                let node_id = node.id.clone();
                if let Err(e) = self.store.save_node(node).await {
                    warn!(node = %node_id, error = %e, "failed to mark node offline");
                    continue;
                }
                self.bus.publish(BroadcastEvent::NodeDown { node_id });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::DirectCommandLog;
    use crate::registry::fsm::RegistryFsm;
    use crate::registry::kv::KvEngine;
    use crate::registry::types::NodeInfo;

    fn scanner() -> (HealthScanner, Arc<MetadataStore>, Arc<BroadcastBus>) {
        let kv = Arc::new(KvEngine::new("/tmp/hivedb-health-test"));
        let fsm = Arc::new(RegistryFsm::new(kv.clone(), "cp-1"));
        let log = Arc::new(DirectCommandLog::new(fsm, "127.0.0.1:8090"));
        let store = Arc::new(MetadataStore::new(kv, log, "cp-1"));
        let bus = Arc::new(BroadcastBus::new());
        (
            HealthScanner::new(store.clone(), bus.clone()).with_timeout(Duration::seconds(30)),
            store,
            bus,
        )
    }

    #[tokio::test]
    async fn test_stale_node_marked_offline_and_announced() {
        let (scanner, store, bus) = scanner();
        let mut rx = bus.subscribe();

        let mut node = NodeInfo::new("n_a", "http://10.0.0.5:8091", 100);
        node.last_heartbeat = now() - Duration::seconds(120);
        store.save_node(node).await.unwrap();

        scanner.scan().await;

        let node = store.get_node(&"n_a".to_string()).unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        match rx.try_recv().unwrap().event {
            BroadcastEvent::NodeDown { node_id } => assert_eq!(node_id, "n_a"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fresh_and_draining_nodes_untouched() {
        let (scanner, store, _bus) = scanner();
        store
            .save_node(NodeInfo::new("n_fresh", "http://10.0.0.5:8091", 100))
            .await
            .unwrap();
        let mut draining = NodeInfo::new("n_drain", "http://10.0.0.6:8091", 100);
        draining.status = NodeStatus::Draining;
        draining.last_heartbeat = now() - Duration::seconds(120);
        store.save_node(draining).await.unwrap();

        scanner.scan().await;

        assert!(store.get_node(&"n_fresh".to_string()).unwrap().is_online());
        assert_eq!(
            store.get_node(&"n_drain".to_string()).unwrap().status,
            NodeStatus::Draining
        );
    }
}
