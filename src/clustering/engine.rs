// The command log engine.
//
// Owns the Raft core, the FSM, and the replication timers. Storage never
// sees any of this: it submits commands through the CommandLog interface
// and gets back the FSM's response once the entry has committed and
// applied. A write moves Encoded -> Submitted -> Committed -> Applied ->
// Acknowledged; every stage can fail with a typed error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::clustering::raft::{LogIndex, PeerId, RaftConfig, RaftCore, Term};
use crate::clustering::transport::{RaftRpc, RaftRpcHandler, RaftRpcReply, RaftTransport};
use crate::common::tasks::TaskGroup;
use crate::error::{PlatformError, Result};
use crate::registry::commands::RaftCommand;
use crate::registry::fsm::{is_deterministic_rejection, StateMachine};

/// Default commit timeout for write submissions.
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshots kept on disk after pruning.
pub const SNAPSHOT_RETENTION: usize = 3;

/// The injected interface storage uses to reach the log engine. One-way
/// ownership: the engine owns the FSM, storage owns neither.
#[async_trait]
pub trait CommandLog: Send + Sync {
    async fn submit(&self, command: RaftCommand) -> Result<Option<Value>>;
    fn is_leader(&self) -> bool;
    fn leader_addr(&self) -> Option<String>;
}

/// Maps config peer addresses to dense ids. Every peer sorts the same
/// address set, so the mapping agrees cluster-wide.
#[derive(Debug, Clone)]
pub struct ClusterLayout {
    pub self_id: PeerId,
    pub self_addr: String,
    /// Other peers only.
    pub peers: HashMap<PeerId, String>,
}

impl ClusterLayout {
    pub fn new(bind_addr: &str, peer_addrs: &[String]) -> Result<Self> {
        let mut all: Vec<String> = peer_addrs.to_vec();
        if !all.iter().any(|a| a == bind_addr) {
            all.push(bind_addr.to_string());
        }
        all.sort();
        all.dedup();

        let mut self_id = None;
        let mut peers = HashMap::new();
        for (i, addr) in all.iter().enumerate() {
            let id = (i + 1) as PeerId;
            if addr == bind_addr {
                self_id = Some(id);
            } else {
                peers.insert(id, addr.clone());
            }
        }
        let self_id = self_id.ok_or_else(|| {
            PlatformError::Configuration(format!("bind addr {} missing from peer set", bind_addr))
        })?;
        Ok(Self {
            self_id,
            self_addr: bind_addr.to_string(),
            peers,
        })
    }

    pub fn addr_of(&self, id: PeerId) -> Option<&str> {
        if id == self.self_id {
            Some(&self.self_addr)
        } else {
            self.peers.get(&id).map(String::as_str)
        }
    }
}

/// Snapshot files under `<data-dir>/control-plane/snapshots/`, named
/// `snapshot-<term>-<index>.snap`, pruned to a retention count.
pub struct SnapshotStore {
    dir: PathBuf,
    retention: usize,
}

impl SnapshotStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: data_dir.into().join("control-plane").join("snapshots"),
            retention: SNAPSHOT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn save(&self, term: Term, index: LogIndex, bytes: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("snapshot-{}-{}.snap", term, index));
        std::fs::write(&path, bytes)?;
        self.prune()?;
        Ok(path)
    }

    pub fn load_latest(&self) -> Result<Option<(Term, LogIndex, Vec<u8>)>> {
        let Some((term, index, path)) = self.latest_path()? else {
            return Ok(None);
        };
        let bytes = std::fs::read(path)?;
        Ok(Some((term, index, bytes)))
    }

    fn latest_path(&self) -> Result<Option<(Term, LogIndex, PathBuf)>> {
        let mut found = self.list()?;
        Ok(found.pop().map(|(t, i, p)| (t, i, p)))
    }

    fn list(&self) -> Result<Vec<(Term, LogIndex, PathBuf)>> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name
                .strip_prefix("snapshot-")
                .and_then(|s| s.strip_suffix(".snap"))
            else {
                continue;
            };
            let mut parts = stem.splitn(2, '-');
            let (Some(term), Some(index)) = (parts.next(), parts.next()) else {
                continue;
            };
            if let (Ok(term), Ok(index)) = (term.parse(), index.parse()) {
                out.push((term, index, entry.path()));
            }
        }
        out.sort_by_key(|(t, i, _)| (*t, *i));
        Ok(out)
    }

    fn prune(&self) -> Result<()> {
        let found = self.list()?;
        if found.len() <= self.retention {
            return Ok(());
        }
        for (_, _, path) in &found[..found.len() - self.retention] {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to prune snapshot");
            }
        }
        Ok(())
    }
}

type Waiter = (Term, oneshot::Sender<Result<Option<Value>>>);

/// Replicated engine for 3-5 peer clusters.
pub struct RaftEngine {
    core: Arc<RaftCore>,
    fsm: Arc<dyn StateMachine>,
    transport: Arc<dyn RaftTransport>,
    layout: ClusterLayout,
    snapshots: Arc<SnapshotStore>,
    waiters: Arc<Mutex<HashMap<LogIndex, Waiter>>>,
    election_deadline: Arc<Mutex<Instant>>,
    apply_notify: Arc<Notify>,
    commits_since_snapshot: Arc<AtomicU64>,
    commit_timeout: Duration,
    tasks: tokio::sync::Mutex<TaskGroup>,
}

impl RaftEngine {
    pub fn new(
        layout: ClusterLayout,
        fsm: Arc<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
        snapshots: SnapshotStore,
    ) -> Arc<Self> {
        let config = RaftConfig {
            id: layout.self_id,
            peers: layout.peers.keys().copied().collect(),
            ..RaftConfig::default()
        };
        let election_timeout = Duration::from_millis(config.election_timeout_max_ms);
        Arc::new(Self {
            core: Arc::new(RaftCore::new(config)),
            fsm,
            transport,
            layout,
            snapshots: Arc::new(snapshots),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            election_deadline: Arc::new(Mutex::new(Instant::now() + election_timeout)),
            apply_notify: Arc::new(Notify::new()),
            commits_since_snapshot: Arc::new(AtomicU64::new(0)),
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
            tasks: tokio::sync::Mutex::new(TaskGroup::new()),
        })
    }

    pub fn core(&self) -> &Arc<RaftCore> {
        &self.core
    }

    /// Handler for the inbound replication listener.
    pub fn rpc_handler(self: &Arc<Self>) -> Arc<dyn RaftRpcHandler> {
        Arc::new(EngineRpcHandler {
            engine: self.clone(),
        })
    }

    /// Restore the latest on-disk snapshot and start the timers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if let Some((term, index, bytes)) = self.snapshots.load_latest()? {
            self.fsm.restore(&bytes)?;
            self.core.compact_to(term, index);
            self.core.commit_to(index);
            // Mark everything up to the snapshot as applied.
            let _ = self.core.take_applicable();
            info!(term, index, "restored control-plane snapshot");
        }

        let mut tasks = self.tasks.lock().await;

        let engine = self.clone();
        tasks.spawn("raft-tick", move |mut shutdown| async move {
            let mut tick = tokio::time::interval(Duration::from_millis(25));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => engine.on_tick().await,
                }
            }
        });

        let engine = self.clone();
        tasks.spawn("raft-apply", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = engine.apply_notify.notified() => engine.apply_committed(),
                }
            }
        });

        Ok(())
    }

    pub async fn stop(&self) {
        self.tasks.lock().await.shutdown().await;
    }

    fn reset_election_deadline(&self) {
        let config = self.core.config();
        let jitter = rand::rng()
            .random_range(config.election_timeout_min_ms..=config.election_timeout_max_ms);
        *self.election_deadline.lock() = Instant::now() + Duration::from_millis(jitter);
    }

    async fn on_tick(&self) {
        if self.core.is_leader() {
            self.broadcast_append().await;
            return;
        }
        let expired = { Instant::now() >= *self.election_deadline.lock() };
        if expired {
            self.run_election().await;
        }
    }

    async fn run_election(&self) {
        self.reset_election_deadline();
        let request = self.core.start_election();
        debug!(term = request.term, "starting election");

        let mut calls = Vec::new();
        for (peer, addr) in &self.layout.peers {
            let transport = self.transport.clone();
            let addr = addr.clone();
            let request = request.clone();
            let peer = *peer;
            calls.push(async move {
                (peer, transport.send(&addr, RaftRpc::Vote(request)).await)
            });
        }
        for (peer, outcome) in futures::future::join_all(calls).await {
            if let Ok(RaftRpcReply::Vote(response)) = outcome {
                if self.core.handle_vote_response(peer, response) {
                    info!(term = self.core.current_term(), "won election");
                    self.broadcast_append().await;
                    break;
                }
            }
        }
    }

    /// Heartbeat / replication fan-out. Also the path that advances the
    /// commit index on quorum acks.
    async fn broadcast_append(&self) {
        let mut calls = Vec::new();
        for (peer, addr) in &self.layout.peers {
            let peer = *peer;
            let addr = addr.clone();
            let transport = self.transport.clone();
            match self.core.build_append_request(peer) {
                Ok(request) => calls.push(async move {
                    (peer, transport.send(&addr, RaftRpc::Append(request)).await)
                }),
                Err(PlatformError::NotFound(_)) => {
                    self.install_snapshot_on(peer, &addr).await;
                }
                Err(_) => {}
            }
        }
        let mut advanced = false;
        for (peer, outcome) in futures::future::join_all(calls).await {
            if let Ok(RaftRpcReply::Append(response)) = outcome {
                advanced |= self.core.handle_append_response(peer, response);
            }
        }
        if advanced {
            self.apply_notify.notify_one();
        }
    }

    async fn install_snapshot_on(&self, peer: PeerId, addr: &str) {
        let Ok(data) = self.fsm.snapshot() else {
            return;
        };
        let hard = self.core.hard_state();
        let Some((term, index)) = hard.snapshot_marker else {
            return;
        };
        let request = crate::clustering::raft::InstallSnapshotRequest {
            term: self.core.current_term(),
            leader: self.core.id(),
            last_included_index: index,
            last_included_term: term,
            data,
        };
        debug!(peer, index, "installing snapshot on lagging peer");
        let _ = self.transport.send(addr, RaftRpc::Snapshot(request)).await;
    }

    /// Apply everything committed, acknowledge waiters, and snapshot when
    /// the commit count crosses the threshold.
    fn apply_committed(&self) {
        for entry in self.core.take_applicable() {
            let outcome = self.fsm.apply(&entry.command);

            let waiter = self.waiters.lock().remove(&entry.index);
            match outcome {
                Ok(value) => {
                    if let Some((term, tx)) = waiter {
                        if term == entry.term {
                            let _ = tx.send(Ok(value));
                        } else {
                            // The slot was overwritten by another leader.
                            let _ = tx.send(Err(PlatformError::Quorum(format!(
                                "entry {} superseded",
                                entry.index
                            ))));
                        }
                    }
                }
                Err(e) if is_deterministic_rejection(&e) => {
                    if let Some((_, tx)) = waiter {
                        let _ = tx.send(Err(e));
                    }
                }
                Err(e) => {
                    // Diverging from the committed log is unrecoverable for
                    // this peer.
                    error!(index = entry.index, error = %e, "fatal apply failure");
                    std::process::exit(1);
                }
            }

            let applied = self.commits_since_snapshot.fetch_add(1, Ordering::AcqRel) + 1;
            if applied >= self.core.config().snapshot_threshold {
                self.commits_since_snapshot.store(0, Ordering::Release);
                self.take_snapshot(entry.term, entry.index);
            }
        }
    }

    fn take_snapshot(&self, term: Term, index: LogIndex) {
        match self.fsm.snapshot() {
            Ok(bytes) => match self.snapshots.save(term, index, &bytes) {
                Ok(path) => {
                    self.core.compact_to(term, index);
                    info!(term, index, path = %path.display(), "wrote snapshot");
                }
                Err(e) => warn!(error = %e, "snapshot write failed"),
            },
            Err(e) => warn!(error = %e, "snapshot serialization failed"),
        }
    }
}

#[async_trait]
impl CommandLog for RaftEngine {
    async fn submit(&self, command: RaftCommand) -> Result<Option<Value>> {
        if !self.core.is_leader() {
            return Err(PlatformError::NotLeader {
                leader_addr: self.leader_addr(),
            });
        }
        let bytes = command.encode()?;
        let (tx, rx) = oneshot::channel();
        let index = {
            // Register the waiter under the lock before the entry becomes
            // visible, so a concurrent replication round cannot apply it
            // first and find nobody to acknowledge.
            let mut waiters = self.waiters.lock();
            let (term, index) = self.core.append_command(bytes)?;
            waiters.insert(index, (term, tx));
            index
        };

        // Don't wait for the next tick; push the entry out now.
        self.broadcast_append().await;

        match tokio::time::timeout(self.commit_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PlatformError::Quorum(format!(
                "apply signal lost for index {}",
                index
            ))),
            Err(_) => {
                self.waiters.lock().remove(&index);
                Err(PlatformError::Quorum(format!(
                    "commit timeout for index {}",
                    index
                )))
            }
        }
    }

    fn is_leader(&self) -> bool {
        self.core.is_leader()
    }

    fn leader_addr(&self) -> Option<String> {
        self.core
            .leader()
            .and_then(|id| self.layout.addr_of(id))
            .map(str::to_string)
    }
}

struct EngineRpcHandler {
    engine: Arc<RaftEngine>,
}

impl RaftRpcHandler for EngineRpcHandler {
    fn handle(&self, rpc: RaftRpc) -> RaftRpcReply {
        match rpc {
            RaftRpc::Vote(request) => {
                let response = self.engine.core.handle_vote_request(request);
                if response.granted {
                    self.engine.reset_election_deadline();
                }
                RaftRpcReply::Vote(response)
            }
            RaftRpc::Append(request) => {
                let response = self.engine.core.handle_append_request(request);
                if response.success {
                    self.engine.reset_election_deadline();
                    self.engine.apply_notify.notify_one();
                }
                RaftRpcReply::Append(response)
            }
            RaftRpc::Snapshot(request) => {
                if let Err(e) = self.engine.fsm.restore(&request.data) {
                    error!(error = %e, "snapshot install failed");
                }
                let response = self.engine.core.install_snapshot_marker(&request);
                self.engine.reset_election_deadline();
                RaftRpcReply::Snapshot(response)
            }
        }
    }
}

/// Single-peer mode: no replication, commands apply directly and
/// synchronously in submission order.
pub struct DirectCommandLog {
    fsm: Arc<dyn StateMachine>,
    advertised_addr: String,
    snapshots: Option<Arc<SnapshotStore>>,
    snapshot_threshold: u64,
    applied: AtomicU64,
    apply_lock: Mutex<()>,
}

impl DirectCommandLog {
    pub fn new(fsm: Arc<dyn StateMachine>, advertised_addr: impl Into<String>) -> Self {
        Self {
            fsm,
            advertised_addr: advertised_addr.into(),
            snapshots: None,
            snapshot_threshold: 10_000,
            applied: AtomicU64::new(0),
            apply_lock: Mutex::new(()),
        }
    }

    pub fn with_snapshots(mut self, store: SnapshotStore, threshold: u64) -> Self {
        self.snapshots = Some(Arc::new(store));
        self.snapshot_threshold = threshold.max(1);
        self
    }

    /// Restore the latest snapshot, if any.
    pub fn recover(&self) -> Result<()> {
        if let Some(store) = &self.snapshots {
            if let Some((term, index, bytes)) = store.load_latest()? {
                self.fsm.restore(&bytes)?;
                self.applied.store(index, Ordering::Release);
                info!(term, index, "restored snapshot in single-peer mode");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommandLog for DirectCommandLog {
    async fn submit(&self, command: RaftCommand) -> Result<Option<Value>> {
        let bytes = command.encode()?;
        let _serialize = self.apply_lock.lock();
        let result = self.fsm.apply(&bytes);
        let applied = self.applied.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(store) = &self.snapshots {
            if applied % self.snapshot_threshold == 0 {
                if let Ok(image) = self.fsm.snapshot() {
                    if let Err(e) = store.save(1, applied, &image) {
                        warn!(error = %e, "single-peer snapshot write failed");
                    }
                }
            }
        }
        result
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn leader_addr(&self) -> Option<String> {
        Some(self.advertised_addr.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::fsm::RegistryFsm;
    use crate::registry::kv::KvEngine;
    use crate::registry::types::Tenant;

    fn direct_log(dir: &std::path::Path) -> (Arc<KvEngine>, DirectCommandLog) {
        let kv = Arc::new(KvEngine::new(dir));
        let fsm = Arc::new(RegistryFsm::new(kv.clone(), "cp-1"));
        let log = DirectCommandLog::new(fsm, "127.0.0.1:8090")
            .with_snapshots(SnapshotStore::new(dir), 2);
        (kv, log)
    }

    #[tokio::test]
    async fn test_direct_log_applies_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let (kv, log) = direct_log(dir.path());
        log.submit(RaftCommand::CreateTenant {
            tenant: Tenant::new("ten_1", "t1.example.com", "u_1"),
        })
        .await
        .unwrap();
        assert!(kv.contains("tenant:ten_1"));
        assert!(log.is_leader());
    }

    #[tokio::test]
    async fn test_direct_log_snapshot_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (_kv, log) = direct_log(dir.path());
            for i in 0..4 {
                log.submit(RaftCommand::CreateTenant {
                    tenant: Tenant::new(
                        format!("ten_{}", i),
                        format!("t{}.example.com", i),
                        "u_1",
                    ),
                })
                .await
                .unwrap();
            }
        }
        let (kv, log) = direct_log(dir.path());
        log.recover().unwrap();
        // Threshold 2 with 4 submissions leaves a snapshot at index 4.
        assert!(kv.contains("tenant:ten_3"));
    }

    #[test]
    fn test_cluster_layout_ids_agree() {
        let addrs = vec![
            "10.0.0.2:7000".to_string(),
            "10.0.0.1:7000".to_string(),
            "10.0.0.3:7000".to_string(),
        ];
        let a = ClusterLayout::new("10.0.0.1:7000", &addrs).unwrap();
        let b = ClusterLayout::new("10.0.0.2:7000", &addrs).unwrap();
        assert_eq!(a.self_id, 1);
        assert_eq!(b.self_id, 2);
        assert_eq!(a.addr_of(2), Some("10.0.0.2:7000"));
        assert_eq!(b.addr_of(1), Some("10.0.0.1:7000"));
    }

    #[test]
    fn test_snapshot_store_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).with_retention(2);
        store.save(1, 10, b"a").unwrap();
        store.save(1, 20, b"b").unwrap();
        store.save(2, 5, b"c").unwrap();
        let (term, index, bytes) = store.load_latest().unwrap().unwrap();
        assert_eq!((term, index), (2, 5));
        assert_eq!(bytes, b"c");
        // Oldest pruned.
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
    }
}
