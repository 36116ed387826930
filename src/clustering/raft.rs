// Raft replication for the control-plane command log.
//
// The peer set is fixed at boot (3-5 control-plane peers from config), so
// there is no joint-consensus machinery; elections, log replication with
// conflict backtracking, and snapshot-based log truncation follow the Raft
// paper. This module is the synchronous protocol core: it decides, the log
// engine moves bytes and runs timers.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, Result};

/// Dense peer identity derived from the sorted peer address list; every
/// peer computes the same mapping.
pub type PeerId = u64;

/// Logical clock for leader elections.
pub type Term = u64;

pub type LogIndex = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    Follower,
    Candidate,
    Leader,
}

/// One entry in the replicated log. The command bytes are opaque here; the
/// FSM adapter is the only decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub term: Term,
    pub index: LogIndex,
    pub command: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: PeerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: Term,
    pub leader: PeerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogRecord>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: Option<LogIndex>,
    /// Follower's hint for fast next_index backtracking on conflict.
    pub conflict_index: Option<LogIndex>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader: PeerId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// Whole snapshot image; control-plane metadata fits one frame.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}

/// State that must survive restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<PeerId>,
    pub log: Vec<LogRecord>,
    /// `(term, index)` covered by the most recent snapshot.
    pub snapshot_marker: Option<(Term, LogIndex)>,
}

impl HardState {
    fn snapshot_index(&self) -> LogIndex {
        self.snapshot_marker.map(|(_, i)| i).unwrap_or(0)
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.log
            .last()
            .map(|e| e.index)
            .unwrap_or_else(|| self.snapshot_index())
    }

    pub fn last_log_term(&self) -> Term {
        self.log
            .last()
            .map(|e| e.term)
            .unwrap_or_else(|| self.snapshot_marker.map(|(t, _)| t).unwrap_or(0))
    }

    /// Entry at a 1-based log index, None when absent or compacted away.
    pub fn entry(&self, index: LogIndex) -> Option<&LogRecord> {
        if index == 0 || index <= self.snapshot_index() {
            return None;
        }
        let offset = (index - self.snapshot_index() - 1) as usize;
        self.log.get(offset)
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if let Some((term, snap_index)) = self.snapshot_marker {
            if index == snap_index {
                return Some(term);
            }
        }
        self.entry(index).map(|e| e.term)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SoftState {
    commit_index: LogIndex,
    last_applied: LogIndex,
}

/// Per-follower replication progress, leaders only.
#[derive(Debug, Clone)]
struct LeaderProgress {
    next_index: HashMap<PeerId, LogIndex>,
    match_index: HashMap<PeerId, LogIndex>,
}

impl LeaderProgress {
    fn new(peers: &[PeerId], last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in peers {
            next_index.insert(*peer, last_log_index + 1);
            match_index.insert(*peer, 0);
        }
        Self {
            next_index,
            match_index,
        }
    }

    /// Highest index replicated on a majority, counting the leader itself.
    fn quorum_index(&self, leader_last: LogIndex) -> LogIndex {
        let mut indices: Vec<LogIndex> = self.match_index.values().copied().collect();
        indices.push(leader_last);
        indices.sort_unstable();
        // Majority of cluster_size = followers + leader.
        indices[(indices.len() - 1) / 2]
    }
}

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub id: PeerId,
    /// All other peers (self excluded).
    pub peers: Vec<PeerId>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_entries_per_append: usize,
    /// Commits between snapshots.
    pub snapshot_threshold: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            id: 1,
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            max_entries_per_append: 100,
            snapshot_threshold: 10_000,
        }
    }
}

/// Protocol core shared by the log engine and the RPC handlers.
pub struct RaftCore {
    config: RaftConfig,
    role: RwLock<ReplicaRole>,
    hard: RwLock<HardState>,
    soft: RwLock<SoftState>,
    progress: RwLock<Option<LeaderProgress>>,
    current_leader: RwLock<Option<PeerId>>,
    votes: RwLock<HashMap<PeerId, bool>>,
}

impl RaftCore {
    pub fn new(config: RaftConfig) -> Self {
        Self {
            config,
            role: RwLock::new(ReplicaRole::Follower),
            hard: RwLock::new(HardState::default()),
            soft: RwLock::new(SoftState::default()),
            progress: RwLock::new(None),
            current_leader: RwLock::new(None),
            votes: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> PeerId {
        self.config.id
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.config.peers
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn role(&self) -> ReplicaRole {
        *self.role.read()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == ReplicaRole::Leader
    }

    pub fn current_term(&self) -> Term {
        self.hard.read().current_term
    }

    pub fn leader(&self) -> Option<PeerId> {
        *self.current_leader.read()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.soft.read().commit_index
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.hard.read().last_log_index()
    }

    /// Become candidate and produce the vote request to fan out.
    pub fn start_election(&self) -> VoteRequest {
        let mut role = self.role.write();
        let mut hard = self.hard.write();
        let mut votes = self.votes.write();

        hard.current_term += 1;
        hard.voted_for = Some(self.config.id);
        *role = ReplicaRole::Candidate;
        *self.current_leader.write() = None;

        votes.clear();
        votes.insert(self.config.id, true);

        VoteRequest {
            term: hard.current_term,
            candidate: self.config.id,
            last_log_index: hard.last_log_index(),
            last_log_term: hard.last_log_term(),
        }
    }

    pub fn handle_vote_request(&self, request: VoteRequest) -> VoteResponse {
        let mut role = self.role.write();
        let mut hard = self.hard.write();

        if request.term > hard.current_term {
            hard.current_term = request.term;
            hard.voted_for = None;
            *role = ReplicaRole::Follower;
        }

        let mut granted = false;
        if request.term >= hard.current_term {
            let can_vote =
                hard.voted_for.is_none() || hard.voted_for == Some(request.candidate);
            let log_ok = request.last_log_term > hard.last_log_term()
                || (request.last_log_term == hard.last_log_term()
                    && request.last_log_index >= hard.last_log_index());
            if can_vote && log_ok {
                hard.voted_for = Some(request.candidate);
                granted = true;
            }
        }

        VoteResponse {
            term: hard.current_term,
            granted,
        }
    }

    /// Record a vote. Returns true when this response completed a majority
    /// and the node just became leader.
    pub fn handle_vote_response(&self, from: PeerId, response: VoteResponse) -> bool {
        {
            let mut role = self.role.write();
            let mut hard = self.hard.write();
            if response.term > hard.current_term {
                hard.current_term = response.term;
                hard.voted_for = None;
                *role = ReplicaRole::Follower;
                return false;
            }
            if *role != ReplicaRole::Candidate || response.term != hard.current_term {
                return false;
            }
        }

        let won = {
            let mut votes = self.votes.write();
            votes.insert(from, response.granted);
            let yes = votes.values().filter(|v| **v).count();
            let cluster = self.config.peers.len() + 1;
            yes > cluster / 2
        };

        if won {
            self.become_leader();
        }
        won
    }

    fn become_leader(&self) {
        let mut role = self.role.write();
        if *role == ReplicaRole::Leader {
            return;
        }
        *role = ReplicaRole::Leader;
        *self.current_leader.write() = Some(self.config.id);
        let last = self.hard.read().last_log_index();
        *self.progress.write() = Some(LeaderProgress::new(&self.config.peers, last));
    }

    pub fn handle_append_request(&self, request: AppendRequest) -> AppendResponse {
        let mut role = self.role.write();
        let mut hard = self.hard.write();

        if request.term > hard.current_term {
            hard.current_term = request.term;
            hard.voted_for = None;
        }

        if request.term < hard.current_term {
            return AppendResponse {
                term: hard.current_term,
                success: false,
                match_index: None,
                conflict_index: None,
            };
        }

        // Valid leader for this term.
        *role = ReplicaRole::Follower;
        *self.current_leader.write() = Some(request.leader);

        if request.prev_log_index > hard.snapshot_index() {
            match hard.term_at(request.prev_log_index) {
                Some(term) if term == request.prev_log_term => {}
                Some(_) => {
                    return AppendResponse {
                        term: hard.current_term,
                        success: false,
                        match_index: None,
                        conflict_index: Some(request.prev_log_index),
                    };
                }
                None => {
                    return AppendResponse {
                        term: hard.current_term,
                        success: false,
                        match_index: None,
                        conflict_index: Some(hard.last_log_index() + 1),
                    };
                }
            }
        }

        if !request.entries.is_empty() {
            let snapshot_index = hard.snapshot_index();
            let start_index = request.prev_log_index + 1;
            if start_index > snapshot_index {
                let keep = (start_index - snapshot_index - 1) as usize;
                hard.log.truncate(keep);
            }
            for entry in request.entries {
                if entry.index > hard.snapshot_index() && hard.entry(entry.index).is_none() {
                    hard.log.push(entry);
                }
            }
        }

        let last = hard.last_log_index();
        if request.leader_commit > self.soft.read().commit_index {
            let mut soft = self.soft.write();
            soft.commit_index = request.leader_commit.min(last);
        }

        AppendResponse {
            term: hard.current_term,
            success: true,
            match_index: Some(last),
            conflict_index: None,
        }
    }

    /// Build the next AppendEntries for a peer, or an InstallSnapshot when
    /// the peer is behind the compaction horizon.
    ///
    /// Lock order is progress, then hard, then soft, matching
    /// handle_append_response; the two never hold them crosswise.
    pub fn build_append_request(&self, peer: PeerId) -> Result<AppendRequest> {
        let next_index = {
            let progress_guard = self.progress.read();
            let progress = progress_guard
                .as_ref()
                .ok_or_else(|| PlatformError::Internal("not a leader".into()))?;
            progress.next_index.get(&peer).copied().unwrap_or(1)
        };

        let hard = self.hard.read();
        let soft = self.soft.read();

        if next_index <= hard.snapshot_index() {
            return Err(PlatformError::NotFound(format!(
                "peer {} needs snapshot below index {}",
                peer,
                hard.snapshot_index()
            )));
        }
        let prev_log_index = next_index - 1;
        let prev_log_term = if prev_log_index > 0 {
            hard.term_at(prev_log_index).unwrap_or(0)
        } else {
            0
        };

        let mut entries = Vec::new();
        let start = (next_index - hard.snapshot_index() - 1) as usize;
        let end = (start + self.config.max_entries_per_append).min(hard.log.len());
        for entry in &hard.log[start.min(hard.log.len())..end] {
            entries.push(entry.clone());
        }

        Ok(AppendRequest {
            term: hard.current_term,
            leader: self.config.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: soft.commit_index,
        })
    }

    /// Digest a follower's response. Returns true when the commit index
    /// advanced.
    pub fn handle_append_response(&self, peer: PeerId, response: AppendResponse) -> bool {
        {
            let mut role = self.role.write();
            let mut hard = self.hard.write();
            if response.term > hard.current_term {
                hard.current_term = response.term;
                hard.voted_for = None;
                *role = ReplicaRole::Follower;
                *self.current_leader.write() = None;
                *self.progress.write() = None;
                return false;
            }
            if *role != ReplicaRole::Leader {
                return false;
            }
        }

        if response.success {
            let Some(match_index) = response.match_index else {
                return false;
            };
            let leader_last = self.hard.read().last_log_index();
            let candidate = {
                let mut progress_guard = self.progress.write();
                let Some(progress) = progress_guard.as_mut() else {
                    return false;
                };
                progress.next_index.insert(peer, match_index + 1);
                progress.match_index.insert(peer, match_index);
                progress.quorum_index(leader_last)
            };

            let hard = self.hard.read();
            let mut soft = self.soft.write();
            if candidate > soft.commit_index {
                // Only entries from the current term commit by counting.
                if hard.term_at(candidate) == Some(hard.current_term) {
                    soft.commit_index = candidate;
                    return true;
                }
            }
        } else {
            let mut progress_guard = self.progress.write();
            let Some(progress) = progress_guard.as_mut() else {
                return false;
            };
            let current = progress.next_index.get(&peer).copied().unwrap_or(1);
            let fallback = response
                .conflict_index
                .unwrap_or_else(|| current.saturating_sub(1))
                .max(1);
            progress.next_index.insert(peer, fallback.min(current));
        }
        false
    }

    /// Leader-only append of a new command. Returns the assigned index.
    pub fn append_command(&self, command: Vec<u8>) -> Result<(Term, LogIndex)> {
        if !self.is_leader() {
            return Err(PlatformError::NotLeader { leader_addr: None });
        }
        let mut hard = self.hard.write();
        let index = hard.last_log_index() + 1;
        let term = hard.current_term;
        hard.log.push(LogRecord {
            term,
            index,
            command,
        });
        Ok((term, index))
    }

    /// Advance the commit index directly (snapshot restore bookkeeping).
    pub fn commit_to(&self, index: LogIndex) {
        let last = self.hard.read().last_log_index();
        let mut soft = self.soft.write();
        if index > soft.commit_index {
            soft.commit_index = index.min(last);
        }
    }

    /// Entries between last_applied and commit_index, for the apply loop.
    pub fn take_applicable(&self) -> Vec<LogRecord> {
        let commit = self.soft.read().commit_index;
        let mut out = Vec::new();
        let hard = self.hard.read();
        let mut soft = self.soft.write();
        while soft.last_applied < commit {
            let next = soft.last_applied + 1;
            match hard.entry(next) {
                Some(entry) => {
                    out.push(entry.clone());
                    soft.last_applied = next;
                }
                None => break,
            }
        }
        out
    }

    pub fn last_applied(&self) -> LogIndex {
        self.soft.read().last_applied
    }

    /// Drop log entries covered by a snapshot at `(term, index)`.
    pub fn compact_to(&self, term: Term, index: LogIndex) {
        let mut hard = self.hard.write();
        hard.log.retain(|e| e.index > index);
        hard.snapshot_marker = Some((term, index));
    }

    /// Follower-side snapshot installation bookkeeping; the caller has
    /// already restored the FSM from the image.
    pub fn install_snapshot_marker(&self, request: &InstallSnapshotRequest) -> InstallSnapshotResponse {
        let mut role = self.role.write();
        let mut hard = self.hard.write();
        if request.term > hard.current_term {
            hard.current_term = request.term;
            hard.voted_for = None;
        }
        if request.term < hard.current_term {
            return InstallSnapshotResponse {
                term: hard.current_term,
            };
        }
        *role = ReplicaRole::Follower;
        *self.current_leader.write() = Some(request.leader);

        hard.log.clear();
        hard.snapshot_marker = Some((request.last_included_term, request.last_included_index));
        let mut soft = self.soft.write();
        soft.commit_index = request.last_included_index;
        soft.last_applied = request.last_included_index;

        InstallSnapshotResponse {
            term: hard.current_term,
        }
    }

    /// Snapshot of hard state for persistence.
    pub fn hard_state(&self) -> HardState {
        self.hard.read().clone()
    }

    pub fn load_hard_state(&self, state: HardState) {
        let commit = state.snapshot_index();
        *self.hard.write() = state;
        let mut soft = self.soft.write();
        soft.commit_index = commit;
        soft.last_applied = commit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node(id: PeerId) -> RaftCore {
        let peers = [1u64, 2, 3].iter().copied().filter(|p| *p != id).collect();
        RaftCore::new(RaftConfig {
            id,
            peers,
            ..RaftConfig::default()
        })
    }

    #[test]
    fn test_election_majority() {
        let core = three_node(1);
        let request = core.start_election();
        assert_eq!(request.term, 1);
        assert_eq!(core.role(), ReplicaRole::Candidate);

        let became_leader = core.handle_vote_response(
            2,
            VoteResponse {
                term: 1,
                granted: true,
            },
        );
        assert!(became_leader);
        assert!(core.is_leader());
        assert_eq!(core.leader(), Some(1));
    }

    #[test]
    fn test_vote_denied_for_stale_log() {
        let leader = three_node(1);
        leader.start_election();
        leader.handle_vote_response(
            2,
            VoteResponse {
                term: 1,
                granted: true,
            },
        );
        leader.append_command(b"x".to_vec()).unwrap();

        let response = leader.handle_vote_request(VoteRequest {
            term: 2,
            candidate: 3,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!response.granted);
    }

    #[test]
    fn test_replication_commits_on_majority() {
        let leader = three_node(1);
        leader.start_election();
        leader.handle_vote_response(
            2,
            VoteResponse {
                term: 1,
                granted: true,
            },
        );
        let (_, index) = leader.append_command(b"cmd".to_vec()).unwrap();
        assert_eq!(index, 1);
        assert_eq!(leader.commit_index(), 0);

        let follower = three_node(2);
        let request = leader.build_append_request(2).unwrap();
        let response = follower.handle_append_request(request);
        assert!(response.success);

        let advanced = leader.handle_append_response(2, response);
        assert!(advanced);
        assert_eq!(leader.commit_index(), 1);
    }

    #[test]
    fn test_follower_truncates_conflicting_suffix() {
        let follower = three_node(2);
        follower.handle_append_request(AppendRequest {
            term: 1,
            leader: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogRecord {
                    term: 1,
                    index: 1,
                    command: b"a".to_vec(),
                },
                LogRecord {
                    term: 1,
                    index: 2,
                    command: b"b".to_vec(),
                },
            ],
            leader_commit: 0,
        });

        // A new leader overwrites index 2 with a term-2 entry.
        let response = follower.handle_append_request(AppendRequest {
            term: 2,
            leader: 3,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![LogRecord {
                term: 2,
                index: 2,
                command: b"c".to_vec(),
            }],
            leader_commit: 2,
        });
        assert!(response.success);
        let hard = follower.hard_state();
        assert_eq!(hard.entry(2).map(|e| e.term), Some(2));
        assert_eq!(follower.commit_index(), 2);
    }

    #[test]
    fn test_stale_term_append_rejected() {
        let core = three_node(2);
        core.handle_append_request(AppendRequest {
            term: 5,
            leader: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        });
        let response = core.handle_append_request(AppendRequest {
            term: 3,
            leader: 3,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        });
        assert!(!response.success);
        assert_eq!(response.term, 5);
    }

    #[test]
    fn test_compaction_preserves_tail() {
        let core = three_node(1);
        core.start_election();
        core.handle_vote_response(
            2,
            VoteResponse {
                term: 1,
                granted: true,
            },
        );
        for i in 0..5u8 {
            core.append_command(vec![i]).unwrap();
        }
        core.commit_to(5);
        core.compact_to(1, 3);
        let hard = core.hard_state();
        assert_eq!(hard.last_log_index(), 5);
        assert!(hard.entry(3).is_none());
        assert_eq!(hard.entry(4).map(|e| e.index), Some(4));
        assert_eq!(hard.term_at(3), Some(1));
    }
}
