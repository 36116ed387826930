// Control-plane replication: Raft core, command log engine, and the peer
// transport. Everything above this layer sees only the CommandLog trait.

pub mod engine;
pub mod raft;
pub mod transport;

pub use engine::{ClusterLayout, CommandLog, DirectCommandLog, RaftEngine, SnapshotStore};
pub use raft::{LogIndex, PeerId, RaftConfig, RaftCore, ReplicaRole, Term};
pub use transport::{LoopbackTransport, RaftRpcHandler, RaftTransport, TcpRaftTransport};
