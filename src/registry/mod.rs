// The replicated metadata store: typed records, the command set that
// mutates them, the local KV engine, the FSM adapter, and snapshots.

pub mod commands;
pub mod fsm;
pub mod keys;
pub mod kv;
pub mod snapshot;
pub mod store;
pub mod types;

pub use commands::RaftCommand;
pub use fsm::{RegistryFsm, StateMachine};
pub use kv::{KvEngine, KvOp};
pub use store::MetadataStore;
pub use types::{
    ClusterUser, NodeInfo, NodeStatus, PlacementDecision, ResourceSnapshot, StorageTier, Tenant,
    TenantActivity, TenantStatus, VerificationToken,
};
