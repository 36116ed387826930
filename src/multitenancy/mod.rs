// Worker-side tenancy: the weighted tenant cache, instance lifecycle,
// the hot/warm/cold archiver, and the contracts for the embedded engine
// and the log-shipping replicator.

pub mod archiver;
pub mod cache;
pub mod engine;
pub mod instance;
pub mod replicator;

pub use archiver::{Archiver, ArchiverConfig};
pub use cache::{CacheConfig, TenantCache, DRAIN_TIMEOUT};
pub use engine::{EngineFactory, FileEngine, FileEngineFactory, TenantEngine};
pub use instance::{InstanceState, RequestGuard, TenantInstance};
pub use replicator::{
    layout, NullReplicator, ObjectStoreReplicator, Replicator, RestorePoint,
};
