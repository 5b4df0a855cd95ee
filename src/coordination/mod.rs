// Coordination primitives over a shared versioned node store

pub mod create_or_set;
pub mod dirty;
pub mod guarded;
pub mod lock;
pub mod memory;
pub mod store;

pub use create_or_set::{create_or_set, CreateOrSetError, DEFAULT_CREATE_OR_SET_LIMIT};
pub use dirty::{DirtyFlags, DirtyGroup, GroupKey, InvalidGroupKey, MarkCleanOutcome, DEFAULT_DIRTY_ROOT};
pub use guarded::{call_if_acquired, health_check, locked, CallOutcome, HealthReport};
pub use lock::{DistributedLock, LockError, LockState, NotAcquiredReason, PollingLock};
pub use memory::InMemoryStore;
pub use store::{CoordinationStore, CreateMode, StoreError, ANY_VERSION};

#[cfg(any(test, feature = "testing"))]
pub use lock::MockDistributedLock;
#[cfg(any(test, feature = "testing"))]
pub use store::MockCoordinationStore;
