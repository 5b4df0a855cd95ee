// Autoscale Converge Library - Reconciliation Core
// Convergence planning plus the coordination primitives that serialize
// its execution across a fleet of workers

pub mod config;
pub mod convergence;
pub mod coordination;
pub mod events;
pub mod observability;
pub mod telemetry;
pub mod worker;

// Re-export key types for easy access
pub use config::{config, ConvergeConfig};
pub use convergence::{
    converge, AddressPolicy, ConvergencePlan, ConvergenceStep, DesiredGroupState,
    NetworkAddressPolicy, Planner, Request, ServerRecord, ServerState,
};
pub use coordination::{
    call_if_acquired, create_or_set, health_check, locked, CallOutcome, CoordinationStore,
    CreateOrSetError, DirtyFlags, DistributedLock, GroupKey, InMemoryStore, LockError,
    PollingLock, StoreError,
};
pub use events::{Event, EventSink, FormattingSink, MessageRegistry, TracingSink};
pub use observability::{convergence_metrics, ConvergenceMetrics, OperationTimer};
pub use telemetry::{create_convergence_span, generate_correlation_id, init_telemetry};
pub use worker::{ConvergenceRunner, GroupStateSource, RequestExecutor, StepStatus};
