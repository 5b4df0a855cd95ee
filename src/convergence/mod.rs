// Convergence Module - Pure Reconciliation Policy
//
// Diffs a group's desired state against the observed server and load
// balancer inventory, producing a step plan that translates into abstract
// outbound requests. Nothing in here performs I/O.

pub mod types;
pub mod planner;
pub mod load_balancer;
pub mod request;

pub use types::{
    ConvergencePlan, ConvergenceStep, DesiredGroupState, LaunchConfig, LoadBalancerConfig,
    LoadBalancerNode, NodeCondition, NodeType, ServerRecord, ServerState,
};
pub use planner::{converge, Planner, DEFAULT_BUILD_TIMEOUT_SECONDS};
pub use load_balancer::{AddressPolicy, NetworkAddressPolicy};
pub use request::{Method, Request, ServiceType};
