// Collaborators the convergence runner depends on

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::convergence::{DesiredGroupState, LoadBalancerNode, Request, ServerRecord};
use crate::coordination::GroupKey;

/// Outcome of executing one request. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Success,
    /// Not done yet; run convergence again
    Retry,
    Failure,
}

impl StepStatus {
    /// Worst of `statuses`; an empty plan is a success
    pub fn worst<I: IntoIterator<Item = StepStatus>>(statuses: I) -> StepStatus {
        statuses.into_iter().max().unwrap_or(StepStatus::Success)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepStatus::Success => "SUCCESS",
            StepStatus::Retry => "RETRY",
            StepStatus::Failure => "FAILURE",
        };
        f.write_str(name)
    }
}

/// Read side of a group: what it should look like and what exists
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait GroupStateSource: Send + Sync {
    async fn desired_state(&self, group: &GroupKey) -> Result<DesiredGroupState>;

    async fn servers(&self, group: &GroupKey) -> Result<Vec<ServerRecord>>;

    async fn load_balancer_nodes(&self, group: &GroupKey) -> Result<Vec<LoadBalancerNode>>;
}

/// Issues outbound requests against the tenant's service endpoints.
/// Authentication, HTTP retries and response interpretation live behind it.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, group: &GroupKey, request: &Request) -> Result<StepStatus>;
}
