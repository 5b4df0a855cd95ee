// Worker - drives convergence of dirty groups
//
// Reads group state through a `GroupStateSource`, plans with the convergence
// planner and hands the resulting requests to a `RequestExecutor`, all under
// the group's distributed lock.

pub mod runner;
pub mod traits;

pub use runner::{ConvergenceRunner, CycleReport, GroupOutcome, GroupRun, RunnerSettings};
pub use traits::{GroupStateSource, RequestExecutor, StepStatus};

#[cfg(any(test, feature = "testing"))]
pub use traits::{MockGroupStateSource, MockRequestExecutor};
