// Convergence planner - diff desired group state against observed inventory
//
// Pure and synchronous: the plan depends only on (desired state, inventory
// snapshot, now). Running it twice on the same inputs yields the same plan.

use std::collections::HashSet;
use std::iter;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::load_balancer::{self, AddressPolicy, NetworkAddressPolicy};
use super::types::{
    ConvergencePlan, ConvergenceStep, DesiredGroupState, LoadBalancerNode, ServerRecord,
    ServerState,
};

/// Servers building for at least this long are considered failed
pub const DEFAULT_BUILD_TIMEOUT_SECONDS: i64 = 3600;

/// Convergence planner configured with a build timeout and an address policy
#[derive(Clone)]
pub struct Planner {
    build_timeout: Duration,
    address_policy: Arc<dyn AddressPolicy>,
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(
            Duration::seconds(DEFAULT_BUILD_TIMEOUT_SECONDS),
            Arc::new(NetworkAddressPolicy::default()),
        )
    }
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("build_timeout", &self.build_timeout)
            .finish_non_exhaustive()
    }
}

impl Planner {
    pub fn new(build_timeout: Duration, address_policy: Arc<dyn AddressPolicy>) -> Self {
        Self {
            build_timeout,
            address_policy,
        }
    }

    pub fn build_timeout(&self) -> Duration {
        self.build_timeout
    }

    /// Compute the steps that move the observed group toward `desired`.
    ///
    /// ERROR servers are always deleted. BUILD servers older than the build
    /// timeout are deleted and only replaced if capacity falls short without
    /// them. Remaining capacity is then topped up or trimmed, trimming
    /// building servers before active ones, oldest first.
    pub fn converge(
        &self,
        desired: &DesiredGroupState,
        servers: &[ServerRecord],
        lb_nodes: &[LoadBalancerNode],
        now: DateTime<Utc>,
    ) -> ConvergencePlan {
        let mut active = Vec::new();
        let mut building = Vec::new();
        let mut errored = Vec::new();
        for server in servers {
            match server.state {
                ServerState::Active => active.push(server),
                ServerState::Build => building.push(server),
                ServerState::Error => errored.push(server),
                ServerState::Unknown => {}
            }
        }

        let (timed_out, waiting): (Vec<&ServerRecord>, Vec<&ServerRecord>) = building
            .into_iter()
            .partition(|server| self.is_timed_out(server, now));

        let mut steps = Vec::new();
        let mut deleted: HashSet<&str> = HashSet::new();

        for server in errored.iter().chain(timed_out.iter()) {
            deleted.insert(&server.id);
            steps.push(delete_step(server));
        }

        let count = active.len() + waiting.len();
        let wanted = desired.desired as usize;

        if count < wanted {
            let create = ConvergenceStep::CreateServer {
                launch_config: desired.launch_config.clone(),
            };
            steps.extend(iter::repeat(create).take(wanted - count));
        } else if count > wanted {
            let mut candidates: Vec<&ServerRecord> =
                waiting.iter().chain(active.iter()).copied().collect();
            candidates.sort_by(|a, b| {
                scale_down_rank(a.state)
                    .cmp(&scale_down_rank(b.state))
                    .then_with(|| a.created.cmp(&b.created))
                    .then_with(|| a.id.cmp(&b.id))
            });
            for server in candidates.into_iter().take(count - wanted) {
                deleted.insert(&server.id);
                steps.push(delete_step(server));
            }
        }

        let inventory: Vec<&ServerRecord> = active
            .iter()
            .chain(waiting.iter())
            .chain(timed_out.iter())
            .chain(errored.iter())
            .copied()
            .collect();
        let surviving: Vec<&ServerRecord> = active
            .iter()
            .chain(waiting.iter())
            .filter(|server| !deleted.contains(server.id.as_str()))
            .copied()
            .collect();

        steps.extend(load_balancer::reconcile(
            &desired.load_balancers,
            &inventory,
            &surviving,
            lb_nodes,
            self.address_policy.as_ref(),
        ));

        ConvergencePlan::new(steps)
    }

    fn is_timed_out(&self, server: &ServerRecord, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(server.created) >= self.build_timeout
    }
}

/// Plan with the default build timeout and address policy.
pub fn converge(
    desired: &DesiredGroupState,
    servers: &[ServerRecord],
    lb_nodes: &[LoadBalancerNode],
    now: DateTime<Utc>,
) -> ConvergencePlan {
    Planner::default().converge(desired, servers, lb_nodes, now)
}

// Building capacity goes first when scaling down
fn scale_down_rank(state: ServerState) -> u8 {
    match state {
        ServerState::Build => 0,
        _ => 1,
    }
}

fn delete_step(server: &ServerRecord) -> ConvergenceStep {
    ConvergenceStep::DeleteServer {
        server_id: server.id.clone(),
    }
}
