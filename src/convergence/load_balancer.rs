// Load balancer reconciliation, run as part of the same planning pass

use std::collections::{HashMap, HashSet};

use super::types::{
    ConvergenceStep, LoadBalancerConfig, LoadBalancerNode, ServerRecord, ServerState,
};

/// Chooses the address a server is registered under on load balancers.
pub trait AddressPolicy: Send + Sync {
    fn node_address(&self, server: &ServerRecord) -> Option<String>;
}

/// Uses the first address the server has on a named network.
#[derive(Debug, Clone)]
pub struct NetworkAddressPolicy {
    network: String,
}

impl NetworkAddressPolicy {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }
}

impl Default for NetworkAddressPolicy {
    fn default() -> Self {
        Self::new("private")
    }
}

impl AddressPolicy for NetworkAddressPolicy {
    fn node_address(&self, server: &ServerRecord) -> Option<String> {
        server
            .addresses
            .get(&self.network)
            .and_then(|addresses| addresses.first())
            .cloned()
    }
}

/// Diff observed load balancer nodes against what the surviving servers need.
///
/// `inventory` holds every server in a recognised state; `surviving` is the
/// subset that remains after this plan's deletions. Nodes whose address does
/// not belong to any inventory server are left alone, and a node is only
/// removed as a deleted server's when no surviving server has its address.
pub(crate) fn reconcile(
    configs: &[LoadBalancerConfig],
    inventory: &[&ServerRecord],
    surviving: &[&ServerRecord],
    observed: &[LoadBalancerNode],
    policy: &dyn AddressPolicy,
) -> Vec<ConvergenceStep> {
    // a surviving server owns its address even when a deleted server shares it
    let mut owners: HashMap<String, &ServerRecord> = HashMap::new();
    for server in surviving.iter().chain(inventory.iter()) {
        if let Some(address) = policy.node_address(server) {
            owners.entry(address).or_insert(*server);
        }
    }
    let surviving_ids: HashSet<&str> = surviving.iter().map(|s| s.id.as_str()).collect();

    let mut steps = Vec::new();
    let mut present: HashSet<(&str, &str, u16)> = HashSet::new();

    for node in observed {
        let Some(owner) = owners.get(node.address.as_str()) else {
            continue;
        };

        if !surviving_ids.contains(owner.id.as_str()) {
            steps.push(remove(node));
            continue;
        }

        let config = configs
            .iter()
            .find(|c| c.loadbalancer_id == node.loadbalancer_id && c.port == node.port);
        let Some(config) = config else {
            steps.push(remove(node));
            continue;
        };

        if !present.insert((node.loadbalancer_id.as_str(), node.address.as_str(), node.port)) {
            // duplicate registration of the same address/port
            steps.push(remove(node));
            continue;
        }

        if node.condition != config.condition || node.weight != config.weight {
            steps.push(ConvergenceStep::ChangeLoadBalancerNode {
                loadbalancer_id: node.loadbalancer_id.clone(),
                node_id: node.node_id.clone(),
                condition: config.condition,
                weight: config.weight,
            });
        }
    }

    for server in surviving.iter().filter(|s| s.state == ServerState::Active) {
        let Some(address) = policy.node_address(server) else {
            continue;
        };
        for config in configs {
            if present.contains(&(config.loadbalancer_id.as_str(), address.as_str(), config.port)) {
                continue;
            }
            steps.push(ConvergenceStep::AddToLoadBalancer {
                loadbalancer_id: config.loadbalancer_id.clone(),
                address: address.clone(),
                port: config.port,
                condition: config.condition,
                weight: config.weight,
                node_type: config.node_type,
            });
        }
    }

    steps
}

fn remove(node: &LoadBalancerNode) -> ConvergenceStep {
    ConvergenceStep::RemoveFromLoadBalancer {
        loadbalancer_id: node.loadbalancer_id.clone(),
        node_id: node.node_id.clone(),
    }
}
