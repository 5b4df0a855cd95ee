// Core types for group convergence planning

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Server lifecycle states the planner acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerState {
    /// Server is still being provisioned
    Build,
    /// Server is up and serving
    Active,
    /// Server failed; never counts toward capacity
    Error,
    /// Anything else reported by the compute API; ignored by the planner
    #[serde(other)]
    Unknown,
}

/// Snapshot of one server taken at planning time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub state: ServerState,
    pub created: DateTime<Utc>,
    /// Addresses keyed by network name
    #[serde(default)]
    pub addresses: BTreeMap<String, Vec<String>>,
}

impl ServerRecord {
    pub fn new(id: impl Into<String>, state: ServerState, created: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            state,
            created,
            addresses: BTreeMap::new(),
        }
    }

    pub fn with_address(mut self, network: impl Into<String>, address: impl Into<String>) -> Self {
        self.addresses
            .entry(network.into())
            .or_default()
            .push(address.into());
        self
    }
}

/// Opaque launch configuration, passed through to server creation untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaunchConfig(pub Map<String, Value>);

impl LaunchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for LaunchConfig {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Condition of a load balancer node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeCondition {
    #[default]
    Enabled,
    Disabled,
    Draining,
}

impl fmt::Display for NodeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeCondition::Enabled => "ENABLED",
            NodeCondition::Disabled => "DISABLED",
            NodeCondition::Draining => "DRAINING",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    #[default]
    Primary,
    Secondary,
}

fn default_weight() -> u32 {
    1
}

/// Accepts load balancer ids given either as JSON strings or numbers
fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(id) => Ok(id),
        Value::Number(id) => Ok(id.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "load balancer id must be a string or number, got {other}"
        ))),
    }
}

/// A load balancer every server of the group should be attached to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(alias = "loadBalancerId", deserialize_with = "id_from_string_or_number")]
    pub loadbalancer_id: String,
    pub port: u16,
    #[serde(default)]
    pub condition: NodeCondition,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default, rename = "type")]
    pub node_type: NodeType,
}

impl LoadBalancerConfig {
    pub fn new(loadbalancer_id: impl Into<String>, port: u16) -> Self {
        Self {
            loadbalancer_id: loadbalancer_id.into(),
            port,
            condition: NodeCondition::Enabled,
            weight: default_weight(),
            node_type: NodeType::Primary,
        }
    }
}

/// A node observed on a load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerNode {
    pub loadbalancer_id: String,
    pub node_id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub condition: NodeCondition,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// What the group should look like
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredGroupState {
    pub launch_config: LaunchConfig,
    pub desired: u32,
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancerConfig>,
}

impl DesiredGroupState {
    /// Build desired state, picking load balancers out of `args.loadBalancers`
    /// in the launch configuration when it has any.
    pub fn new(launch_config: LaunchConfig, desired: u32) -> Self {
        let load_balancers = launch_config
            .get("args")
            .and_then(|args| args.get("loadBalancers"))
            .map(|lbs| match serde_json::from_value::<Vec<LoadBalancerConfig>>(lbs.clone()) {
                Ok(configs) => configs,
                Err(e) => {
                    tracing::warn!("Ignoring malformed loadBalancers in launch config: {}", e);
                    Vec::new()
                }
            })
            .unwrap_or_default();

        Self {
            launch_config,
            desired,
            load_balancers,
        }
    }

    pub fn with_load_balancers(mut self, load_balancers: Vec<LoadBalancerConfig>) -> Self {
        self.load_balancers = load_balancers;
        self
    }
}

/// One corrective action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ConvergenceStep {
    CreateServer {
        launch_config: LaunchConfig,
    },
    DeleteServer {
        server_id: String,
    },
    AddToLoadBalancer {
        loadbalancer_id: String,
        address: String,
        port: u16,
        condition: NodeCondition,
        weight: u32,
        #[serde(rename = "type")]
        node_type: NodeType,
    },
    RemoveFromLoadBalancer {
        loadbalancer_id: String,
        node_id: String,
    },
    ChangeLoadBalancerNode {
        loadbalancer_id: String,
        node_id: String,
        condition: NodeCondition,
        weight: u32,
    },
}

impl ConvergenceStep {
    pub fn is_create(&self) -> bool {
        matches!(self, ConvergenceStep::CreateServer { .. })
    }

    pub fn deleted_server(&self) -> Option<&str> {
        match self {
            ConvergenceStep::DeleteServer { server_id } => Some(server_id),
            _ => None,
        }
    }
}

/// Unordered multiset of steps. Equality ignores order but respects
/// multiplicity.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ConvergencePlan {
    steps: Vec<ConvergenceStep>,
}

impl ConvergencePlan {
    pub fn new(steps: Vec<ConvergenceStep>) -> Self {
        Self { steps }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[ConvergenceStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ConvergenceStep> {
        self.steps.iter()
    }

    /// Number of occurrences of `step`
    pub fn count(&self, step: &ConvergenceStep) -> usize {
        self.steps.iter().filter(|s| *s == step).count()
    }

    pub fn create_count(&self) -> usize {
        self.steps.iter().filter(|s| s.is_create()).count()
    }

    pub fn deleted_servers(&self) -> Vec<&str> {
        self.steps.iter().filter_map(|s| s.deleted_server()).collect()
    }

    pub fn into_steps(self) -> Vec<ConvergenceStep> {
        self.steps
    }
}

impl PartialEq for ConvergencePlan {
    fn eq(&self, other: &Self) -> bool {
        if self.steps.len() != other.steps.len() {
            return false;
        }

        let mut matched = vec![false; other.steps.len()];
        'outer: for step in &self.steps {
            for (i, candidate) in other.steps.iter().enumerate() {
                if !matched[i] && candidate == step {
                    matched[i] = true;
                    continue 'outer;
                }
            }
            return false;
        }
        true
    }
}

impl FromIterator<ConvergenceStep> for ConvergencePlan {
    fn from_iter<I: IntoIterator<Item = ConvergenceStep>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ConvergencePlan {
    type Item = &'a ConvergenceStep;
    type IntoIter = std::slice::Iter<'a, ConvergenceStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}
