// Step -> Request translation
//
// Every step maps to exactly one abstract outbound request. Execution is
// left to a `RequestExecutor`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use super::types::ConvergenceStep;

/// The API a request is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    Compute,
    LoadBalancer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Abstract outbound call. `path` is relative to the tenant's service
/// endpoint, e.g. `servers/abc123`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub service: ServiceType,
    pub method: Method,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Request {
    fn new(service: ServiceType, method: Method, path: String) -> Self {
        Self {
            service,
            method,
            path,
            data: None,
        }
    }

    fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} {}", self.service, self.method, self.path)
    }
}

impl ConvergenceStep {
    /// Translate this step into the request that performs it
    pub fn as_request(&self) -> Request {
        match self {
            ConvergenceStep::CreateServer { launch_config } => {
                Request::new(ServiceType::Compute, Method::Post, "servers".to_string())
                    .with_data(launch_config.as_value())
            }
            ConvergenceStep::DeleteServer { server_id } => Request::new(
                ServiceType::Compute,
                Method::Delete,
                format!("servers/{server_id}"),
            ),
            ConvergenceStep::AddToLoadBalancer {
                loadbalancer_id,
                address,
                port,
                condition,
                weight,
                node_type,
            } => Request::new(
                ServiceType::LoadBalancer,
                Method::Post,
                format!("loadbalancers/{loadbalancer_id}/nodes"),
            )
            .with_data(json!({
                "nodes": [{
                    "address": address,
                    "port": port,
                    "condition": condition,
                    "weight": weight,
                    "type": node_type,
                }]
            })),
            ConvergenceStep::RemoveFromLoadBalancer {
                loadbalancer_id,
                node_id,
            } => Request::new(
                ServiceType::LoadBalancer,
                Method::Delete,
                format!("loadbalancers/{loadbalancer_id}/{node_id}"),
            ),
            ConvergenceStep::ChangeLoadBalancerNode {
                loadbalancer_id,
                node_id,
                condition,
                weight,
            } => Request::new(
                ServiceType::LoadBalancer,
                Method::Put,
                format!("loadbalancers/{loadbalancer_id}/nodes/{node_id}"),
            )
            .with_data(json!({
                "condition": condition,
                "weight": weight,
            })),
        }
    }
}
