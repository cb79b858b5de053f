//! Read-only view of the cluster's service and node inventory.
//!
//! The discoverer consumes only this surface. The production implementation
//! ([`http::ApiClient`]) talks to the Kubernetes API server; tests supply
//! in-memory fakes.

mod http;

pub use http::ApiClient;

use async_trait::async_trait;
use std::collections::HashMap;

/// Kubernetes service exposure shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    NodePort,
    LoadBalancer,
    ClusterIp,
    Other,
}

impl ServiceType {
    pub fn parse(s: &str) -> Self {
        match s {
            "NodePort" => Self::NodePort,
            "LoadBalancer" => Self::LoadBalancer,
            "ClusterIP" => Self::ClusterIp,
            _ => Self::Other,
        }
    }
}

/// One named port of a service. Zero means unset.
#[derive(Debug, Clone, Default)]
pub struct ServicePort {
    pub name: String,
    pub node_port: u16,
    pub target_port: u16,
}

/// One service from the inventory, reduced to the fields discovery needs.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub namespace: String,
    pub name: String,
    pub annotations: HashMap<String, String>,
    pub service_type: ServiceType,
    pub cluster_ip: String,
    pub ports: Vec<ServicePort>,
}

impl ServiceRecord {
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Classification of a node address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    InternalIp,
    ExternalIp,
    Hostname,
    Other,
}

impl AddressKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "InternalIP" => Self::InternalIp,
            "ExternalIP" => Self::ExternalIp,
            "Hostname" => Self::Hostname,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeAddress {
    pub kind: AddressKind,
    pub address: String,
}

/// One cluster node with its reported addresses.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub name: String,
    pub addresses: Vec<NodeAddress>,
}

impl NodeRecord {
    /// First internal address, if the node reports one.
    pub fn internal_address(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.kind == AddressKind::InternalIp)
            .map(|a| a.address.as_str())
    }
}

/// The two read operations discovery needs from the orchestrator.
#[async_trait]
pub trait ClusterInventory: Send + Sync {
    /// List services, scoped to a namespace or across all of them.
    async fn list_services(&self, namespace: Option<&str>) -> anyhow::Result<Vec<ServiceRecord>>;

    /// List cluster nodes.
    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeRecord>>;
}
