//! Service discovery: translate the cluster inventory into endpoint sets.
//!
//! A single process-wide task polls the inventory on a fixed cadence,
//! materializes one endpoint set per listener configuration, and publishes
//! each set to its proxy when it changed.

use crate::cluster::{ClusterInventory, NodeRecord, ServiceRecord, ServiceType};
use crate::config::ListenerConfig;
use crate::model::Endpoint;
use crate::proxy::Proxy;
use crate::shutdown::ShutdownController;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Annotation a service must carry, set to the literal `"true"`, to opt in.
/// The key is part of the external contract.
pub const ENABLE_ANNOTATION: &str = "nautiluslb.cloudresty.io/enabled";

/// Time between discovery cycles. Fixed; not exposed in configuration.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

pub struct Discoverer {
    inventory: Arc<dyn ClusterInventory>,
    proxies: Vec<Arc<Proxy>>,
    interval: Duration,
    shutdown: ShutdownController,
}

impl Discoverer {
    pub fn new(
        inventory: Arc<dyn ClusterInventory>,
        proxies: Vec<Arc<Proxy>>,
        shutdown: ShutdownController,
    ) -> Self {
        Self::with_interval(inventory, proxies, shutdown, DISCOVERY_INTERVAL)
    }

    /// Discoverer with a custom cadence. Tests use this to compress time.
    pub fn with_interval(
        inventory: Arc<dyn ClusterInventory>,
        proxies: Vec<Arc<Proxy>>,
        shutdown: ShutdownController,
        interval: Duration,
    ) -> Self {
        Self {
            inventory,
            proxies,
            interval,
            shutdown,
        }
    }

    /// Run discovery cycles until shutdown. The first cycle runs
    /// immediately.
    pub async fn run(self) {
        let mut stop = self.shutdown.subscribe();

        loop {
            self.cycle().await;

            tokio::select! {
                _ = stop.recv() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            if self.shutdown.is_shutdown() {
                break;
            }
        }

        tracing::debug!("service discovery stopped");
    }

    /// One discovery cycle.
    ///
    /// Configurations are grouped by namespace so each group costs one
    /// inventory query; a fetch failure skips the group and leaves its
    /// previously published pools untouched. Each proxy sees at most one
    /// publication per cycle.
    pub async fn cycle(&self) {
        let mut groups: HashMap<Option<String>, Vec<Arc<Proxy>>> = HashMap::new();
        for proxy in &self.proxies {
            groups
                .entry(proxy.config().namespace().map(str::to_string))
                .or_default()
                .push(proxy.clone());
        }

        // Node list is fetched at most once per cycle, and only when a
        // node-addressed service actually needs it.
        let mut node_cache: Option<Vec<NodeRecord>> = None;

        for (namespace, proxies) in groups {
            let services = match self.inventory.list_services(namespace.as_deref()).await {
                Ok(services) => services,
                Err(e) => {
                    match &namespace {
                        Some(ns) => {
                            tracing::error!("failed to list services in namespace '{}': {:#}", ns, e)
                        }
                        None => tracing::error!("failed to list services: {:#}", e),
                    }
                    continue;
                }
            };

            tracing::debug!(
                "discovered {} services in {}",
                services.len(),
                namespace.as_deref().unwrap_or("all namespaces")
            );

            for proxy in proxies {
                let endpoints = self
                    .materialize(proxy.config(), &services, &mut node_cache)
                    .await;
                proxy.publish(endpoints).await;
            }
        }
    }

    /// Compute the endpoint set for one configuration over a service list.
    async fn materialize(
        &self,
        config: &ListenerConfig,
        services: &[ServiceRecord],
        node_cache: &mut Option<Vec<NodeRecord>>,
    ) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();

        for service in services {
            let enabled = service
                .annotations
                .get(ENABLE_ANNOTATION)
                .map(String::as_str)
                == Some("true");
            if !enabled {
                continue;
            }

            tracing::debug!("found annotated service: {}", service.qualified_name());

            match service.service_type {
                ServiceType::NodePort | ServiceType::LoadBalancer => {
                    let matching: Vec<_> = service
                        .ports
                        .iter()
                        .filter(|p| p.name == config.backend_port_name && p.node_port > 0)
                        .collect();
                    if matching.is_empty() {
                        continue;
                    }

                    let nodes = self.nodes(node_cache).await;
                    for port in matching {
                        for node in &nodes {
                            match node.internal_address() {
                                Some(ip) => endpoints.push(Endpoint::new(
                                    ip,
                                    port.node_port,
                                    port.name.clone(),
                                )),
                                None => tracing::debug!(
                                    "node {} has no internal address, skipping",
                                    node.name
                                ),
                            }
                        }
                    }
                }
                ServiceType::ClusterIp => {
                    if service.cluster_ip.is_empty() || service.cluster_ip == "None" {
                        continue;
                    }
                    for port in &service.ports {
                        if port.name == config.backend_port_name && port.target_port > 0 {
                            endpoints.push(Endpoint::new(
                                service.cluster_ip.clone(),
                                port.target_port,
                                port.name.clone(),
                            ));
                        }
                    }
                }
                ServiceType::Other => {
                    tracing::debug!(
                        "skipping service {} with unsupported type",
                        service.qualified_name()
                    );
                }
            }
        }

        endpoints
    }

    async fn nodes(&self, cache: &mut Option<Vec<NodeRecord>>) -> Vec<NodeRecord> {
        if let Some(nodes) = cache {
            return nodes.clone();
        }

        let nodes = match self.inventory.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::error!("failed to list nodes: {:#}", e);
                Vec::new()
            }
        };

        *cache = Some(nodes.clone());
        nodes
    }
}
