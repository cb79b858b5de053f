//! Core data model: discovered backend endpoints.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// One backend destination discovered from the cluster.
///
/// Identity is the immutable `(ip, port, port_name)` triple. Health and the
/// active-connection count are mutated concurrently: health by the endpoint's
/// probe task, the counter by per-connection tasks.
#[derive(Debug)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
    pub port_name: String,
    healthy: AtomicBool,
    active_connections: AtomicUsize,
}

impl Endpoint {
    /// Create an endpoint. New endpoints start healthy so traffic can flow
    /// immediately after first discovery; the probe task corrects the flag.
    pub fn new(ip: impl Into<String>, port: u16, port_name: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            port_name: port_name.into(),
            healthy: AtomicBool::new(true),
            active_connections: AtomicUsize::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Dialable address, with brackets for IPv6 literals.
    pub fn addr(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }

    /// Identity used for set comparison during discovery diffing.
    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            ip: self.ip.clone(),
            port: self.port,
        }
    }
}

// Set comparison is by (ip, port) only; port_name is deliberately excluded.
impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr(), self.port_name)
    }
}

/// `(ip, port)` identity of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// RAII guard for the active-connection count. Creating one counts a
/// connection against the endpoint; dropping it releases the count, covering
/// every exit path of a connection task.
pub struct ActiveConnectionGuard {
    endpoint: Arc<Endpoint>,
}

impl ActiveConnectionGuard {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        endpoint.active_connections.fetch_add(1, Ordering::Relaxed);
        Self { endpoint }
    }
}

impl Drop for ActiveConnectionGuard {
    fn drop(&mut self) {
        self.endpoint
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}
