//! Per-listener backend pool: atomic publication and round-robin selection.

use crate::model::{Endpoint, EndpointKey};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const SELECT_ATTEMPTS: usize = 3;
const SELECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The endpoint set currently eligible to serve one listener.
///
/// A single lock guards the sequence and the round-robin cursor, so readers
/// always see either the previous publication or the new one in full.
pub struct BackendPool {
    port_name: String,
    inner: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    endpoints: Vec<Arc<Endpoint>>,
    cursor: usize,
}

impl BackendPool {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            inner: Mutex::new(PoolState::default()),
        }
    }

    /// The backend port name this pool serves.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Replace the published set. Returns whether anything changed.
    ///
    /// Change is set equality on `(ip, port)`: order-independent,
    /// size-sensitive. A no-op publication leaves the cursor untouched.
    /// On change, endpoints whose key survives keep their existing instance,
    /// so health state, connection counts, and running probes carry over.
    pub async fn publish(&self, new_set: Vec<Endpoint>) -> bool {
        let mut state = self.inner.lock().await;

        let current: HashSet<EndpointKey> = state.endpoints.iter().map(|e| e.key()).collect();
        let incoming: HashSet<EndpointKey> = new_set.iter().map(|e| e.key()).collect();
        if current == incoming {
            return false;
        }

        let mut retained: HashMap<EndpointKey, Arc<Endpoint>> = state
            .endpoints
            .iter()
            .map(|e| (e.key(), e.clone()))
            .collect();

        let mut next = Vec::with_capacity(new_set.len());
        let mut seen = HashSet::new();
        for endpoint in new_set {
            let key = endpoint.key();
            if !seen.insert(key.clone()) {
                continue;
            }
            match retained.remove(&key) {
                Some(existing) => next.push(existing),
                None => next.push(Arc::new(endpoint)),
            }
        }

        state.endpoints = next;
        state.cursor = 0;
        true
    }

    /// Select one healthy endpoint round-robin, or `None` when the pool has
    /// no healthy endpoint for this port name.
    ///
    /// When the cursor lands on an unhealthy endpoint the guard is released,
    /// the call sleeps 100 ms and tries again, up to three attempts total.
    /// Never blocks indefinitely, never returns an unhealthy endpoint.
    pub async fn next(&self) -> Option<Arc<Endpoint>> {
        for attempt in 0..SELECT_ATTEMPTS {
            {
                let mut state = self.inner.lock().await;
                let matching: Vec<Arc<Endpoint>> = state
                    .endpoints
                    .iter()
                    .filter(|e| e.port_name == self.port_name)
                    .cloned()
                    .collect();

                if matching.is_empty() {
                    return None;
                }

                let idx = state.cursor % matching.len();
                state.cursor = idx + 1;

                if matching[idx].is_healthy() {
                    return Some(matching[idx].clone());
                }
            }

            if attempt + 1 < SELECT_ATTEMPTS {
                tokio::time::sleep(SELECT_RETRY_DELAY).await;
            }
        }

        None
    }

    /// Current publication, in publication order.
    pub async fn snapshot(&self) -> Vec<Arc<Endpoint>> {
        self.inner.lock().await.endpoints.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.endpoints.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.endpoints.is_empty()
    }
}
