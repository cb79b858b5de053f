//! Endpoint health tracking.
//!
//! Each endpoint gets one probe task that periodically dials `ip:port` and
//! flips the endpoint's health flag with debouncing: three consecutive
//! failures mark it unhealthy, a single success marks it healthy again.

use crate::model::{Endpoint, EndpointKey};
use crate::shutdown::ShutdownController;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Time between probes of one endpoint. Fixed; not exposed in configuration.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Deadline for a single probe dial.
pub const PROBE_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Consecutive failures required to mark a healthy endpoint unhealthy.
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// Debounce counter for one probe.
#[derive(Debug, Default)]
struct DebounceState {
    consecutive_failures: u32,
}

#[derive(Debug, PartialEq, Eq)]
enum HealthTransition {
    BecameHealthy,
    BecameUnhealthy,
}

impl DebounceState {
    /// Apply one probe outcome to the endpoint, returning the transition it
    /// caused, if any.
    fn observe(&mut self, endpoint: &Endpoint, success: bool) -> Option<HealthTransition> {
        if success {
            self.consecutive_failures = 0;
            if !endpoint.is_healthy() {
                endpoint.set_healthy(true);
                return Some(HealthTransition::BecameHealthy);
            }
            None
        } else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= UNHEALTHY_THRESHOLD && endpoint.is_healthy() {
                endpoint.set_healthy(false);
                return Some(HealthTransition::BecameUnhealthy);
            }
            None
        }
    }
}

/// Periodic TCP probe for one endpoint.
pub struct HealthProbe {
    endpoint: Arc<Endpoint>,
    interval: Duration,
}

impl HealthProbe {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self::with_interval(endpoint, PROBE_INTERVAL)
    }

    /// Probe with a custom interval. Tests use this to compress time.
    pub fn with_interval(endpoint: Arc<Endpoint>, interval: Duration) -> Self {
        Self { endpoint, interval }
    }

    /// Probe loop. Runs until `stop` is signalled or its sender is dropped.
    ///
    /// The sleep is `interval - (now - last_check)` clamped to zero, and
    /// `last_check` advances after every attempt, so the cadence
    /// self-corrects against drift. The first probe fires immediately.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut state = DebounceState::default();
        let mut last_check: Option<Instant> = None;

        tracing::debug!("starting health probe for {}", self.endpoint);

        loop {
            let sleep_for = match last_check {
                None => Duration::ZERO,
                Some(t) => self.interval.saturating_sub(t.elapsed()),
            };

            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
            if *stop.borrow() {
                break;
            }

            let success = Self::dial(&self.endpoint).await;

            if !success && state.consecutive_failures == 0 {
                tracing::warn!("health probe failed for {}", self.endpoint);
            }

            match state.observe(&self.endpoint, success) {
                Some(HealthTransition::BecameUnhealthy) => {
                    tracing::info!(
                        "backend {} is now unhealthy ({} consecutive failures)",
                        self.endpoint,
                        UNHEALTHY_THRESHOLD
                    );
                }
                Some(HealthTransition::BecameHealthy) => {
                    tracing::info!("backend {} is now healthy", self.endpoint);
                }
                None => {}
            }

            last_check = Some(Instant::now());
        }

        tracing::debug!("health probe for {} stopped", self.endpoint);
    }

    /// One probe: TCP connect with a 2 s deadline, closed immediately.
    async fn dial(endpoint: &Endpoint) -> bool {
        match tokio::time::timeout(PROBE_DIAL_TIMEOUT, TcpStream::connect(endpoint.addr())).await {
            Ok(Ok(mut stream)) => {
                let _ = stream.shutdown().await;
                true
            }
            _ => false,
        }
    }
}

/// Probe tasks for one proxy, at most one per `(ip, port)`.
pub struct ProbeRegistry {
    probes: DashMap<EndpointKey, watch::Sender<bool>>,
    interval: Duration,
    shutdown: ShutdownController,
}

impl ProbeRegistry {
    pub fn new(shutdown: ShutdownController) -> Self {
        Self::with_interval(shutdown, PROBE_INTERVAL)
    }

    pub fn with_interval(shutdown: ShutdownController, interval: Duration) -> Self {
        Self {
            probes: DashMap::new(),
            interval,
            shutdown,
        }
    }

    /// Align running probes with the latest publication: probes for removed
    /// endpoints are signalled to terminate, retained ones are left running,
    /// new ones are started.
    pub fn reconcile(&self, endpoints: &[Arc<Endpoint>]) {
        let desired: HashSet<EndpointKey> = endpoints.iter().map(|e| e.key()).collect();

        self.probes.retain(|key, tx| {
            if desired.contains(key) {
                true
            } else {
                let _ = tx.send(true);
                false
            }
        });

        for endpoint in endpoints {
            match self.probes.entry(endpoint.key()) {
                Entry::Occupied(_) => {}
                Entry::Vacant(vacant) => {
                    let (tx, rx) = watch::channel(false);
                    vacant.insert(tx);

                    let probe = HealthProbe::with_interval(endpoint.clone(), self.interval);
                    let guard = self.shutdown.probe_guard();
                    tokio::spawn(async move {
                        let _guard = guard;
                        probe.run(rx).await;
                    });
                }
            }
        }
    }

    /// Signal every probe to terminate.
    pub fn stop_all(&self) {
        self.probes.retain(|_, tx| {
            let _ = tx.send(true);
            false
        });
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn has_probe(&self, key: &EndpointKey) -> bool {
        self.probes.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_endpoint(port: u16) -> Arc<Endpoint> {
        Arc::new(Endpoint::new("127.0.0.1", port, "http"))
    }

    #[test]
    fn test_debounce_requires_three_consecutive_failures() {
        let endpoint = Endpoint::new("10.0.0.1", 30080, "http");
        let mut state = DebounceState::default();

        assert_eq!(state.observe(&endpoint, false), None);
        assert_eq!(state.observe(&endpoint, false), None);
        assert!(endpoint.is_healthy());

        assert_eq!(
            state.observe(&endpoint, false),
            Some(HealthTransition::BecameUnhealthy)
        );
        assert!(!endpoint.is_healthy());
    }

    #[test]
    fn test_debounce_single_success_recovers() {
        let endpoint = Endpoint::new("10.0.0.1", 30080, "http");
        let mut state = DebounceState::default();

        for _ in 0..3 {
            state.observe(&endpoint, false);
        }
        assert!(!endpoint.is_healthy());

        assert_eq!(
            state.observe(&endpoint, true),
            Some(HealthTransition::BecameHealthy)
        );
        assert!(endpoint.is_healthy());
    }

    #[test]
    fn test_debounce_success_resets_failure_streak() {
        let endpoint = Endpoint::new("10.0.0.1", 30080, "http");
        let mut state = DebounceState::default();

        state.observe(&endpoint, false);
        state.observe(&endpoint, false);
        state.observe(&endpoint, true);
        state.observe(&endpoint, false);
        state.observe(&endpoint, false);

        // Only two failures since the last success.
        assert!(endpoint.is_healthy());

        state.observe(&endpoint, false);
        assert!(!endpoint.is_healthy());
    }

    #[test]
    fn test_debounce_no_repeat_transition_while_unhealthy() {
        let endpoint = Endpoint::new("10.0.0.1", 30080, "http");
        let mut state = DebounceState::default();

        for _ in 0..3 {
            state.observe(&endpoint, false);
        }
        assert_eq!(state.observe(&endpoint, false), None);
        assert_eq!(state.observe(&endpoint, false), None);
        assert!(!endpoint.is_healthy());
    }

    #[test]
    fn test_debounce_success_while_healthy_is_quiet() {
        let endpoint = Endpoint::new("10.0.0.1", 30080, "http");
        let mut state = DebounceState::default();

        assert_eq!(state.observe(&endpoint, true), None);
        assert_eq!(state.observe(&endpoint, true), None);
        assert!(endpoint.is_healthy());
    }

    #[tokio::test]
    async fn test_dial_success_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        assert!(HealthProbe::dial(&test_endpoint(port)).await);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!HealthProbe::dial(&test_endpoint(port)).await);
    }

    #[tokio::test]
    async fn test_probe_marks_dead_endpoint_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = test_endpoint(port);
        assert!(endpoint.is_healthy());

        let (tx, rx) = watch::channel(false);
        let probe = HealthProbe::with_interval(endpoint.clone(), Duration::from_millis(20));
        let handle = tokio::spawn(probe.run(rx));

        // Three probes at 20 ms cadence flip the flag well within a second.
        let deadline = Instant::now() + Duration::from_secs(2);
        while endpoint.is_healthy() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!endpoint.is_healthy());

        let _ = tx.send(true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_recovers_when_listener_returns() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = test_endpoint(addr.port());

        let (tx, rx) = watch::channel(false);
        let probe = HealthProbe::with_interval(endpoint.clone(), Duration::from_millis(20));
        let handle = tokio::spawn(probe.run(rx));

        let deadline = Instant::now() + Duration::from_secs(2);
        while endpoint.is_healthy() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!endpoint.is_healthy());

        // Bring the backend up on the same port; one success recovers.
        let listener = TcpListener::bind(addr).await.unwrap();
        let accept_loop = tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while !endpoint.is_healthy() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(endpoint.is_healthy());

        let _ = tx.send(true);
        handle.await.unwrap();
        accept_loop.abort();
    }

    #[tokio::test]
    async fn test_probe_stops_on_signal_mid_sleep() {
        let endpoint = test_endpoint(1);

        let (tx, rx) = watch::channel(false);
        // Long interval: the stop signal must interrupt the sleep.
        let probe = HealthProbe::with_interval(endpoint, Duration::from_secs(60));
        let handle = tokio::spawn(probe.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(true);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("probe did not stop on signal")
            .unwrap();
    }

    #[tokio::test]
    async fn test_probe_stops_when_sender_dropped() {
        let endpoint = test_endpoint(1);

        let (tx, rx) = watch::channel(false);
        let probe = HealthProbe::with_interval(endpoint, Duration::from_secs(60));
        let handle = tokio::spawn(probe.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("probe did not stop when sender dropped")
            .unwrap();
    }

    fn key(ip: &str, port: u16) -> EndpointKey {
        EndpointKey {
            ip: ip.to_string(),
            port,
        }
    }

    #[tokio::test]
    async fn test_registry_starts_one_probe_per_endpoint() {
        let registry = ProbeRegistry::new(ShutdownController::new());
        let endpoints = vec![test_endpoint(10001), test_endpoint(10002)];

        registry.reconcile(&endpoints);
        assert_eq!(registry.len(), 2);
        assert!(registry.has_probe(&key("127.0.0.1", 10001)));
        assert!(registry.has_probe(&key("127.0.0.1", 10002)));
    }

    #[tokio::test]
    async fn test_registry_reconcile_is_idempotent() {
        let registry = ProbeRegistry::new(ShutdownController::new());
        let endpoints = vec![test_endpoint(10001), test_endpoint(10002)];

        registry.reconcile(&endpoints);
        registry.reconcile(&endpoints);
        registry.reconcile(&endpoints);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_registry_never_duplicates_a_key() {
        let registry = ProbeRegistry::new(ShutdownController::new());

        // Same (ip, port) appearing twice yields a single probe.
        let duplicated = vec![test_endpoint(10001), test_endpoint(10001)];
        registry.reconcile(&duplicated);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_registry_stops_removed_and_starts_new() {
        let controller = ShutdownController::new();
        let registry = ProbeRegistry::new(controller.clone());

        registry.reconcile(&[test_endpoint(10001), test_endpoint(10002)]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.active_probes(), 2);

        registry.reconcile(&[test_endpoint(10002), test_endpoint(10003)]);
        assert_eq!(registry.len(), 2);
        assert!(!registry.has_probe(&key("127.0.0.1", 10001)));
        assert!(registry.has_probe(&key("127.0.0.1", 10003)));

        // The removed endpoint's probe task exits.
        let deadline = Instant::now() + Duration::from_secs(2);
        while controller.active_probes() > 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(controller.active_probes(), 2);
    }

    #[tokio::test]
    async fn test_registry_stop_all_drains() {
        let controller = ShutdownController::new();
        let registry = ProbeRegistry::new(controller.clone());

        registry.reconcile(&[test_endpoint(10001), test_endpoint(10002)]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        controller.shutdown();
        registry.stop_all();
        assert!(registry.is_empty());

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
    }
}
