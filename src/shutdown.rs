//! Coordinated shutdown: broadcast stop signal plus probe drain tracking.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::Notify;

/// How long the supervisor waits for health probes to drain on shutdown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shutdown coordinator.
///
/// Accept loops and health probes subscribe to the broadcast signal; probe
/// tasks additionally register a drain guard so the supervisor can wait for
/// them. In-flight relays are intentionally not tracked: existing
/// connections drain or terminate naturally.
#[derive(Clone)]
pub struct ShutdownController {
    shutdown_initiated: Arc<AtomicBool>,
    active_probes: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
    drain_complete: Arc<Notify>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            active_probes: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            drain_complete: Arc::new(Notify::new()),
        }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate shutdown. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            tracing::info!("initiating graceful shutdown");
            let _ = self.shutdown_tx.send(());
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    pub fn active_probes(&self) -> usize {
        self.active_probes.load(Ordering::SeqCst)
    }

    /// Register a probe task. The returned guard deregisters on drop.
    pub fn probe_guard(&self) -> ProbeGuard {
        self.active_probes.fetch_add(1, Ordering::SeqCst);
        ProbeGuard {
            controller: self.clone(),
        }
    }

    fn probe_ended(&self) {
        let prev = self.active_probes.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.is_shutdown() {
            self.drain_complete.notify_waiters();
        }
    }

    /// Wait for all probes to drain, up to `timeout`. Returns whether the
    /// drain completed.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        if self.active_probes() == 0 {
            return true;
        }

        tokio::select! {
            _ = self.drain_complete.notified() => true,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    "drain timeout: {} probes still active",
                    self.active_probes()
                );
                false
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII registration of a running probe task.
pub struct ProbeGuard {
    controller: ShutdownController,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.controller.probe_ended();
    }
}

/// Resolves when an OS interrupt or terminate signal arrives, then trips the
/// controller.
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received interrupt, shutting down");
        }
        _ = terminate => {
            tracing::info!("received terminate, shutting down");
        }
    }

    controller.shutdown();
}
