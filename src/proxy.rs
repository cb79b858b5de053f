//! Accept/forward engine: one proxy per listener configuration.

use crate::config::{extract_port, ListenerConfig};
use crate::health::ProbeRegistry;
use crate::model::{ActiveConnectionGuard, Endpoint};
use crate::pool::BackendPool;
use crate::shutdown::ShutdownController;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{self, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Proxy lifecycle. Transitions are one-way and monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProxyState {
    Created,
    Listening,
    Stopping,
    Stopped,
}

impl ProxyState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Listening,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// One listener: owns the accept loop, the backend pool, and the lifetime of
/// the health probes for its endpoints.
pub struct Proxy {
    config: ListenerConfig,
    pool: Arc<BackendPool>,
    probes: ProbeRegistry,
    state: AtomicU8,
    shutdown: ShutdownController,
}

impl Proxy {
    pub fn new(config: ListenerConfig, shutdown: ShutdownController) -> Self {
        Self {
            pool: Arc::new(BackendPool::new(config.backend_port_name.clone())),
            probes: ProbeRegistry::new(shutdown.clone()),
            state: AtomicU8::new(ProxyState::Created as u8),
            shutdown,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn state(&self) -> ProxyState {
        ProxyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn advance_state(&self, next: ProxyState) {
        self.state.fetch_max(next as u8, Ordering::SeqCst);
    }

    /// Publish a newly discovered endpoint set. When the set actually
    /// changed, health probes are reconciled to match. Returns `changed`.
    pub async fn publish(&self, endpoints: Vec<Endpoint>) -> bool {
        let changed = self.pool.publish(endpoints).await;
        if changed {
            let snapshot = self.pool.snapshot().await;
            self.probes.reconcile(&snapshot);
            tracing::info!(
                "configuration '{}': published {} backends",
                self.config.name,
                snapshot.len()
            );
        }
        changed
    }

    /// Bind the listener and run the accept loop until shutdown.
    ///
    /// A bind failure is fatal for this proxy only; the caller decides what
    /// to do with the error. Transient accept errors are logged and the loop
    /// continues.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let port = extract_port(&self.config.listener_address).to_string();

        let listener = match TcpListener::bind(self.config.bind_addr()).await {
            Ok(l) => l,
            Err(e) => {
                self.advance_state(ProxyState::Stopped);
                return Err(e).with_context(|| format!("failed to listen on port '{}'", port));
            }
        };

        self.advance_state(ProxyState::Listening);
        tracing::info!("listening on port '{}'", port);

        let mut stop = self.shutdown.subscribe();

        while !self.shutdown.is_shutdown() {
            tokio::select! {
                _ = stop.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let proxy = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = proxy.handle_connection(stream, addr).await {
                                tracing::error!("connection error from {}: {:?}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("failed to accept connection: {}", e);
                    }
                }
            }
        }

        self.advance_state(ProxyState::Stopping);
        drop(listener);
        self.probes.stop_all();
        self.advance_state(ProxyState::Stopped);
        tracing::info!("stopped listening on port '{}'", port);
        Ok(())
    }

    async fn handle_connection(
        &self,
        client_stream: TcpStream,
        client_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let client_ip = client_addr.ip();
        tracing::debug!(
            "new inbound connection from '{}' on listener port '{}'",
            client_ip,
            extract_port(&self.config.listener_address)
        );

        let backend = match self.pool.next().await {
            Some(b) => b,
            None => {
                tracing::warn!(
                    "no healthy backends available for configuration '{}' (client '{}')",
                    self.config.name,
                    client_ip
                );
                return Ok(());
            }
        };

        let _active = ActiveConnectionGuard::new(backend.clone());
        tracing::debug!("forwarding '{}' to backend {}", client_ip, backend);

        let dial = TcpStream::connect(backend.addr());
        let backend_stream = match tokio::time::timeout(self.config.dial_timeout(), dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    tracing::error!(
                        "connection refused by backend {} for client '{}': {}",
                        backend,
                        client_ip,
                        e
                    );
                } else {
                    tracing::error!(
                        "network error connecting to backend {} for client '{}': {}",
                        backend,
                        client_ip,
                        e
                    );
                }
                return Ok(());
            }
            Err(_) => {
                tracing::error!(
                    "timed out dialing backend {} for client '{}'",
                    backend,
                    client_ip
                );
                return Ok(());
            }
        };

        relay(client_stream, backend_stream).await;
        tracing::debug!("releasing backend {}", backend);
        Ok(())
    }
}

/// Bidirectional byte relay. Each direction copies until its source reaches
/// end-of-stream or fails, then half-closes the peer's write side so the
/// other direction can drain. Both connections close on return.
async fn relay(client: TcpStream, backend: TcpStream) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut backend_read, mut backend_write) = backend.into_split();

    let client_to_backend = tokio::spawn(async move {
        let result = io::copy(&mut client_read, &mut backend_write).await;
        let _ = backend_write.shutdown().await;
        result
    });

    let backend_to_client = tokio::spawn(async move {
        let result = io::copy(&mut backend_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    });

    let (c2b, b2c) = tokio::join!(client_to_backend, backend_to_client);

    if let Ok(Err(e)) = c2b {
        tracing::debug!("client->backend copy error: {:?}", e);
    }
    if let Ok(Err(e)) = b2c {
        tracing::debug!("backend->client copy error: {:?}", e);
    }
}
