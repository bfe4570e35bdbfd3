//! Startup and shutdown orchestration (spec §4.7): bring the store,
//! registry and control listener up in order, restore prior tunnels,
//! then wait for a signal and drain within a bounded deadline.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use tunnelbroker_store::{Store, StoreError};

use crate::control::handle_control_connection;
use crate::pairing::PairingTable;
use crate::registry::Registry;
use crate::restorer::{restore_tunnels, RestoreSummary};

/// Everything the running broker needs, built once at startup and handed
/// to every control connection and restored Tunnel.
pub struct Lifecycle {
    store: Arc<Store>,
    registry: Arc<Registry>,
    pairing: Arc<PairingTable>,
    /// Address new and restored public tunnel listeners bind to, same as
    /// the control listener's configured bind address (spec §6.4).
    public_bind_addr: IpAddr,
    shutdown: broadcast::Sender<()>,
}

impl Lifecycle {
    /// Connect to the store (running migrations) and build an empty
    /// registry and pairing table. Does not yet restore or listen.
    pub async fn bootstrap(database_url: &str, public_bind_addr: IpAddr) -> Result<Self, StoreError> {
        let store = Arc::new(Store::connect(database_url).await?);
        let (shutdown, _rx) = broadcast::channel(1);
        Ok(Lifecycle {
            store,
            registry: Arc::new(Registry::new()),
            pairing: Arc::new(PairingTable::new()),
            public_bind_addr,
            shutdown,
        })
    }

    /// Sweep stale sessions and rebind every still-active public port.
    pub async fn restore(&self, stale_threshold: Duration) -> Result<RestoreSummary, StoreError> {
        restore_tunnels(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.pairing),
            stale_threshold,
            self.public_bind_addr,
            self.shutdown.clone(),
        )
        .await
    }

    /// Run the control-port accept loop until a shutdown signal fires,
    /// then wait up to `drain_deadline` for in-flight work before
    /// returning.
    pub async fn run_control_listener(
        &self,
        bind_addr: SocketAddr,
        drain_deadline: Duration,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(%bind_addr, "control listener bound");

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("control listener shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let pairing = Arc::clone(&self.pairing);
                            let store = Arc::clone(&self.store);
                            let public_bind_addr = self.public_bind_addr;
                            let shutdown = self.shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_control_connection(
                                    socket,
                                    addr,
                                    registry,
                                    pairing,
                                    store,
                                    public_bind_addr,
                                    shutdown,
                                )
                                .await
                                {
                                    warn!(%addr, %err, "control connection failed");
                                }
                            });
                        }
                        Err(err) => warn!(%err, "control accept failed"),
                    }
                }
            }
        }

        self.drain(drain_deadline).await;
        Ok(())
    }

    /// Fire the shutdown signal. Called once, typically from a
    /// `tokio::signal::ctrl_c()` task.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    async fn drain(&self, deadline: Duration) {
        let start = tokio::time::Instant::now();
        while tokio::time::Instant::now().duration_since(start) < deadline {
            if self.registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.registry.len();
        if remaining > 0 {
            warn!(remaining, "drain deadline elapsed with tunnels still open");
        } else {
            info!("drain complete, no tunnels remain open");
        }
    }

    /// The registry backing this broker, for tests and diagnostics.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The store backing this broker, for tests and diagnostics.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}
