//! Startup restoration (spec §4.6): sweep stale sessions, then rebind a
//! listener for every public port that still has an active session and
//! register it as a Tunnel in the Detached state, ready for its agent to
//! reconnect.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use tunnelbroker_store::Store;

use crate::pairing::PairingTable;
use crate::registry::Registry;
use crate::tunnel::Tunnel;

/// Tally of what happened during restoration, logged once at the end and
/// useful for tests asserting on startup behavior.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Sessions marked inactive for being stale before restoration ran.
    pub swept: u64,
    /// Ports successfully rebound and registered as Detached tunnels.
    pub restored: usize,
    /// Ports whose listener failed to rebind; their sessions are marked
    /// inactive rather than left dangling.
    pub failed: usize,
}

/// Sweep stale sessions, then restore every public port still holding an
/// active session. Spawns each restored Tunnel's accept loop.
pub async fn restore_tunnels(
    store: Arc<Store>,
    registry: Arc<Registry>,
    pairing: Arc<PairingTable>,
    stale_threshold: Duration,
    bind_addr: IpAddr,
    shutdown: broadcast::Sender<()>,
) -> Result<RestoreSummary, tunnelbroker_store::StoreError> {
    let swept = store.sweep_stale(stale_threshold).await?;
    if swept > 0 {
        info!(swept, "swept stale sessions before restoration");
    }

    let grouped = store.restore_active().await?;
    let mut restored = 0usize;
    let mut failed = 0usize;

    for (port, mut sessions) in grouped {
        // The first session per port (ordered by `started_at` in the
        // query) is authoritative; a port is owned by exactly one token.
        let session = sessions.remove(0);
        for orphan in sessions {
            warn!(port, session_id = %orphan.id, "extra active session for an already-restored port, marking inactive");
            if let Err(err) = store.mark_session_restore_failed(orphan.id).await {
                warn!(port, session_id = %orphan.id, %err, "failed to mark orphaned session inactive");
            }
        }

        match TcpListener::bind((bind_addr, port)).await {
            Ok(listener) => {
                let tunnel = Tunnel::restore(
                    session.token_id,
                    port,
                    session.id,
                    listener,
                    &registry,
                    Arc::clone(&pairing),
                    Arc::clone(&store),
                );
                if registry.insert(Arc::clone(&tunnel)).is_err() {
                    warn!(port, "registry already holds a tunnel for this port, skipping restore");
                    continue;
                }
                let accept_tunnel = Arc::clone(&tunnel);
                let shutdown_rx = shutdown.subscribe();
                tokio::spawn(async move {
                    accept_tunnel.run_accept_loop(shutdown_rx).await;
                });
                restored += 1;
            }
            Err(err) => {
                warn!(port, %err, "failed to rebind public port during restoration");
                if let Err(err) = store.mark_session_restore_failed(session.id).await {
                    warn!(port, %err, "failed to mark session inactive after failed restore");
                }
                failed += 1;
            }
        }
    }

    let summary = RestoreSummary { swept, restored, failed };
    info!(?summary, "restoration complete");
    Ok(summary)
}
