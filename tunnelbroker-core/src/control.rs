//! Handling for one accepted control-port connection (spec §4.4): either
//! a data-channel announcement (`DATA:<conn_id>`) or an agent
//! authenticating with its token secret.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{info, warn};

use tunnelbroker_shared::protocol::{format_error, parse_data_line, FramingError};
use tunnelbroker_shared::{read_line, write_line};
use tunnelbroker_store::{Store, StoreError};

use crate::pairing::{DeliverOutcome, PairingTable};
use crate::registry::Registry;
use crate::tunnel::{AgentHandle, Tunnel};

/// Failure handling one control connection. These are all logged and the
/// socket is dropped; they never bring the broker down.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// A line could not be read or written.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// Binding the tunnel's public listener failed.
    #[error("failed to bind public port {0}: {1}")]
    Bind(u16, std::io::Error),
    /// The registry already holds a Tunnel for this token/port and it is
    /// not the one this connection just tried to open.
    #[error("registry conflict for this token and port")]
    RegistryConflict,
}

/// Handle one freshly accepted connection on the control port.
#[allow(clippy::too_many_arguments)]
pub async fn handle_control_connection(
    mut socket: TcpStream,
    addr: SocketAddr,
    registry: Arc<Registry>,
    pairing: Arc<PairingTable>,
    store: Arc<Store>,
    public_bind_addr: IpAddr,
    shutdown: broadcast::Sender<()>,
) -> Result<(), ControlError> {
    let first_line = read_line(&mut socket).await?;

    if let Some(conn_id) = parse_data_line(&first_line) {
        match pairing.deliver(conn_id, socket) {
            DeliverOutcome::Delivered => {
                info!(%addr, conn_id, "delivered data connection");
            }
            DeliverOutcome::NoSuchSlot => {
                warn!(%addr, conn_id, "data connection arrived for an unknown or expired pairing slot");
            }
        }
        return Ok(());
    }

    let secret = first_line;
    let (token, port_assignment) = match store.authenticate(&secret).await {
        Ok(pair) => pair,
        Err(err @ (StoreError::NotFound | StoreError::Expired)) => {
            warn!(%addr, %err, "rejected control connection: invalid or expired token");
            let _ = write_line(&mut socket, &format_error("invalid or expired token")).await;
            return Ok(());
        }
        Err(err) => {
            let _ = write_line(&mut socket, &format_error("internal error")).await;
            return Err(err.into());
        }
    };

    let reported_local_port: u16 = match read_line(&mut socket).await?.parse() {
        Ok(port) => port,
        Err(_) => {
            write_line(&mut socket, &format_error("invalid local port")).await?;
            return Ok(());
        }
    };

    let public_port = port_assignment.port_u16();

    if let Some(tunnel) = registry.find_by_token_and_port(token.id, public_port) {
        attach_to_existing(socket, tunnel, reported_local_port, &store).await
    } else {
        open_fresh_tunnel(
            socket,
            addr,
            registry,
            pairing,
            store,
            token,
            port_assignment,
            reported_local_port,
            public_bind_addr,
            shutdown,
        )
        .await
    }
}

async fn attach_to_existing(
    socket: TcpStream,
    tunnel: Arc<Tunnel>,
    reported_local_port: u16,
    store: &Arc<Store>,
) -> Result<(), ControlError> {
    let (mut read_half, write_half) = socket.into_split();
    let handle = Arc::new(AgentHandle::new(write_half, reported_local_port));

    handle.send_success(tunnel.id(), tunnel.public_port()).await?;

    if tunnel.is_attached().await {
        tunnel.replace_agent_handle(Arc::clone(&handle)).await;
    } else {
        tunnel.attach_agent_handle(Arc::clone(&handle)).await;
    }

    if let Err(err) = store.touch_session(tunnel.session_id()).await {
        warn!(tunnel_id = %tunnel.id(), %err, "failed to refresh session on agent attach");
    }

    info!(tunnel_id = %tunnel.id(), port = tunnel.public_port(), "agent attached");
    drive_agent_read_loop(&mut read_half, &tunnel, &handle).await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn open_fresh_tunnel(
    mut socket: TcpStream,
    addr: SocketAddr,
    registry: Arc<Registry>,
    pairing: Arc<PairingTable>,
    store: Arc<Store>,
    token: tunnelbroker_store::Token,
    port_assignment: tunnelbroker_store::PortAssignment,
    reported_local_port: u16,
    public_bind_addr: IpAddr,
    shutdown: broadcast::Sender<()>,
) -> Result<(), ControlError> {
    let public_port = port_assignment.port_u16();

    let listener = match tokio::net::TcpListener::bind((public_bind_addr, public_port)).await {
        Ok(listener) => listener,
        Err(err) => {
            let _ = write_line(&mut socket, &format_error("public port unavailable")).await;
            return Err(ControlError::Bind(public_port, err));
        }
    };

    let session = store
        .start_session(&token, &port_assignment, addr.ip(), public_port, "tcp")
        .await?;

    let (mut read_half, write_half) = socket.into_split();
    let handle = Arc::new(AgentHandle::new(write_half, reported_local_port));

    let tunnel = Tunnel::open_fresh(
        token.id,
        public_port,
        session.id,
        listener,
        Arc::clone(&handle),
        &registry,
        pairing,
        store,
    );

    handle.send_success(tunnel.id(), tunnel.public_port()).await?;

    registry
        .insert(Arc::clone(&tunnel))
        .map_err(|_| ControlError::RegistryConflict)?;

    let shutdown_rx = shutdown.subscribe();
    let accept_tunnel = Arc::clone(&tunnel);
    tokio::spawn(async move {
        accept_tunnel.run_accept_loop(shutdown_rx).await;
    });

    info!(tunnel_id = %tunnel.id(), port = public_port, "tunnel opened");
    drive_agent_read_loop(&mut read_half, &tunnel, &handle).await;
    Ok(())
}

async fn drive_agent_read_loop(
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
    tunnel: &Arc<Tunnel>,
    handle: &Arc<AgentHandle>,
) {
    loop {
        tokio::select! {
            _ = handle.wait_for_close_request() => break,
            line = read_line(read_half) => {
                if line.is_err() {
                    break;
                }
            }
        }
    }
    tunnel.mark_detached_on_read_eof(handle).await;
}
