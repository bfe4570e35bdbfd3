//! The Tunnel state machine: owner of one public listener and, optionally,
//! one agent control socket, for a single `(token, port)` pair (spec §4.5).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashSet;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use tunnelbroker_shared::protocol::{format_conn_id, format_connect, format_error, format_success, FramingError};
use tunnelbroker_shared::{write_line, PAIRING_TIMEOUT};
use tunnelbroker_store::{Store, TerminalStatus};

use crate::registry::Registry;
use crate::pairing::PairingTable;

static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Build a connection id of the form `<tunnel_id>-<counter>`. The counter
/// is a process-wide monotonic `AtomicU64` rather than a literal
/// nanosecond timestamp: it gives the same uniqueness and ordering
/// guarantee without the narrow race of two accepts landing on the same
/// clock tick (see DESIGN.md).
fn next_conn_id(tunnel_id: Uuid) -> String {
    let n = CONN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{tunnel_id}-{n}")
}

/// The write half of an agent's control socket, plus the bookkeeping
/// needed to serialize writes and to tell the matching read loop to stop.
///
/// Writes are serialized behind `write_half`'s lock so that `CONNECT` and
/// `CONN_ID` always land on the wire contiguously (spec §5 "Ordering").
pub struct AgentHandle {
    write_half: Mutex<OwnedWriteHalf>,
    reported_local_port: u16,
    close_signal: Notify,
}

impl AgentHandle {
    /// Wrap a freshly split write half.
    pub fn new(write_half: OwnedWriteHalf, reported_local_port: u16) -> Self {
        AgentHandle {
            write_half: Mutex::new(write_half),
            reported_local_port,
            close_signal: Notify::new(),
        }
    }

    /// The local port the agent reported it forwards to (informational).
    pub fn reported_local_port(&self) -> u16 {
        self.reported_local_port
    }

    /// Write `SUCCESS:<tunnel_id>:<public_port>`. Must be called before
    /// this handle is installed as a Tunnel's active agent, so that no
    /// `CONNECT` can reach the wire ahead of it (spec §8 invariant 6).
    pub async fn send_success(&self, tunnel_id: Uuid, public_port: u16) -> Result<(), FramingError> {
        let mut w = self.write_half.lock().await;
        write_line(&mut *w, &format_success(tunnel_id, public_port)).await
    }

    /// Write `ERROR:<reason>`.
    pub async fn send_error(&self, reason: &str) -> Result<(), FramingError> {
        let mut w = self.write_half.lock().await;
        write_line(&mut *w, &format_error(reason)).await
    }

    /// Write `CONNECT` then `CONN_ID:<conn_id>` under a single lock hold,
    /// so the two lines are always contiguous on the wire.
    pub async fn send_connect(&self, conn_id: &str) -> Result<(), FramingError> {
        let mut w = self.write_half.lock().await;
        write_line(&mut *w, format_connect()).await?;
        write_line(&mut *w, &format_conn_id(conn_id)).await?;
        Ok(())
    }

    /// Ask the read loop owning this handle's matching read half to stop,
    /// because this handle is being replaced or the Tunnel is closing.
    pub fn request_close(&self) {
        self.close_signal.notify_waiters();
    }

    /// Resolves once [`AgentHandle::request_close`] has been called.
    pub async fn wait_for_close_request(&self) {
        self.close_signal.notified().await;
    }
}

#[derive(Clone)]
enum State {
    Attached(Arc<AgentHandle>),
    Detached,
    Closed,
}

impl State {
    fn handle(&self) -> Option<Arc<AgentHandle>> {
        match self {
            State::Attached(h) => Some(Arc::clone(h)),
            _ => None,
        }
    }
}

/// Owner of one public listener and, optionally, one agent control
/// socket, for a single `(token, port)` pair.
pub struct Tunnel {
    id: Uuid,
    token_id: Uuid,
    public_port: u16,
    session_id: Uuid,
    listener: TcpListener,
    state: RwLock<State>,
    registry: Weak<Registry>,
    pairing: Arc<PairingTable>,
    store: Arc<Store>,
    in_flight: DashSet<String>,
}

impl Tunnel {
    /// `open_fresh`: — → AttachedAgent. The agent handle must already
    /// have had `SUCCESS` written to it.
    pub fn open_fresh(
        token_id: Uuid,
        public_port: u16,
        session_id: Uuid,
        listener: TcpListener,
        agent_handle: Arc<AgentHandle>,
        registry: &Arc<Registry>,
        pairing: Arc<PairingTable>,
        store: Arc<Store>,
    ) -> Arc<Self> {
        Arc::new(Tunnel {
            id: Uuid::new_v4(),
            token_id,
            public_port,
            session_id,
            listener,
            state: RwLock::new(State::Attached(agent_handle)),
            registry: Arc::downgrade(registry),
            pairing,
            store,
            in_flight: DashSet::new(),
        })
    }

    /// `restore`: — → DetachedAgent.
    pub fn restore(
        token_id: Uuid,
        public_port: u16,
        session_id: Uuid,
        listener: TcpListener,
        registry: &Arc<Registry>,
        pairing: Arc<PairingTable>,
        store: Arc<Store>,
    ) -> Arc<Self> {
        Arc::new(Tunnel {
            id: Uuid::new_v4(),
            token_id,
            public_port,
            session_id,
            listener,
            state: RwLock::new(State::Detached),
            registry: Arc::downgrade(registry),
            pairing,
            store,
            in_flight: DashSet::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn token_id(&self) -> Uuid {
        self.token_id
    }

    pub fn public_port(&self) -> u16 {
        self.public_port
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Whether an agent is currently attached. Exposed for tests and for
    /// the restorer's summary log.
    pub async fn is_attached(&self) -> bool {
        matches!(*self.state.read().await, State::Attached(_))
    }

    /// `attach_agent`: DetachedAgent → AttachedAgent.
    pub async fn attach_agent_handle(&self, handle: Arc<AgentHandle>) {
        *self.state.write().await = State::Attached(handle);
    }

    /// `replace_agent`: AttachedAgent → AttachedAgent, closing the old
    /// socket. The old handle's read loop is signalled to stop; once it
    /// and this function both drop their reference, the old socket's fd
    /// is released.
    pub async fn replace_agent_handle(&self, handle: Arc<AgentHandle>) {
        let mut state = self.state.write().await;
        if let State::Attached(old) = &*state {
            old.request_close();
        }
        *state = State::Attached(handle);
    }

    /// `detach_agent`: AttachedAgent → DetachedAgent, but only if `failed`
    /// is still the currently-attached handle (guards against a stale
    /// write failure racing a concurrent `replace_agent`).
    async fn detach_if_current(&self, failed: &Arc<AgentHandle>) {
        let mut state = self.state.write().await;
        if let State::Attached(current) = &*state {
            if Arc::ptr_eq(current, failed) {
                *state = State::Detached;
            }
        }
    }

    /// Called by the control handler's read loop when the agent socket's
    /// read side returns EOF or an error (agent process exited).
    pub async fn mark_detached_on_read_eof(&self, handle: &Arc<AgentHandle>) {
        self.detach_if_current(handle).await;
    }

    /// `close`: any → Closed. Closes the listener (by dropping it) and
    /// the agent socket, cancels every pending pairing slot this Tunnel
    /// reserved, ends the session, and removes this Tunnel from the
    /// registry.
    pub async fn close(&self, reason: &str) {
        {
            let mut state = self.state.write().await;
            if matches!(*state, State::Closed) {
                return;
            }
            if let State::Attached(handle) = &*state {
                handle.request_close();
            }
            *state = State::Closed;
        }

        let pending: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        for conn_id in pending {
            self.pairing.cancel(&conn_id);
            self.in_flight.remove(&conn_id);
        }

        if let Err(err) = self.store.end_session(self.session_id).await {
            warn!(tunnel_id = %self.id, %err, "failed to mark session inactive on close");
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }

        info!(tunnel_id = %self.id, port = self.public_port, reason, "tunnel closed");
    }

    /// Accept external connections until `shutdown` fires, dispatching
    /// each to its own task.
    pub async fn run_accept_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    self.close("shutdown").await;
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            let this = Arc::clone(&self);
                            let span = info_span!("external", tunnel_id = %self.id, ?addr);
                            tokio::spawn(
                                async move { this.handle_external(socket, addr).await; }
                                    .instrument(span),
                            );
                        }
                        Err(err) => {
                            warn!(tunnel_id = %self.id, %err, "accept failed");
                        }
                    }
                }
            }
        }
    }

    async fn handle_external(self: Arc<Self>, socket: TcpStream, addr: SocketAddr) {
        if let Err(err) = self.store.touch_session(self.session_id).await {
            warn!(tunnel_id = %self.id, %err, "failed to refresh session on external traffic");
        }

        let record = match self
            .store
            .start_connection_record(self.session_id, addr.ip(), addr.port(), self.public_port)
            .await
        {
            Ok(r) => r,
            Err(err) => {
                warn!(tunnel_id = %self.id, %err, "failed to create connection record");
                return;
            }
        };

        let handle = self.state.read().await.handle();
        match handle {
            Some(handle) => self.bridge_via_agent(socket, handle, record.id).await,
            None => self.respond_detached(socket, record.id).await,
        }
    }

    async fn bridge_via_agent(&self, external: TcpStream, handle: Arc<AgentHandle>, record_id: Uuid) {
        let conn_id = next_conn_id(self.id);
        let rx = match self.pairing.reserve(conn_id.clone()) {
            Ok(rx) => rx,
            Err(err) => {
                warn!(tunnel_id = %self.id, %err, "failed to reserve pairing slot");
                self.finish_record_error(record_id, "failed to reserve pairing slot").await;
                return;
            }
        };
        self.in_flight.insert(conn_id.clone());

        if let Err(err) = handle.send_connect(&conn_id).await {
            self.in_flight.remove(&conn_id);
            self.pairing.cancel(&conn_id);
            self.detach_if_current(&handle).await;
            warn!(tunnel_id = %self.id, %err, "agent write failed mid-connect, detaching agent");
            self.finish_record_error(record_id, &format!("agent write failed: {err}")).await;
            return;
        }

        match tokio::time::timeout(PAIRING_TIMEOUT, rx).await {
            Ok(Ok(data_socket)) => {
                self.in_flight.remove(&conn_id);
                self.run_bridge(external, data_socket, record_id).await;
            }
            Ok(Err(_recv_error)) => {
                self.in_flight.remove(&conn_id);
                self.finish_record_error(record_id, "pairing slot closed without delivery").await;
            }
            Err(_elapsed) => {
                self.in_flight.remove(&conn_id);
                self.pairing.cancel(&conn_id);
                if let Err(err) = self
                    .store
                    .end_connection_record(record_id, TerminalStatus::Timeout, None)
                    .await
                {
                    warn!(tunnel_id = %self.id, %err, "failed to record pairing timeout");
                }
            }
        }
    }

    async fn respond_detached(&self, mut socket: TcpStream, record_id: Uuid) {
        let body = format!(
            "This tunnel's public port ({}) is restored but no agent is attached.\nReconnect the agent to resume forwarding.\n",
            self.public_port
        );
        let response = format!(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = socket.write_all(response.as_bytes()).await;
        let _ = socket.shutdown().await;

        if let Err(err) = self
            .store
            .end_connection_record(
                record_id,
                TerminalStatus::Closed,
                Some("public port restored; no agent attached"),
            )
            .await
        {
            warn!(tunnel_id = %self.id, %err, "failed to end connection record for detached response");
        }
    }

    async fn run_bridge(&self, mut external: TcpStream, mut data: TcpStream, record_id: Uuid) {
        let result = tokio::spawn(async move {
            tokio::io::copy_bidirectional(&mut external, &mut data).await
        })
        .await;

        match result {
            Ok(Ok((bytes_in, bytes_out))) => {
                if let Err(err) = self.store.update_bytes(record_id, bytes_in as i64, bytes_out as i64).await {
                    warn!(tunnel_id = %self.id, %err, "failed to update byte counters");
                }
                if let Err(err) = self
                    .store
                    .end_connection_record(record_id, TerminalStatus::Closed, None)
                    .await
                {
                    warn!(tunnel_id = %self.id, %err, "failed to end connection record");
                }
            }
            Ok(Err(io_err)) => {
                self.finish_record_error(record_id, &io_err.to_string()).await;
            }
            Err(join_err) => {
                // A panic in the bridge task must not take the Tunnel down.
                self.finish_record_error(record_id, &format!("bridge task failed: {join_err}")).await;
            }
        }
    }

    async fn finish_record_error(&self, record_id: Uuid, message: &str) {
        if let Err(err) = self
            .store
            .end_connection_record(record_id, TerminalStatus::Error, Some(message))
            .await
        {
            warn!(tunnel_id = %self.id, %err, "failed to end connection record");
        }
    }
}
