//! Short-lived mapping from connection-id to a single-shot rendezvous
//! slot, used to hand a freshly accepted agent data connection to the
//! external-side handler waiting for it (spec §4.3).
//!
//! The table never holds a lock across I/O: [`PairingTable::deliver`]
//! removes the entry (a single `DashMap` critical section) and then
//! sends the socket outside any lock.

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

/// Outcome of attempting to deliver a data socket to a pending slot.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliverOutcome {
    /// The socket was handed to the waiting receiver.
    Delivered,
    /// No slot was reserved under this id (already cancelled, timed out,
    /// or never reserved). The caller's socket is dropped (closed).
    NoSuchSlot,
}

/// Failure reserving a slot.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    /// A slot already exists under this connection id. Ids are generated
    /// to be locally unique, so this indicates a bug upstream.
    #[error("a pairing slot is already reserved for this connection id")]
    AlreadyReserved,
}

/// Table of in-flight rendezvous slots, keyed by connection id.
#[derive(Default)]
pub struct PairingTable {
    slots: DashMap<String, oneshot::Sender<TcpStream>>,
}

impl PairingTable {
    /// Build an empty pairing table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh slot for `conn_id`, returning the receiving half
    /// of the rendezvous.
    pub fn reserve(&self, conn_id: String) -> Result<oneshot::Receiver<TcpStream>, PairingError> {
        let (tx, rx) = oneshot::channel();
        match self.slots.entry(conn_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(PairingError::AlreadyReserved),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Hand `socket` to the slot's waiting receiver, if any. If the slot
    /// has already been cancelled or timed out, `socket` is simply
    /// dropped by the caller on return (closing it).
    pub fn deliver(&self, conn_id: &str, socket: TcpStream) -> DeliverOutcome {
        match self.slots.remove(conn_id) {
            Some((_, tx)) => match tx.send(socket) {
                Ok(()) => DeliverOutcome::Delivered,
                Err(_socket_returned) => DeliverOutcome::NoSuchSlot,
            },
            None => DeliverOutcome::NoSuchSlot,
        }
    }

    /// Remove a slot without delivering. Any `deliver` racing against
    /// this will observe `NoSuchSlot` and drop its socket.
    pub fn cancel(&self, conn_id: &str) {
        self.slots.remove(conn_id);
    }

    /// Number of slots currently reserved. Used by tests and by
    /// [`crate::tunnel::Tunnel::close`] to assert no leaks remain.
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}
