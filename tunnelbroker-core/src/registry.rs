//! Process-wide mapping from tunnel id to [`Tunnel`](crate::tunnel::Tunnel),
//! with a secondary index by `(token, public port)` enforcing at most one
//! active Tunnel per pair (spec §4.2).

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::tunnel::Tunnel;

/// Failure inserting into the [`Registry`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A Tunnel already owns this `(token, port)` pair.
    #[error("a tunnel already exists for this token and port")]
    AlreadyExists,
}

/// Explicitly constructed, not an ambient singleton (spec §9
/// "Global-mutable state") — one instance per broker, threaded through
/// constructors, so tests never cross-contaminate.
#[derive(Default)]
pub struct Registry {
    by_id: DashMap<Uuid, Arc<Tunnel>>,
    by_token_port: DashMap<(Uuid, u16), Uuid>,
}

impl Registry {
    /// Build an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a Tunnel, failing if one already exists for its
    /// `(token, port)` pair.
    pub fn insert(&self, tunnel: Arc<Tunnel>) -> Result<(), RegistryError> {
        let key = (tunnel.token_id(), tunnel.public_port());
        match self.by_token_port.entry(key) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyExists),
            Entry::Vacant(entry) => {
                entry.insert(tunnel.id());
                self.by_id.insert(tunnel.id(), tunnel);
                Ok(())
            }
        }
    }

    /// Look up the Tunnel currently owning `(token, port)`, if any.
    pub fn find_by_token_and_port(&self, token_id: Uuid, port: u16) -> Option<Arc<Tunnel>> {
        let tunnel_id = *self.by_token_port.get(&(token_id, port))?;
        self.by_id.get(&tunnel_id).map(|entry| Arc::clone(&entry))
    }

    /// Remove a Tunnel by id, dropping it from both indices.
    pub fn remove(&self, tunnel_id: Uuid) -> Option<Arc<Tunnel>> {
        let (_, tunnel) = self.by_id.remove(&tunnel_id)?;
        self.by_token_port
            .remove(&(tunnel.token_id(), tunnel.public_port()));
        Some(tunnel)
    }

    /// Snapshot of every Tunnel currently registered, for shutdown fan-out
    /// and the restorer's startup summary.
    pub fn snapshot(&self) -> Vec<Arc<Tunnel>> {
        self.by_id.iter().map(|entry| Arc::clone(&entry)).collect()
    }

    /// Number of Tunnels currently registered.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the registry holds no Tunnels.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::tests::fresh_attached_tunnel_for_tests;

    #[tokio::test]
    async fn rejects_duplicate_token_port() {
        let registry = Registry::new();
        let token_id = Uuid::new_v4();
        let t1 = fresh_attached_tunnel_for_tests(token_id, 12345).await;
        let t2 = fresh_attached_tunnel_for_tests(token_id, 12345).await;

        registry.insert(t1).unwrap();
        let err = registry.insert(t2).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists));
    }

    #[tokio::test]
    async fn find_and_remove_round_trip() {
        let registry = Registry::new();
        let token_id = Uuid::new_v4();
        let tunnel = fresh_attached_tunnel_for_tests(token_id, 20001).await;
        let id = tunnel.id();
        registry.insert(tunnel).unwrap();

        assert!(registry.find_by_token_and_port(token_id, 20001).is_some());
        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.id(), id);
        assert!(registry.find_by_token_and_port(token_id, 20001).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn different_ports_for_same_token_coexist() {
        let registry = Registry::new();
        let token_id = Uuid::new_v4();
        let t1 = fresh_attached_tunnel_for_tests(token_id, 11111).await;
        let t2 = fresh_attached_tunnel_for_tests(token_id, 22222).await;
        registry.insert(t1).unwrap();
        registry.insert(t2).unwrap();
        assert_eq!(registry.len(), 2);
    }
}
