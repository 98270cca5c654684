use std::collections::BTreeMap;
use tokio::sync::mpsc;

use parlor_proto::{Envelope, PeerId, PeerSummary};

/// Relay-side record of one registered peer. `outbox` feeds the writer task
/// that owns the peer's websocket sink.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: PeerId,
    pub username: String,
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl PeerHandle {
    /// The transport is open for as long as its writer task holds the receiver.
    pub fn is_open(&self) -> bool {
        !self.outbox.is_closed()
    }

    pub fn deliver(&self, envelope: Envelope) -> bool {
        self.outbox.send(envelope).is_ok()
    }
}

/// Registered peers keyed by id. Ids start at 1 and are never handed out twice.
#[derive(Debug)]
pub struct PeerRegistry {
    next_id: u64,
    peers: BTreeMap<PeerId, PeerHandle>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            peers: BTreeMap::new(),
        }
    }

    pub fn register(
        &mut self,
        outbox: mpsc::UnboundedSender<Envelope>,
        username: impl Into<String>,
    ) -> PeerId {
        let id = PeerId::new(self.next_id);
        self.next_id += 1;
        self.peers.insert(
            id,
            PeerHandle {
                id,
                username: username.into(),
                outbox,
            },
        );
        id
    }

    /// Snapshot of everyone except `excluding`, in registration order.
    pub fn list_others(&self, excluding: PeerId) -> Vec<PeerSummary> {
        self.others(excluding)
            .map(|peer| PeerSummary {
                client_id: peer.id,
                username: peer.username.clone(),
            })
            .collect()
    }

    /// Removing an id that is already gone is a no-op.
    pub fn remove(&mut self, id: PeerId) -> Option<PeerHandle> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerHandle> {
        self.peers.get(&id)
    }

    pub fn others(&self, excluding: PeerId) -> impl Iterator<Item = &PeerHandle> {
        self.peers.values().filter(move |peer| peer.id != excluding)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> (
        mpsc::UnboundedSender<Envelope>,
        mpsc::UnboundedReceiver<Envelope>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test_timeout::timeout]
    fn size_tracks_registrations_minus_removals() {
        let mut registry = PeerRegistry::new();
        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for name in ["alice", "bob", "carol", "dave", "erin"] {
            let (tx, rx) = outbox();
            receivers.push(rx);
            ids.push(registry.register(tx, name));
        }
        registry.remove(ids[1]);
        registry.remove(ids[3]);
        assert_eq!(registry.len(), 3);
    }

    #[test_timeout::timeout]
    fn ids_increase_across_churn() {
        let mut registry = PeerRegistry::new();
        let mut last = None;
        for round in 0..50 {
            let (tx, _rx) = outbox();
            let id = registry.register(tx, format!("peer-{round}"));
            if let Some(previous) = last {
                assert!(id > previous, "{id} should follow {previous}");
            }
            if round % 2 == 0 {
                registry.remove(id);
            }
            last = Some(id);
        }
        assert_eq!(registry.len(), 25);
    }

    #[test_timeout::timeout]
    fn first_id_is_one() {
        let mut registry = PeerRegistry::new();
        let (tx, _rx) = outbox();
        assert_eq!(registry.register(tx, "alice"), PeerId::new(1));
    }

    #[test_timeout::timeout]
    fn remove_is_idempotent() {
        let mut registry = PeerRegistry::new();
        let (tx, _rx) = outbox();
        let id = registry.register(tx, "alice");
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn list_others_excludes_caller() {
        let mut registry = PeerRegistry::new();
        let (a_tx, _a_rx) = outbox();
        let (b_tx, _b_rx) = outbox();
        let alice = registry.register(a_tx, "alice");
        let bob = registry.register(b_tx, "bob");

        let seen_by_bob = registry.list_others(bob);
        assert_eq!(
            seen_by_bob,
            vec![PeerSummary {
                client_id: alice,
                username: "alice".into()
            }]
        );
        assert!(registry.list_others(alice).iter().all(|p| p.client_id != alice));
    }

    #[test_timeout::timeout]
    fn dropped_receiver_means_closed_transport() {
        let mut registry = PeerRegistry::new();
        let (tx, rx) = outbox();
        let id = registry.register(tx, "alice");
        assert!(registry.get(id).is_some_and(PeerHandle::is_open));
        drop(rx);
        assert!(!registry.get(id).is_some_and(PeerHandle::is_open));
    }
}
