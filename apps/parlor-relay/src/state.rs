use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use parlor_proto::{Envelope, PeerId};

use crate::registry::PeerRegistry;
use crate::router;

/// Owning service for the peer registry. All mutation goes through one lock
/// that is never held across an await, so each transition of the registry
/// and the notifications it causes are observed as one step.
#[derive(Clone, Default)]
pub struct RelayState {
    registry: Arc<Mutex<PeerRegistry>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer, hand it the current roster and announce it to everyone else.
    pub fn admit(&self, username: &str, outbox: mpsc::UnboundedSender<Envelope>) -> PeerId {
        let mut registry = self.registry.lock();
        let id = registry.register(outbox, username);
        let others = registry.list_others(id);
        info!(peer_id = %id, username, present = others.len(), "peer registered");
        if let Some(peer) = registry.get(id) {
            peer.deliver(Envelope::existing_peers(others));
        }
        let notified = router::broadcast_join(&registry, id);
        debug!(peer_id = %id, notified, "join broadcast");
        id
    }

    pub fn route(&self, sender: PeerId, envelope: Envelope) -> usize {
        let registry = self.registry.lock();
        let Some(username) = registry.get(sender).map(|peer| peer.username.clone()) else {
            return 0;
        };
        let kind = envelope.kind();
        let target = envelope.target();
        let delivered = router::forward_or_broadcast(&registry, envelope, sender, &username);
        debug!(peer_id = %sender, kind, target = ?target, delivered, "routed envelope");
        delivered
    }

    /// Remove a peer and tell the rest. Safe to call more than once.
    pub fn depart(&self, id: PeerId) -> bool {
        let mut registry = self.registry.lock();
        let Some(peer) = registry.remove(id) else {
            return false;
        };
        let notified = router::broadcast_departure(&registry, id, &peer.username);
        info!(peer_id = %id, username = %peer.username, notified, "peer departed");
        true
    }

    pub fn peer_count(&self) -> usize {
        self.registry.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_proto::{PeerSummary, SessionDescription};

    #[test_timeout::timeout]
    fn admit_sends_roster_before_anything_else() {
        let state = RelayState::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();

        let alice = state.admit("alice", a_tx);
        assert_eq!(a_rx.try_recv().unwrap(), Envelope::existing_peers(vec![]));

        let bob = state.admit("bob", b_tx);
        assert_eq!(
            b_rx.try_recv().unwrap(),
            Envelope::existing_peers(vec![PeerSummary {
                client_id: alice,
                username: "alice".into()
            }])
        );
        assert_eq!(a_rx.try_recv().unwrap(), Envelope::new_peer(bob, "bob"));
        assert!(b_rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn depart_twice_notifies_once() {
        let state = RelayState::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        state.admit("alice", a_tx);
        let bob = state.admit("bob", b_tx);
        while a_rx.try_recv().is_ok() {}

        assert!(state.depart(bob));
        assert!(!state.depart(bob));
        assert_eq!(a_rx.try_recv().unwrap(), Envelope::peer_disconnected(bob, "bob"));
        assert!(a_rx.try_recv().is_err());
        assert_eq!(state.peer_count(), 1);
    }

    #[test_timeout::timeout]
    fn routing_from_departed_sender_is_dropped() {
        let state = RelayState::new();
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        let alice = state.admit("alice", a_tx);
        let bob = state.admit("bob", b_tx);
        state.depart(alice);
        let offer = Envelope::offer(bob, SessionDescription::offer("v=0"));
        assert_eq!(state.route(alice, offer), 0);
    }
}
