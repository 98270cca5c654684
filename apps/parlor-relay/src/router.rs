//! Fan-out rules of the relay. Every function here runs with the registry
//! lock held by the caller, so a delivery pass never interleaves with a
//! registration or removal.

use tracing::debug;

use parlor_proto::{Envelope, PeerId};

use crate::registry::PeerRegistry;

/// Tell every other open peer that `newcomer` has registered.
pub fn broadcast_join(registry: &PeerRegistry, newcomer: PeerId) -> usize {
    let Some(peer) = registry.get(newcomer) else {
        return 0;
    };
    let envelope = Envelope::new_peer(peer.id, peer.username.clone());
    broadcast_except(registry, newcomer, &envelope)
}

/// Stamp the sender onto a peer-originated envelope, then deliver it to its
/// target or, when it names none, to everyone else.
pub fn forward_or_broadcast(
    registry: &PeerRegistry,
    mut envelope: Envelope,
    sender: PeerId,
    sender_username: &str,
) -> usize {
    envelope.stamp(sender, sender_username);
    match envelope.target() {
        Some(target) => send_to_peer(registry, target, envelope),
        None => broadcast_except(registry, sender, &envelope),
    }
}

/// Tell the remaining open peers that `departed` is gone.
pub fn broadcast_departure(registry: &PeerRegistry, departed: PeerId, username: &str) -> usize {
    let envelope = Envelope::peer_disconnected(departed, username);
    broadcast_except(registry, departed, &envelope)
}

fn broadcast_except(registry: &PeerRegistry, sender: PeerId, envelope: &Envelope) -> usize {
    registry
        .others(sender)
        .filter(|peer| peer.is_open())
        .filter(|peer| peer.deliver(envelope.clone()))
        .count()
}

/// A target that is missing or already closed is a stale reference, not an error.
fn send_to_peer(registry: &PeerRegistry, target: PeerId, envelope: Envelope) -> usize {
    match registry.get(target) {
        Some(peer) if peer.is_open() => usize::from(peer.deliver(envelope)),
        Some(_) => {
            debug!(peer_id = %target, kind = envelope.kind(), "dropping envelope for closed peer");
            0
        }
        None => {
            debug!(peer_id = %target, kind = envelope.kind(), "dropping envelope for unknown peer");
            0
        }
    }
}
