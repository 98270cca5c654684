use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, watch};

use parlor_proto::PeerId;

use crate::negotiation::{Role, SessionCommand};
use crate::session::NegotiationStage;

/// Diagnostic view of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub peer_id: PeerId,
    pub username: String,
    pub stage: NegotiationStage,
}

/// Dispatcher-side handle to a running session task. Dropping it cancels the
/// task, which then closes its connection and reports back.
pub(crate) struct SessionHandle {
    pub(crate) generation: u64,
    pub(crate) username: String,
    pub(crate) role: Role,
    pub(crate) polite: bool,
    inbox: mpsc::UnboundedSender<SessionCommand>,
    stage: watch::Receiver<NegotiationStage>,
    _cancel: oneshot::Sender<()>,
}

impl SessionHandle {
    pub(crate) fn new(
        generation: u64,
        username: String,
        role: Role,
        polite: bool,
        inbox: mpsc::UnboundedSender<SessionCommand>,
        stage: watch::Receiver<NegotiationStage>,
        cancel: oneshot::Sender<()>,
    ) -> Self {
        Self {
            generation,
            username,
            role,
            polite,
            inbox,
            stage,
            _cancel: cancel,
        }
    }

    pub(crate) fn stage(&self) -> NegotiationStage {
        *self.stage.borrow()
    }

    pub(crate) fn deliver(&self, command: SessionCommand) -> bool {
        self.inbox.send(command).is_ok()
    }

    /// A polite initiator gives way to the remote's offer until its own offer
    /// has been answered.
    pub(crate) fn yields_to_offer(&self) -> bool {
        self.role == Role::Initiator
            && self.polite
            && self.stage() < NegotiationStage::AnswerExchanged
    }
}

/// Remote peer → session. Owned by the client dispatcher task only.
#[derive(Default)]
pub(crate) struct SessionCatalog {
    sessions: HashMap<PeerId, SessionHandle>,
    next_generation: u64,
}

impl SessionCatalog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub(crate) fn insert(&mut self, peer: PeerId, handle: SessionHandle) {
        self.sessions.insert(peer, handle);
    }

    pub(crate) fn get(&self, peer: PeerId) -> Option<&SessionHandle> {
        self.sessions.get(&peer)
    }

    pub(crate) fn get_mut(&mut self, peer: PeerId) -> Option<&mut SessionHandle> {
        self.sessions.get_mut(&peer)
    }

    pub(crate) fn contains(&self, peer: PeerId) -> bool {
        self.sessions.contains_key(&peer)
    }

    pub(crate) fn remove(&mut self, peer: PeerId) -> Option<SessionHandle> {
        self.sessions.remove(&peer)
    }

    /// Remove the entry only if it still belongs to `generation`. A session
    /// that was already replaced must not take its successor with it.
    pub(crate) fn remove_generation(&mut self, peer: PeerId, generation: u64) -> bool {
        match self.sessions.get(&peer) {
            Some(handle) if handle.generation == generation => {
                self.sessions.remove(&peer);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<(PeerId, SessionHandle)> {
        self.sessions.drain().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|(peer, handle)| SessionSummary {
                peer_id: *peer,
                username: handle.username.clone(),
                stage: handle.stage(),
            })
            .collect();
        summaries.sort_by_key(|s| s.peer_id);
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(
        catalog: &mut SessionCatalog,
        username: &str,
        polite: bool,
    ) -> (SessionHandle, watch::Sender<NegotiationStage>) {
        let (inbox, _) = mpsc::unbounded_channel();
        let (stage_tx, stage_rx) = watch::channel(NegotiationStage::Idle);
        let (cancel, _) = oneshot::channel();
        let generation = catalog.next_generation();
        let handle = SessionHandle::new(
            generation,
            username.to_string(),
            Role::Initiator,
            polite,
            inbox,
            stage_rx,
            cancel,
        );
        (handle, stage_tx)
    }

    #[test_timeout::timeout]
    fn replaced_session_cannot_remove_successor() {
        let mut catalog = SessionCatalog::new();
        let (first, _s1) = handle(&mut catalog, "alice", true);
        let first_generation = first.generation;
        catalog.insert(PeerId::new(1), first);
        let (second, _s2) = handle(&mut catalog, "alice", true);
        catalog.insert(PeerId::new(1), second);

        assert!(!catalog.remove_generation(PeerId::new(1), first_generation));
        assert!(catalog.contains(PeerId::new(1)));
        assert!(catalog.remove_generation(PeerId::new(1), first_generation + 1));
        assert_eq!(catalog.len(), 0);
    }

    #[test_timeout::timeout]
    fn polite_initiator_yields_until_answered() {
        let mut catalog = SessionCatalog::new();
        let (polite, stage) = handle(&mut catalog, "alice", true);
        let (impolite, _other) = handle(&mut catalog, "carol", false);

        assert!(polite.yields_to_offer());
        stage.send_replace(NegotiationStage::OfferSent);
        assert!(polite.yields_to_offer());
        stage.send_replace(NegotiationStage::AnswerExchanged);
        assert!(!polite.yields_to_offer());
        assert!(!impolite.yields_to_offer());
    }

    #[test_timeout::timeout]
    fn snapshot_is_ordered_by_peer() {
        let mut catalog = SessionCatalog::new();
        let (carol, _s3) = handle(&mut catalog, "carol", false);
        let (alice, _s1) = handle(&mut catalog, "alice", true);
        catalog.insert(PeerId::new(3), carol);
        catalog.insert(PeerId::new(1), alice);

        let names: Vec<_> = catalog.snapshot().into_iter().map(|s| s.username).collect();
        assert_eq!(names, vec!["alice", "carol"]);
    }
}
