//! In-process stand-in for a real-time transport.
//!
//! Descriptions are `mock:<endpoint>` strings. Applying an answer links the two
//! endpoints and opens a channel on both; text sent on one side arrives as a
//! `TransportEvent::Message` on the other.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use parlor_proto::{CandidateInit, PeerId, SessionDescription};

use super::{ChatChannel, RtcConnection, RtcConnector, TransportEvent};
use crate::error::PeerError;

type EndpointId = u64;

struct Endpoint {
    events: mpsc::UnboundedSender<TransportEvent>,
    local_set: bool,
    remote: Option<EndpointId>,
    linked: Option<EndpointId>,
    open: Arc<AtomicBool>,
    closed: bool,
}

#[derive(Default)]
struct NetworkState {
    next_id: EndpointId,
    endpoints: HashMap<EndpointId, Endpoint>,
}

/// Shared medium that every `MockConnector` of a test attaches to.
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            network: self.clone(),
            failing: Arc::new(Mutex::new(HashSet::new())),
            rejected: Arc::new(Mutex::new(HashSet::new())),
            applied: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn create_endpoint(&self, events: mpsc::UnboundedSender<TransportEvent>) -> EndpointId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.endpoints.insert(
            id,
            Endpoint {
                events,
                local_set: false,
                remote: None,
                linked: None,
                open: Arc::new(AtomicBool::new(false)),
                closed: false,
            },
        );
        id
    }

    fn set_local(&self, id: EndpointId) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        let endpoint = live(&mut state, id)?;
        endpoint.local_set = true;
        let _ = endpoint
            .events
            .send(TransportEvent::LocalCandidate(host_candidate(id)));
        Ok(())
    }

    fn set_remote(&self, id: EndpointId, remote: EndpointId) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if !state.endpoints.contains_key(&remote) {
            return Err(PeerError::Negotiation(format!(
                "unknown remote endpoint mock:{remote}"
            )));
        }
        live(&mut state, id)?.remote = Some(remote);
        Ok(())
    }

    /// Answerer side applied `answer`: both ends are now wired up.
    fn link(&self, offerer: EndpointId, answerer: EndpointId) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        let answerer_remote = live(&mut state, answerer)?.remote;
        if answerer_remote != Some(offerer) {
            return Err(PeerError::Negotiation(format!(
                "mock:{answerer} did not answer mock:{offerer}"
            )));
        }
        live(&mut state, offerer)?.remote = Some(answerer);

        for (local, remote) in [(offerer, answerer), (answerer, offerer)] {
            let endpoint = live(&mut state, local)?;
            endpoint.linked = Some(remote);
            endpoint.open.store(true, Ordering::SeqCst);
            let channel = MockChannel {
                network: self.clone(),
                remote,
                open: endpoint.open.clone(),
            };
            let _ = endpoint
                .events
                .send(TransportEvent::ChannelOpen(Arc::new(channel)));
        }
        Ok(())
    }

    fn has_remote(&self, id: EndpointId) -> bool {
        self.state
            .lock()
            .endpoints
            .get(&id)
            .is_some_and(|e| e.remote.is_some())
    }

    fn deliver(&self, to: EndpointId, text: &str) -> Result<(), PeerError> {
        let state = self.state.lock();
        let endpoint = state
            .endpoints
            .get(&to)
            .filter(|e| !e.closed)
            .ok_or(PeerError::ChannelClosed)?;
        endpoint
            .events
            .send(TransportEvent::Message(text.to_string()))
            .map_err(|_| PeerError::ChannelClosed)
    }

    fn close(&self, id: EndpointId) {
        let mut state = self.state.lock();
        let linked = match state.endpoints.get_mut(&id) {
            Some(endpoint) if !endpoint.closed => {
                endpoint.closed = true;
                endpoint.open.store(false, Ordering::SeqCst);
                endpoint.linked.take()
            }
            _ => None,
        };
        if let Some(remote) = linked.and_then(|r| state.endpoints.get_mut(&r)) {
            remote.linked = None;
            if remote.open.swap(false, Ordering::SeqCst) {
                let _ = remote.events.send(TransportEvent::ChannelClosed);
            }
        }
    }
}

fn live(state: &mut NetworkState, id: EndpointId) -> Result<&mut Endpoint, PeerError> {
    state
        .endpoints
        .get_mut(&id)
        .filter(|e| !e.closed)
        .ok_or_else(|| PeerError::Negotiation(format!("mock:{id} is closed")))
}

fn host_candidate(id: EndpointId) -> CandidateInit {
    CandidateInit {
        candidate: format!("candidate:{id} 1 udp 2122260223 127.0.0.1 {} typ host", 40000 + id),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

fn endpoint_of(desc: &SessionDescription) -> Result<EndpointId, PeerError> {
    desc.sdp
        .strip_prefix("mock:")
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| PeerError::Negotiation(format!("not a mock description: {}", desc.sdp)))
}

/// Per-client connector. Failures are scripted per remote peer.
#[derive(Clone)]
pub struct MockConnector {
    network: MockNetwork,
    failing: Arc<Mutex<HashSet<PeerId>>>,
    rejected: Arc<Mutex<HashSet<String>>>,
    applied: Arc<Mutex<HashMap<PeerId, Vec<CandidateInit>>>>,
}

impl MockConnector {
    /// Every remote description later applied on a connection to `peer` fails.
    pub fn fail_remote_description(&self, peer: PeerId) {
        self.failing.lock().insert(peer);
    }

    /// Applying a remote candidate with exactly this text fails.
    pub fn reject_candidate(&self, candidate: impl Into<String>) {
        self.rejected.lock().insert(candidate.into());
    }

    /// Remote candidates applied so far on connections to `peer`, in order.
    pub fn applied_candidates(&self, peer: PeerId) -> Vec<CandidateInit> {
        self.applied.lock().get(&peer).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl RtcConnector for MockConnector {
    async fn connect(
        &self,
        peer: PeerId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn RtcConnection>, PeerError> {
        let id = self.network.create_endpoint(events);
        Ok(Arc::new(MockConnection {
            connector: self.clone(),
            peer,
            id,
        }))
    }
}

struct MockConnection {
    connector: MockConnector,
    peer: PeerId,
    id: EndpointId,
}

impl MockConnection {
    fn network(&self) -> &MockNetwork {
        &self.connector.network
    }

    fn check_scripted_failure(&self) -> Result<(), PeerError> {
        if self.connector.failing.lock().contains(&self.peer) {
            return Err(PeerError::Negotiation(format!(
                "scripted remote description failure for peer {}",
                self.peer
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RtcConnection for MockConnection {
    async fn open_channel(&self, _label: &str, _ordered: bool) -> Result<(), PeerError> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.network().set_local(self.id)?;
        Ok(SessionDescription::offer(format!("mock:{}", self.id)))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<(), PeerError> {
        self.check_scripted_failure()?;
        let remote = endpoint_of(&offer)?;
        self.network().set_remote(self.id, remote)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if !self.network().has_remote(self.id) {
            return Err(PeerError::Negotiation("answer before offer".into()));
        }
        self.network().set_local(self.id)?;
        Ok(SessionDescription::answer(format!("mock:{}", self.id)))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), PeerError> {
        self.check_scripted_failure()?;
        let remote = endpoint_of(&answer)?;
        self.network().link(self.id, remote)
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        if !self.network().has_remote(self.id) {
            return Err(PeerError::Negotiation(
                "candidate applied before remote description".into(),
            ));
        }
        if self.connector.rejected.lock().contains(&candidate.candidate) {
            return Err(PeerError::Negotiation(format!(
                "scripted candidate rejection: {}",
                candidate.candidate
            )));
        }
        self.connector
            .applied
            .lock()
            .entry(self.peer)
            .or_default()
            .push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.network().close(self.id);
    }
}

struct MockChannel {
    network: MockNetwork,
    remote: EndpointId,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl ChatChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<(), PeerError> {
        if !self.is_open() {
            return Err(PeerError::ChannelClosed);
        }
        self.network.deliver(self.remote, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_open(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Arc<dyn ChatChannel> {
        loop {
            match rx.recv().await {
                Some(TransportEvent::ChannelOpen(channel)) => return channel,
                Some(_) => continue,
                None => panic!("transport events ended"),
            }
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn answer_links_both_ends() {
        let network = MockNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network.connector().connect(PeerId::new(2), a_tx).await.unwrap();
        let b = network.connector().connect(PeerId::new(1), b_tx).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        assert!(matches!(a_rx.recv().await, Some(TransportEvent::LocalCandidate(_))));
        b.accept_offer(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.accept_answer(answer).await.unwrap();

        let a_channel = next_open(&mut a_rx).await;
        let b_channel = next_open(&mut b_rx).await;
        a_channel.send_text("hello").await.unwrap();
        match b_rx.recv().await {
            Some(TransportEvent::Message(text)) => assert_eq!(text, "hello"),
            other => panic!("expected message, got {other:?}"),
        }

        a.close().await;
        assert!(!a_channel.is_open());
        assert!(!b_channel.is_open());
        assert!(matches!(b_rx.recv().await, Some(TransportEvent::ChannelClosed)));
        assert!(matches!(
            b_channel.send_text("late").await,
            Err(PeerError::ChannelClosed)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidate_before_remote_description_fails() {
        let network = MockNetwork::new();
        let connector = network.connector();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = connector.connect(PeerId::new(3), tx).await.unwrap();
        let err = conn.add_remote_candidate(host_candidate(9)).await.unwrap_err();
        assert!(matches!(err, PeerError::Negotiation(_)));
        assert!(connector.applied_candidates(PeerId::new(3)).is_empty());
    }
}
