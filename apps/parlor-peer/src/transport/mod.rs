//! Seam between negotiation and the real-time transport library.
//!
//! The negotiation engine only ever sees these traits. `webrtc` backs them in
//! the binary and `mock` backs them in tests.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use parlor_proto::{CandidateInit, PeerId, SessionDescription};

use crate::error::PeerError;

pub mod mock;
pub mod webrtc;

pub use self::mock::{MockConnector, MockNetwork};
pub use self::webrtc::WebRtcConnector;

/// Things the transport tells a session about, asynchronously.
pub enum TransportEvent {
    /// A local ICE candidate to trickle to the remote peer.
    LocalCandidate(CandidateInit),
    /// The data channel (local or remote-created) reached `open`.
    ChannelOpen(Arc<dyn ChatChannel>),
    ChannelClosed,
    Message(String),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            TransportEvent::ChannelOpen(_) => f.write_str("ChannelOpen"),
            TransportEvent::ChannelClosed => f.write_str("ChannelClosed"),
            TransportEvent::Message(m) => f.debug_tuple("Message").field(&m.len()).finish(),
        }
    }
}

/// Creates one connection per remote peer.
#[async_trait]
pub trait RtcConnector: Send + Sync {
    async fn connect(
        &self,
        peer: PeerId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn RtcConnection>, PeerError>;
}

/// One peer connection. `create_*` also install the description locally.
#[async_trait]
pub trait RtcConnection: Send + Sync {
    async fn open_channel(&self, label: &str, ordered: bool) -> Result<(), PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn accept_offer(&self, offer: SessionDescription) -> Result<(), PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), PeerError>;

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError>;

    async fn close(&self);
}

#[async_trait]
pub trait ChatChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn send_text(&self, text: &str) -> Result<(), PeerError>;
}
