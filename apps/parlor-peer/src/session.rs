use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parlor_proto::{CandidateInit, PeerId};

use crate::transport::{ChatChannel, RtcConnection};

/// Where a session is in its handshake. Moves only forward along
/// `Idle → OfferSent | OfferReceived → AnswerExchanged → ChannelOpen → Closed`,
/// and any stage may jump to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NegotiationStage {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    ChannelOpen,
    Closed,
}

impl NegotiationStage {
    pub fn can_advance_to(self, next: NegotiationStage) -> bool {
        use NegotiationStage::*;
        matches!(
            (self, next),
            (Idle, OfferSent)
                | (Idle, OfferReceived)
                | (OfferSent, AnswerExchanged)
                | (OfferReceived, AnswerExchanged)
                | (AnswerExchanged, ChannelOpen)
        ) || (next == Closed && self != Closed)
    }

    /// True before the data channel opened; the handshake deadline applies.
    pub fn is_handshaking(self) -> bool {
        self < NegotiationStage::ChannelOpen
    }
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationStage::Idle => "idle",
            NegotiationStage::OfferSent => "offer-sent",
            NegotiationStage::OfferReceived => "offer-received",
            NegotiationStage::AnswerExchanged => "answer-exchanged",
            NegotiationStage::ChannelOpen => "channel-open",
            NegotiationStage::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Outcome of a requested stage change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Moved,
    /// Already `Closed`; closing again is a no-op.
    AlreadyClosed,
    Rejected,
}

/// Client-local record of one remote peer.
pub struct SessionState {
    pub peer_id: PeerId,
    pub username: String,
    stage: NegotiationStage,
    pub(crate) connection: Option<Arc<dyn RtcConnection>>,
    pub(crate) channel: Option<Arc<dyn ChatChannel>>,
    pending_candidates: VecDeque<CandidateInit>,
    remote_applied: bool,
    stalled: bool,
}

impl SessionState {
    pub fn new(peer_id: PeerId, username: impl Into<String>) -> Self {
        Self {
            peer_id,
            username: username.into(),
            stage: NegotiationStage::Idle,
            connection: None,
            channel: None,
            pending_candidates: VecDeque::new(),
            remote_applied: false,
            stalled: false,
        }
    }

    pub fn stage(&self) -> NegotiationStage {
        self.stage
    }

    pub fn advance(&mut self, next: NegotiationStage) -> Advance {
        if next == NegotiationStage::Closed && self.stage == NegotiationStage::Closed {
            return Advance::AlreadyClosed;
        }
        if !self.stage.can_advance_to(next) {
            return Advance::Rejected;
        }
        self.stage = next;
        Advance::Moved
    }

    /// Returns the candidate back when it can be applied right away; otherwise
    /// it waits until a remote description is in place.
    pub fn admit_candidate(&mut self, candidate: CandidateInit) -> Option<CandidateInit> {
        if self.remote_applied {
            Some(candidate)
        } else {
            self.pending_candidates.push_back(candidate);
            None
        }
    }

    /// Record that a remote description is applied and hand back the queued
    /// candidates in arrival order.
    pub fn mark_remote_applied(&mut self) -> Vec<CandidateInit> {
        self.remote_applied = true;
        self.pending_candidates.drain(..).collect()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn stall(&mut self) {
        self.stalled = true;
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }
}
