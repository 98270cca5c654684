use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;

/// Relay-assigned identity of a connected peer. Issued in increasing order and
/// never reused for the lifetime of a relay process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u64);

impl PeerId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for PeerId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry of an `existing-peers` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub client_id: PeerId,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Same JSON shape as the browser's `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Same JSON shape as the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// One signaling frame. `senderId` and `username` on the negotiation variants
/// are written by the relay; whatever a peer puts there is overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    Register {
        username: String,
    },
    ExistingPeers {
        peers: Vec<PeerSummary>,
    },
    #[serde(rename_all = "camelCase")]
    NewPeer {
        peer_id: PeerId,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_peer_id: Option<PeerId>,
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_peer_id: Option<PeerId>,
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_peer_id: Option<PeerId>,
        candidate: CandidateInit,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<PeerId>,
    },
    #[serde(rename_all = "camelCase")]
    PeerDisconnected {
        peer_id: PeerId,
        username: String,
    },
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Validate the first frame of a relay connection and return the username.
    pub fn parse_registration(text: &str) -> Result<String, ProtocolError> {
        match Self::parse(text)? {
            Envelope::Register { username } => Ok(username),
            other => Err(ProtocolError::UnexpectedFirstFrame(other.kind())),
        }
    }

    /// Validate a frame from an already registered peer. Only negotiation
    /// envelopes may travel peer → relay after registration.
    pub fn parse_client_frame(text: &str) -> Result<Self, ProtocolError> {
        let envelope = Self::parse(text)?;
        if envelope.is_client_originated() {
            Ok(envelope)
        } else {
            Err(ProtocolError::NotClientOriginated(envelope.kind()))
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Register { .. } => "register",
            Envelope::ExistingPeers { .. } => "existing-peers",
            Envelope::NewPeer { .. } => "new-peer",
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::IceCandidate { .. } => "ice-candidate",
            Envelope::PeerDisconnected { .. } => "peer-disconnected",
        }
    }

    pub fn is_client_originated(&self) -> bool {
        matches!(
            self,
            Envelope::Offer { .. } | Envelope::Answer { .. } | Envelope::IceCandidate { .. }
        )
    }

    pub fn target(&self) -> Option<PeerId> {
        match self {
            Envelope::Offer { target_peer_id, .. }
            | Envelope::Answer { target_peer_id, .. }
            | Envelope::IceCandidate { target_peer_id, .. } => *target_peer_id,
            _ => None,
        }
    }

    pub fn sender(&self) -> Option<PeerId> {
        match self {
            Envelope::Offer { sender_id, .. }
            | Envelope::Answer { sender_id, .. }
            | Envelope::IceCandidate { sender_id, .. } => *sender_id,
            _ => None,
        }
    }

    /// Overwrite the sender fields with the relay's view of who sent the frame.
    /// `ice-candidate` carries no username on the wire.
    pub fn stamp(&mut self, sender: PeerId, sender_username: &str) {
        match self {
            Envelope::Offer {
                sender_id,
                username,
                ..
            }
            | Envelope::Answer {
                sender_id,
                username,
                ..
            } => {
                *sender_id = Some(sender);
                *username = Some(sender_username.to_string());
            }
            Envelope::IceCandidate { sender_id, .. } => {
                *sender_id = Some(sender);
            }
            _ => {}
        }
    }

    pub fn register(username: impl Into<String>) -> Self {
        Envelope::Register {
            username: username.into(),
        }
    }

    pub fn existing_peers(peers: Vec<PeerSummary>) -> Self {
        Envelope::ExistingPeers { peers }
    }

    pub fn new_peer(peer_id: PeerId, username: impl Into<String>) -> Self {
        Envelope::NewPeer {
            peer_id,
            username: username.into(),
        }
    }

    pub fn peer_disconnected(peer_id: PeerId, username: impl Into<String>) -> Self {
        Envelope::PeerDisconnected {
            peer_id,
            username: username.into(),
        }
    }

    pub fn offer(target: PeerId, offer: SessionDescription) -> Self {
        Envelope::Offer {
            target_peer_id: Some(target),
            offer,
            sender_id: None,
            username: None,
        }
    }

    pub fn answer(target: PeerId, answer: SessionDescription) -> Self {
        Envelope::Answer {
            target_peer_id: Some(target),
            answer,
            sender_id: None,
            username: None,
        }
    }

    pub fn ice_candidate(target: PeerId, candidate: CandidateInit) -> Self {
        Envelope::IceCandidate {
            target_peer_id: Some(target),
            candidate,
            sender_id: None,
        }
    }
}
