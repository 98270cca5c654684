//! Wire protocol shared by the parlor relay and its peers.
//! Kept in its own crate so both sides agree on one envelope definition
//! without the relay pulling in the WebRTC stack.

mod envelope;
mod error;

pub use envelope::{CandidateInit, Envelope, PeerId, PeerSummary, SdpType, SessionDescription};
pub use error::ProtocolError;
