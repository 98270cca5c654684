use thiserror::Error;

use parlor_proto::ProtocolError;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<webrtc::Error> for PeerError {
    fn from(err: webrtc::Error) -> Self {
        PeerError::Negotiation(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PeerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        PeerError::Signaling(err.to_string())
    }
}
