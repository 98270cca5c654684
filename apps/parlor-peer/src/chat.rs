use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parlor_proto::PeerId;

/// Payload written on a data channel. Never passes through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatLine {
    pub from: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatLine {
    pub fn new(from: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            text: text.into(),
            sent_at: Utc::now(),
        }
    }

    /// Peers that write bare text still get their message shown, attributed
    /// to the username the session knows them by.
    pub fn decode(raw: &str, fallback_from: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self::new(fallback_from, raw))
    }
}

/// What the client reports to whoever embeds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    PeerJoined { peer_id: PeerId, username: String },
    PeerLeft { peer_id: PeerId, username: String },
    ChannelOpened { peer_id: PeerId, username: String },
    ChannelClosed { peer_id: PeerId, username: String },
    Message { peer_id: PeerId, line: ChatLine },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn plain_text_is_attributed_to_session_peer() {
        let line = ChatLine::decode("hello there", "bob");
        assert_eq!(line.from, "bob");
        assert_eq!(line.text, "hello there");
    }

    #[test_timeout::timeout]
    fn structured_line_keeps_its_sender() {
        let raw = r#"{"from":"alice","text":"hi","sentAt":"2026-01-01T00:00:00Z"}"#;
        let line = ChatLine::decode(raw, "bob");
        assert_eq!(line.from, "alice");
        assert_eq!(line.text, "hi");
    }
}
