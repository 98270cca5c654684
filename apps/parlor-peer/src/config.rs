use std::time::Duration;

use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::PeerError;

pub const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_LABEL: &str = "parlor-chat";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for one chat client.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Name announced to the relay in `register`
    pub username: String,
    /// Relay websocket endpoint, e.g. `ws://127.0.0.1:8080/ws`
    pub signaling_url: Url,
    pub ice_servers: Vec<RTCIceServer>,
    pub data_channel_label: String,
    pub ordered: bool,
    /// Sessions that have not opened their channel by then are torn down
    pub handshake_timeout: Duration,
}

impl PeerConfig {
    /// Build a config with the default STUN server, unless
    /// `PARLOR_LOCALHOST_ONLY` is set.
    pub fn new(username: impl Into<String>, signaling_url: &str) -> Result<Self, PeerError> {
        let username = username.into();
        if username.trim().is_empty() {
            return Err(PeerError::Config("username must not be empty".into()));
        }
        let signaling_url = Url::parse(signaling_url)
            .map_err(|e| PeerError::Config(format!("signaling url {signaling_url}: {e}")))?;
        if !matches!(signaling_url.scheme(), "ws" | "wss") {
            return Err(PeerError::Config(format!(
                "signaling url must be ws:// or wss://, got {}",
                signaling_url.scheme()
            )));
        }

        let ice_servers = if std::env::var("PARLOR_LOCALHOST_ONLY").is_ok() {
            vec![]
        } else {
            vec![stun_server(DEFAULT_STUN)]
        };

        Ok(Self {
            username,
            signaling_url,
            ice_servers,
            data_channel_label: DEFAULT_LABEL.to_string(),
            ordered: true,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    /// Replace the ICE server list. An empty list means host candidates only.
    pub fn with_ice_servers<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ice_servers = urls.into_iter().map(stun_server).collect();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

fn stun_server(url: impl Into<String>) -> RTCIceServer {
    RTCIceServer {
        urls: vec![url.into()],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn rejects_non_websocket_url() {
        let err = PeerConfig::new("alice", "http://127.0.0.1:8080/ws").unwrap_err();
        assert!(matches!(err, PeerError::Config(_)));
        assert!(PeerConfig::new("", "ws://127.0.0.1:8080/ws").is_err());
    }

    #[test_timeout::timeout]
    fn overrides_apply() {
        let config = PeerConfig::new("alice", "ws://127.0.0.1:8080/ws")
            .unwrap()
            .with_ice_servers(Vec::<String>::new())
            .with_handshake_timeout(Duration::from_secs(5));
        assert!(config.ice_servers.is_empty());
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.data_channel_label, "parlor-chat");
        assert!(config.ordered);
    }
}
