use clap::Parser;
use std::time::Duration;

use crate::config::PeerConfig;
use crate::error::PeerError;

#[derive(Parser, Debug)]
#[command(name = "parlor-peer")]
#[command(about = "Terminal chat client for parlor rooms")]
pub struct Cli {
    /// Name shown to other peers
    #[arg(short, long, env = "PARLOR_USERNAME")]
    pub username: String,

    /// Relay websocket endpoint
    #[arg(long, env = "PARLOR_SIGNAL_URL", default_value = "ws://127.0.0.1:8080/ws")]
    pub signal_url: String,

    /// STUN server URL; repeat for several. Replaces the default server.
    #[arg(long)]
    pub stun: Vec<String>,

    /// Give up on a handshake that has not opened a channel by then
    #[arg(long, env = "PARLOR_HANDSHAKE_TIMEOUT_SECS")]
    pub handshake_timeout_secs: Option<u64>,
}

impl Cli {
    pub fn into_config(self) -> Result<PeerConfig, PeerError> {
        let mut config = PeerConfig::new(self.username, &self.signal_url)?;
        if !self.stun.is_empty() {
            config = config.with_ice_servers(self.stun);
        }
        if let Some(secs) = self.handshake_timeout_secs {
            if secs == 0 {
                return Err(PeerError::Config("handshake timeout must be positive".into()));
            }
            config = config.with_handshake_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn stun_flags_replace_defaults() {
        let cli = Cli::parse_from([
            "parlor-peer",
            "--username",
            "alice",
            "--stun",
            "stun:a.example:3478",
            "--stun",
            "stun:b.example:3478",
            "--handshake-timeout-secs",
            "12",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].urls, vec!["stun:b.example:3478"]);
        assert_eq!(config.handshake_timeout, Duration::from_secs(12));
        assert_eq!(config.signaling_url.as_str(), "ws://127.0.0.1:8080/ws");
    }

    #[test_timeout::timeout]
    fn zero_timeout_is_rejected() {
        let cli = Cli::parse_from([
            "parlor-peer",
            "--username",
            "alice",
            "--handshake-timeout-secs",
            "0",
        ]);
        assert!(matches!(cli.into_config(), Err(PeerError::Config(_))));
    }
}
