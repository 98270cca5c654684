use clap::Parser;
use std::net::IpAddr;

use crate::config::RelayConfig;

#[derive(Parser, Debug)]
#[command(name = "parlor-relay")]
#[command(about = "Signaling relay for parlor chat rooms")]
pub struct Cli {
    /// Port to listen on (overrides PARLOR_RELAY_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind (overrides PARLOR_RELAY_BIND)
    #[arg(short, long)]
    pub bind: Option<IpAddr>,
}

impl Cli {
    pub fn apply(&self, mut config: RelayConfig) -> RelayConfig {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        config
    }
}
