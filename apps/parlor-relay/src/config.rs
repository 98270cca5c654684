use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: IpAddr,
    pub port: u16,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: env::var("PARLOR_RELAY_BIND")
                .ok()
                .and_then(|b| b.parse().ok())
                .unwrap_or(defaults.bind),
            port: env::var("PARLOR_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
        }
    }
}
