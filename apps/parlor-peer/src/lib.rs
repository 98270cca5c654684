//! Chat room client: discovers peers through the relay, negotiates a direct
//! data channel with each of them, and fans chat lines out over those
//! channels.

pub mod catalog;
pub mod channels;
pub mod chat;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
mod negotiation;
pub mod session;
mod signaling;
pub mod transport;

pub use catalog::SessionSummary;
pub use chat::{ChatEvent, ChatLine};
pub use client::{connect, ClientHandle};
pub use config::PeerConfig;
pub use error::PeerError;
pub use session::NegotiationStage;
