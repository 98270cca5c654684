//! Signaling relay: registers peers, hands out ids, and routes
//! negotiation envelopes between them. Chat traffic never passes through here.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod state;
pub mod websocket;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::RelayConfig;
pub use state::RelayState;

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(listener: TcpListener, state: RelayState) -> anyhow::Result<()> {
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
