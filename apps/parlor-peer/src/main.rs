use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use parlor_peer::cli::Cli;
use parlor_peer::transport::WebRtcConnector;
use parlor_peer::{connect, ChatEvent, ClientHandle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let config = Cli::parse().into_config()?;
    let connector = Arc::new(WebRtcConnector::new(&config));
    let url = config.signaling_url.clone();
    let (client, mut events) = connect(config, connector)
        .await
        .with_context(|| format!("failed to join via {url}"))?;
    println!("joined as {} (/peers lists sessions, /quit leaves)", client.username());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/peers" => print_sessions(&client).await,
                    text => {
                        if client.send_chat(text).await? == 0 {
                            println!("* nobody is connected yet");
                        }
                    }
                }
            }
            Some(event) = events.recv() => print_event(event),
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn print_sessions(client: &ClientHandle) {
    let sessions = client.sessions().await;
    if sessions.is_empty() {
        println!("* no sessions");
    }
    for session in sessions {
        println!("* {} ({}) {}", session.username, session.peer_id, session.stage);
    }
}

fn print_event(event: ChatEvent) {
    match event {
        ChatEvent::PeerJoined { username, .. } => println!("* {username} is here"),
        ChatEvent::PeerLeft { username, .. } => println!("* {username} left"),
        ChatEvent::ChannelOpened { username, .. } => println!("* connected to {username}"),
        ChatEvent::ChannelClosed { username, .. } => println!("* lost connection to {username}"),
        ChatEvent::Message { line, .. } => {
            println!("[{}] {}: {}", line.sent_at.format("%H:%M:%S"), line.from, line.text)
        }
    }
}
