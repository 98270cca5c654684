use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout, Instant};
use tracing_subscriber::EnvFilter;

use parlor_peer::transport::MockNetwork;
use parlor_peer::{connect, ChatEvent, ClientHandle, NegotiationStage, PeerConfig};
use parlor_proto::PeerId;
use parlor_relay::{serve, RelayState};

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn start_relay() -> (String, RelayState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = listener.local_addr().expect("local addr");
    let state = RelayState::new();
    let serve_state = state.clone();
    tokio::spawn(async move {
        let _ = serve(listener, serve_state).await;
    });
    (format!("ws://{addr}/ws"), state)
}

async fn wait_for_peer_count(state: &RelayState, expected: usize) {
    let deadline = Instant::now() + WAIT;
    while state.peer_count() != expected {
        assert!(
            Instant::now() < deadline,
            "relay peer count stuck at {}, expected {expected}",
            state.peer_count()
        );
        sleep(Duration::from_millis(10)).await;
    }
}

/// Join the room and wait until the relay has registered us, so ids follow
/// join order.
async fn join(
    url: &str,
    relay: &RelayState,
    network: &MockNetwork,
    username: &str,
) -> (ClientHandle, UnboundedReceiver<ChatEvent>) {
    let before = relay.peer_count();
    let config = PeerConfig::new(username, url)
        .expect("valid config")
        .with_ice_servers(Vec::<String>::new());
    let joined = connect(config, Arc::new(network.connector()))
        .await
        .expect("connect to relay");
    wait_for_peer_count(relay, before + 1).await;
    joined
}

async fn wait_for_event(
    events: &mut UnboundedReceiver<ChatEvent>,
    mut wanted: impl FnMut(&ChatEvent) -> bool,
) -> ChatEvent {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = timeout(remaining, events.recv())
            .await
            .expect("timed out waiting for chat event")
            .expect("client event stream ended");
        if wanted(&event) {
            return event;
        }
    }
}

async fn wait_for_channel(events: &mut UnboundedReceiver<ChatEvent>, peer: u64, username: &str) {
    wait_for_channels(events, &[(peer, username)]).await;
}

/// Wait until a channel to each listed peer opened, in any order.
async fn wait_for_channels(events: &mut UnboundedReceiver<ChatEvent>, peers: &[(u64, &str)]) {
    let mut missing: Vec<ChatEvent> = peers
        .iter()
        .map(|(peer, username)| ChatEvent::ChannelOpened {
            peer_id: PeerId::new(*peer),
            username: username.to_string(),
        })
        .collect();
    while !missing.is_empty() {
        let event = wait_for_event(events, |event| missing.contains(event)).await;
        missing.retain(|e| *e != event);
    }
}

async fn wait_for_message(events: &mut UnboundedReceiver<ChatEvent>) -> (PeerId, String, String) {
    match wait_for_event(events, |event| matches!(event, ChatEvent::Message { .. })).await {
        ChatEvent::Message { peer_id, line } => (peer_id, line.from, line.text),
        _ => unreachable!(),
    }
}

#[test_timeout::tokio_timeout_test]
async fn alice_and_bob_open_a_direct_channel_and_chat() {
    init_tracing();
    let (url, relay) = start_relay().await;
    let network = MockNetwork::new();

    let (alice, mut alice_events) = join(&url, &relay, &network, "alice").await;
    let (bob, mut bob_events) = join(&url, &relay, &network, "bob").await;

    wait_for_channel(&mut alice_events, 2, "bob").await;
    wait_for_channel(&mut bob_events, 1, "alice").await;

    let alice_sessions = alice.sessions().await;
    assert_eq!(alice_sessions.len(), 1);
    assert_eq!(alice_sessions[0].peer_id, PeerId::new(2));
    assert_eq!(alice_sessions[0].username, "bob");
    assert_eq!(alice_sessions[0].stage, NegotiationStage::ChannelOpen);

    let bob_sessions = bob.sessions().await;
    assert_eq!(bob_sessions.len(), 1);
    assert_eq!(bob_sessions[0].peer_id, PeerId::new(1));
    assert_eq!(bob_sessions[0].username, "alice");
    assert_eq!(bob_sessions[0].stage, NegotiationStage::ChannelOpen);

    assert_eq!(alice.send_chat("hi bob").await.unwrap(), 1);
    assert_eq!(
        wait_for_message(&mut bob_events).await,
        (PeerId::new(1), "alice".to_string(), "hi bob".to_string())
    );

    assert_eq!(bob.send_chat("hey alice").await.unwrap(), 1);
    assert_eq!(
        wait_for_message(&mut alice_events).await,
        (PeerId::new(2), "bob".to_string(), "hey alice".to_string())
    );

    alice.shutdown().await;
    bob.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn departure_closes_the_session_on_the_other_side() {
    init_tracing();
    let (url, relay) = start_relay().await;
    let network = MockNetwork::new();

    let (alice, mut alice_events) = join(&url, &relay, &network, "alice").await;
    let (bob, mut bob_events) = join(&url, &relay, &network, "bob").await;
    wait_for_channel(&mut alice_events, 2, "bob").await;
    wait_for_channel(&mut bob_events, 1, "alice").await;

    bob.shutdown().await;

    let left = ChatEvent::PeerLeft {
        peer_id: PeerId::new(2),
        username: "bob".into(),
    };
    let closed = ChatEvent::ChannelClosed {
        peer_id: PeerId::new(2),
        username: "bob".into(),
    };
    let mut seen_left = false;
    let mut seen_closed = false;
    while !(seen_left && seen_closed) {
        let event = wait_for_event(&mut alice_events, |e| *e == left || *e == closed).await;
        seen_left |= event == left;
        seen_closed |= event == closed;
    }

    wait_for_peer_count(&relay, 1).await;
    let deadline = Instant::now() + WAIT;
    while !alice.sessions().await.is_empty() {
        assert!(Instant::now() < deadline, "alice still has a session for bob");
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(alice.send_chat("anyone?").await.unwrap(), 0);

    alice.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn late_joiner_connects_to_everyone() {
    init_tracing();
    let (url, relay) = start_relay().await;
    let network = MockNetwork::new();

    let (alice, mut alice_events) = join(&url, &relay, &network, "alice").await;
    let (bob, mut bob_events) = join(&url, &relay, &network, "bob").await;
    wait_for_channel(&mut alice_events, 2, "bob").await;

    let (carol, mut carol_events) = join(&url, &relay, &network, "carol").await;
    wait_for_channels(&mut carol_events, &[(1, "alice"), (2, "bob")]).await;
    wait_for_channel(&mut alice_events, 3, "carol").await;
    wait_for_channel(&mut bob_events, 3, "carol").await;

    assert_eq!(carol.send_chat("hello both").await.unwrap(), 2);
    assert_eq!(wait_for_message(&mut alice_events).await.2, "hello both");
    assert_eq!(wait_for_message(&mut bob_events).await.2, "hello both");

    let stages: Vec<_> = carol.sessions().await.into_iter().map(|s| s.stage).collect();
    assert_eq!(stages, vec![NegotiationStage::ChannelOpen; 2]);

    carol.shutdown().await;
    bob.shutdown().await;
    alice.shutdown().await;
}
