use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use parlor_proto::{Envelope, PeerId, ProtocolError};

use crate::catalog::{SessionCatalog, SessionSummary};
use crate::channels::ChannelLifecycle;
use crate::chat::{ChatEvent, ChatLine};
use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::negotiation::{spawn_session, Role, SessionCommand, SessionContext, SessionExit};
use crate::signaling::RelayLink;
use crate::transport::RtcConnector;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

enum ClientCommand {
    Sessions(oneshot::Sender<Vec<SessionSummary>>),
    Shutdown,
}

/// Register with the relay and start negotiating with whoever is there.
///
/// Returns the handle used to chat and the stream of `ChatEvent`s.
pub async fn connect(
    config: PeerConfig,
    connector: Arc<dyn RtcConnector>,
) -> Result<(ClientHandle, mpsc::UnboundedReceiver<ChatEvent>), PeerError> {
    let link = RelayLink::connect(&config.signaling_url, &config.username).await?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (exits_tx, exits_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let channels = ChannelLifecycle::new();
    let username = config.username.clone();

    let core = ClientCore {
        ctx: SessionContext {
            config: Arc::new(config),
            connector,
            relay: link.outbox(),
            channels: channels.clone(),
            events: events_tx,
            exits: exits_tx,
        },
        catalog: SessionCatalog::new(),
        exits: exits_rx,
    };
    let span = info_span!("client", username = %username);
    let task = tokio::spawn(core.run(link, commands_rx).instrument(span));

    Ok((
        ClientHandle {
            username,
            channels,
            commands: commands_tx,
            task,
        },
        events_rx,
    ))
}

/// Embedder-facing side of a running client.
pub struct ClientHandle {
    username: String,
    channels: ChannelLifecycle,
    commands: mpsc::UnboundedSender<ClientCommand>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Send a chat line to every peer whose channel is open. Returns how many
    /// peers it went to; zero is not an error.
    pub async fn send_chat(&self, text: &str) -> Result<usize, PeerError> {
        let line = ChatLine::new(self.username.as_str(), text);
        let payload = serde_json::to_string(&line).map_err(ProtocolError::from)?;
        Ok(self.channels.send_to_all(&payload).await)
    }

    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(ClientCommand::Sessions(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Close every session and the relay link.
    pub async fn shutdown(self) {
        let _ = self.commands.send(ClientCommand::Shutdown);
        if let Err(e) = self.task.await {
            warn!(error = %e, "client task ended abnormally");
        }
    }
}

/// Owns the session catalog. Every catalog mutation happens on this task.
struct ClientCore {
    ctx: SessionContext,
    catalog: SessionCatalog,
    exits: mpsc::UnboundedReceiver<SessionExit>,
}

impl ClientCore {
    async fn run(mut self, mut link: RelayLink, mut commands: mpsc::UnboundedReceiver<ClientCommand>) {
        let mut relay_open = true;
        loop {
            tokio::select! {
                envelope = link.recv(), if relay_open => match envelope {
                    Some(envelope) => self.on_envelope(envelope),
                    None => {
                        warn!("relay link closed, existing sessions keep running");
                        relay_open = false;
                    }
                },
                Some(exit) = self.exits.recv() => self.on_exit(exit),
                command = commands.recv() => match command {
                    Some(ClientCommand::Sessions(reply)) => {
                        let _ = reply.send(self.catalog.snapshot());
                    }
                    Some(ClientCommand::Shutdown) | None => break,
                },
            }
        }

        self.close_sessions().await;
        drop(self);
        link.close().await;
        info!("client stopped");
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        if envelope.is_client_originated() {
            self.on_negotiation(envelope);
            return;
        }

        match envelope {
            Envelope::ExistingPeers { peers } => {
                info!(count = peers.len(), "registered with relay");
                for peer in peers {
                    // They were here first: our offer yields on collision.
                    self.peer_joined(peer.client_id, peer.username, true);
                }
            }
            Envelope::NewPeer { peer_id, username } => self.peer_joined(peer_id, username, false),
            Envelope::PeerDisconnected { peer_id, username } => {
                info!(peer_id = %peer_id, username = %username, "peer left");
                if self.catalog.remove(peer_id).is_some() {
                    debug!(peer_id = %peer_id, "session removed");
                }
                self.emit(ChatEvent::PeerLeft { peer_id, username });
            }
            other => warn!(kind = other.kind(), "unexpected envelope from relay"),
        }
    }

    fn peer_joined(&mut self, peer_id: PeerId, username: String, polite: bool) {
        info!(peer_id = %peer_id, username = %username, "peer joined");
        self.emit(ChatEvent::PeerJoined {
            peer_id,
            username: username.clone(),
        });
        if self.catalog.contains(peer_id) {
            debug!(peer_id = %peer_id, "session already exists");
            return;
        }
        self.spawn(peer_id, username, Role::Initiator, polite);
    }

    fn on_negotiation(&mut self, envelope: Envelope) {
        let kind = envelope.kind();
        let Some(sender) = envelope.sender() else {
            debug!(kind, "negotiation envelope without sender, dropping");
            return;
        };
        let Some(command) = SessionCommand::from_envelope(envelope) else {
            return;
        };

        match &command {
            SessionCommand::Offer { username, .. } => {
                let name = username.clone().unwrap_or_default();
                match self.catalog.get(sender).map(|h| h.yields_to_offer()) {
                    Some(true) => {
                        info!(peer_id = %sender, "offer collision, yielding to remote offer");
                        self.catalog.remove(sender);
                        self.spawn(sender, name.clone(), Role::Responder, false);
                    }
                    Some(false) => {}
                    None => self.spawn(sender, name.clone(), Role::Responder, false),
                }
                if !name.is_empty() {
                    if let Some(handle) = self.catalog.get_mut(sender) {
                        handle.username = name;
                    }
                }
            }
            SessionCommand::Answer(_) if !self.catalog.contains(sender) => {
                debug!(peer_id = %sender, "answer from peer without a session, dropping");
                return;
            }
            SessionCommand::Candidate(_) if !self.catalog.contains(sender) => {
                debug!(peer_id = %sender, "candidate from unknown peer, opening idle session");
                self.spawn(sender, String::new(), Role::Responder, false);
            }
            _ => {}
        }

        if let Some(handle) = self.catalog.get(sender) {
            if !handle.deliver(command) {
                debug!(peer_id = %sender, kind, "session already finished");
            }
        }
    }

    fn on_exit(&mut self, exit: SessionExit) {
        if self.catalog.remove_generation(exit.peer, exit.generation) {
            debug!(peer_id = %exit.peer, end = ?exit.end, "session finished and removed");
        }
    }

    fn spawn(&mut self, peer: PeerId, username: String, role: Role, polite: bool) {
        let generation = self.catalog.next_generation();
        let handle = spawn_session(self.ctx.clone(), peer, username, role, polite, generation);
        self.catalog.insert(peer, handle);
    }

    /// Cancel every session and wait for each to finish closing.
    async fn close_sessions(&mut self) {
        info!(sessions = self.catalog.len(), "closing sessions");
        let mut pending: HashSet<(PeerId, u64)> = self
            .catalog
            .drain()
            .into_iter()
            .map(|(peer, handle)| (peer, handle.generation))
            .collect();

        let grace = tokio::time::sleep(SHUTDOWN_GRACE);
        tokio::pin!(grace);
        while !pending.is_empty() {
            tokio::select! {
                Some(exit) = self.exits.recv() => {
                    pending.remove(&(exit.peer, exit.generation));
                }
                _ = &mut grace => {
                    warn!(remaining = pending.len(), "sessions did not finish closing");
                    break;
                }
            }
        }
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.ctx.events.send(event);
    }
}
