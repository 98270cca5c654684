//! One task per remote peer drives offer/answer/ICE through the transport.
//!
//! The task owns its `SessionState`. The dispatcher talks to it through a
//! `SessionHandle`: commands go in, the stage is published on a watch, and a
//! `SessionExit` comes back once the task has torn everything down.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

use parlor_proto::{CandidateInit, Envelope, PeerId, SessionDescription};

use crate::catalog::SessionHandle;
use crate::channels::ChannelLifecycle;
use crate::chat::{ChatEvent, ChatLine};
use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::session::{Advance, NegotiationStage, SessionState};
use crate::transport::{ChatChannel, RtcConnection, RtcConnector, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Opens the data channel and sends the offer right away.
    Initiator,
    /// Waits in `Idle` for the remote's offer.
    Responder,
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Offer {
        offer: SessionDescription,
        username: Option<String>,
    },
    Answer(SessionDescription),
    Candidate(CandidateInit),
}

impl SessionCommand {
    /// Negotiation payload of a relayed envelope, if it carries one.
    pub(crate) fn from_envelope(envelope: Envelope) -> Option<Self> {
        match envelope {
            Envelope::Offer {
                offer, username, ..
            } => Some(SessionCommand::Offer { offer, username }),
            Envelope::Answer { answer, .. } => Some(SessionCommand::Answer(answer)),
            Envelope::IceCandidate { candidate, .. } => Some(SessionCommand::Candidate(candidate)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// The dispatcher dropped the handle.
    Cancelled,
    TimedOut,
    ChannelClosed,
}

#[derive(Debug)]
pub(crate) struct SessionExit {
    pub(crate) peer: PeerId,
    pub(crate) generation: u64,
    pub(crate) end: SessionEnd,
}

/// Everything a session shares with its client.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) config: Arc<PeerConfig>,
    pub(crate) connector: Arc<dyn RtcConnector>,
    pub(crate) relay: mpsc::UnboundedSender<Envelope>,
    pub(crate) channels: ChannelLifecycle,
    pub(crate) events: mpsc::UnboundedSender<ChatEvent>,
    pub(crate) exits: mpsc::UnboundedSender<SessionExit>,
}

pub(crate) fn spawn_session(
    ctx: SessionContext,
    peer: PeerId,
    username: String,
    role: Role,
    polite: bool,
    generation: u64,
) -> SessionHandle {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (stage_tx, stage_rx) = watch::channel(NegotiationStage::Idle);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();

    let session = Session {
        ctx,
        role,
        generation,
        state: SessionState::new(peer, username.clone()),
        stage_tx,
        transport_tx,
        transport_rx,
        early_channel: None,
    };
    let span = info_span!("session", peer_id = %peer, generation, ?role);
    tokio::spawn(session.run(inbox_rx, cancel_rx).instrument(span));

    SessionHandle::new(generation, username, role, polite, inbox_tx, stage_rx, cancel_tx)
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Closed,
}

struct Session {
    ctx: SessionContext,
    role: Role,
    generation: u64,
    state: SessionState,
    stage_tx: watch::Sender<NegotiationStage>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    /// Channel that reported open before the answer was applied.
    early_channel: Option<Arc<dyn ChatChannel>>,
}

impl Session {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<SessionCommand>,
        cancel: oneshot::Receiver<()>,
    ) {
        let handshake = handshake_deadline(
            self.ctx.config.handshake_timeout,
            self.stage_tx.subscribe(),
        );
        let end = tokio::select! {
            _ = cancel => SessionEnd::Cancelled,
            _ = handshake => SessionEnd::TimedOut,
            end = self.drive(&mut inbox) => end,
        };
        self.teardown(end).await;
    }

    async fn drive(&mut self, inbox: &mut mpsc::UnboundedReceiver<SessionCommand>) -> SessionEnd {
        if self.role == Role::Initiator {
            if let Err(e) = self.initiate().await {
                self.fail("sending offer", e);
            }
        }

        loop {
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => return SessionEnd::Cancelled,
                },
                Some(event) = self.transport_rx.recv() => {
                    if self.on_transport(event) == Flow::Closed {
                        return SessionEnd::ChannelClosed;
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, command: SessionCommand) {
        if self.state.is_stalled() && !matches!(command, SessionCommand::Candidate(_)) {
            debug!(stage = ?self.state.stage(), "session stalled, ignoring {:?}", command);
            return;
        }

        match command {
            SessionCommand::Offer { offer, username } => {
                if let Some(username) = username {
                    self.state.username = username;
                }
                if self.role == Role::Initiator || self.state.stage() != NegotiationStage::Idle {
                    warn!(stage = ?self.state.stage(), "ignoring offer, session is already negotiating");
                    return;
                }
                if let Err(e) = self.respond(offer).await {
                    self.fail("answering offer", e);
                }
            }
            SessionCommand::Answer(answer) => {
                if self.state.stage() != NegotiationStage::OfferSent {
                    warn!(stage = ?self.state.stage(), "ignoring answer outside offer-sent");
                    return;
                }
                if let Err(e) = self.accept_answer(answer).await {
                    self.fail("applying answer", e);
                }
            }
            SessionCommand::Candidate(candidate) => match self.state.admit_candidate(candidate) {
                Some(candidate) => match self.connection().await {
                    Ok(conn) => apply_candidate(&conn, candidate).await,
                    Err(e) => error!(error = %e, "no connection for remote candidate"),
                },
                None => debug!(
                    pending = self.state.pending_candidates(),
                    "queued remote candidate until the remote description is applied"
                ),
            },
        }
    }

    async fn initiate(&mut self) -> Result<(), PeerError> {
        let conn = self.connection().await?;
        conn.open_channel(&self.ctx.config.data_channel_label, self.ctx.config.ordered)
            .await?;
        let offer = conn.create_offer().await?;
        self.move_to(NegotiationStage::OfferSent);
        self.send_to_relay(Envelope::offer(self.state.peer_id, offer));
        Ok(())
    }

    async fn respond(&mut self, offer: SessionDescription) -> Result<(), PeerError> {
        let conn = self.connection().await?;
        self.move_to(NegotiationStage::OfferReceived);
        conn.accept_offer(offer).await?;
        self.flush_candidates(&conn).await;
        let answer = conn.create_answer().await?;
        self.move_to(NegotiationStage::AnswerExchanged);
        self.send_to_relay(Envelope::answer(self.state.peer_id, answer));
        self.open_early_channel();
        Ok(())
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), PeerError> {
        let conn = self.connection().await?;
        conn.accept_answer(answer).await?;
        self.flush_candidates(&conn).await;
        self.move_to(NegotiationStage::AnswerExchanged);
        self.open_early_channel();
        Ok(())
    }

    async fn flush_candidates(&mut self, conn: &Arc<dyn RtcConnection>) {
        let queued = self.state.mark_remote_applied();
        if !queued.is_empty() {
            debug!(count = queued.len(), "replaying queued remote candidates");
        }
        for candidate in queued {
            apply_candidate(conn, candidate).await;
        }
    }

    async fn connection(&mut self) -> Result<Arc<dyn RtcConnection>, PeerError> {
        if let Some(conn) = &self.state.connection {
            return Ok(conn.clone());
        }
        let conn = self
            .ctx
            .connector
            .connect(self.state.peer_id, self.transport_tx.clone())
            .await?;
        self.state.connection = Some(conn.clone());
        Ok(conn)
    }

    fn on_transport(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.send_to_relay(Envelope::ice_candidate(self.state.peer_id, candidate));
            }
            TransportEvent::ChannelOpen(channel) => match self.state.stage() {
                NegotiationStage::AnswerExchanged => self.open_channel(channel),
                stage if stage < NegotiationStage::AnswerExchanged => {
                    self.early_channel = Some(channel);
                }
                stage => debug!(?stage, "duplicate channel open ignored"),
            },
            TransportEvent::ChannelClosed => return Flow::Closed,
            TransportEvent::Message(text) => {
                let line = ChatLine::decode(&text, &self.state.username);
                self.emit(ChatEvent::Message {
                    peer_id: self.state.peer_id,
                    line,
                });
            }
        }
        Flow::Continue
    }

    fn open_early_channel(&mut self) {
        if let Some(channel) = self.early_channel.take() {
            self.open_channel(channel);
        }
    }

    fn open_channel(&mut self, channel: Arc<dyn ChatChannel>) {
        self.move_to(NegotiationStage::ChannelOpen);
        self.ctx
            .channels
            .attach(self.state.peer_id, self.generation, channel.clone());
        self.state.channel = Some(channel);
        info!(username = %self.state.username, "data channel open");
        self.emit(ChatEvent::ChannelOpened {
            peer_id: self.state.peer_id,
            username: self.state.username.clone(),
        });
    }

    async fn teardown(mut self, end: SessionEnd) {
        let peer = self.state.peer_id;
        match end {
            SessionEnd::TimedOut => warn!(
                stage = ?self.state.stage(),
                timeout = ?self.ctx.config.handshake_timeout,
                "handshake timed out, closing session"
            ),
            SessionEnd::ChannelClosed => info!(username = %self.state.username, "data channel closed"),
            SessionEnd::Cancelled => debug!(stage = ?self.state.stage(), "session cancelled"),
        }

        let was_open = self.state.stage() == NegotiationStage::ChannelOpen;
        self.ctx.channels.release(peer, self.generation);
        self.state.channel = None;
        self.early_channel = None;
        if let Some(conn) = self.state.connection.take() {
            conn.close().await;
        }
        self.move_to(NegotiationStage::Closed);

        if was_open {
            self.emit(ChatEvent::ChannelClosed {
                peer_id: peer,
                username: self.state.username.clone(),
            });
        }
        let _ = self.ctx.exits.send(SessionExit {
            peer,
            generation: self.generation,
            end,
        });
    }

    fn move_to(&mut self, next: NegotiationStage) {
        let from = self.state.stage();
        match self.state.advance(next) {
            Advance::Moved => {
                debug!(?from, to = ?next, "stage advanced");
                self.stage_tx.send_replace(next);
            }
            Advance::AlreadyClosed => {}
            Advance::Rejected => warn!(?from, to = ?next, "illegal stage change ignored"),
        }
    }

    fn fail(&mut self, step: &str, err: PeerError) {
        error!(stage = ?self.state.stage(), error = %err, "{step} failed, session stalled");
        self.state.stall();
    }

    fn send_to_relay(&self, envelope: Envelope) {
        if self.ctx.relay.send(envelope).is_err() {
            debug!("relay link is gone, dropping outbound envelope");
        }
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.ctx.events.send(event);
    }
}

/// A rejected candidate costs one path, not the session.
async fn apply_candidate(conn: &Arc<dyn RtcConnection>, candidate: CandidateInit) {
    let raw = candidate.candidate.clone();
    if let Err(e) = conn.add_remote_candidate(candidate).await {
        error!(candidate = %raw, error = %e, "applying remote candidate failed");
    }
}

/// Resolves once `limit` has passed while the session is still handshaking.
async fn handshake_deadline(limit: Duration, stage: watch::Receiver<NegotiationStage>) {
    tokio::time::sleep(limit).await;
    if stage.borrow().is_handshaking() {
        return;
    }
    std::future::pending::<()>().await
}
