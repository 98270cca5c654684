use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use parlor_proto::{CandidateInit, PeerId, SessionDescription};

use super::{ChatChannel, RtcConnection, RtcConnector, TransportEvent};
use crate::config::PeerConfig;
use crate::error::PeerError;

/// Builds `webrtc` peer connections with the client's ICE servers.
pub struct WebRtcConnector {
    api: API,
    rtc_config: RTCConfiguration,
}

impl WebRtcConnector {
    pub fn new(config: &PeerConfig) -> Self {
        Self {
            api: APIBuilder::new().build(),
            rtc_config: RTCConfiguration {
                ice_servers: config.ice_servers.clone(),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl RtcConnector for WebRtcConnector {
    async fn connect(
        &self,
        peer: PeerId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn RtcConnection>, PeerError> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config.clone()).await?);

        let candidates = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidates = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidates.send(TransportEvent::LocalCandidate(from_rtc(init)));
                    }
                    Err(e) => warn!(peer_id = %peer, error = %e, "could not serialize local candidate"),
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(peer_id = %peer, ?state, "peer connection state changed");
            Box::pin(async {})
        }));

        let remote_channels = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = remote_channels.clone();
            Box::pin(async move {
                debug!(peer_id = %peer, label = dc.label(), "remote data channel announced");
                wire_channel(dc, events);
            })
        }));

        Ok(Arc::new(WebRtcConnection { pc, events }))
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn open_channel(&self, label: &str, ordered: bool) -> Result<(), PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        wire_channel(dc, self.events.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<(), PeerError> {
        let desc = RTCSessionDescription::offer(offer.sdp)?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), PeerError> {
        let desc = RTCSessionDescription::answer(answer.sdp)?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "peer connection close failed");
        }
    }
}

fn from_rtc(init: RTCIceCandidateInit) -> CandidateInit {
    CandidateInit {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

/// Forward open/close/message of `dc` as transport events.
fn wire_channel(dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<TransportEvent>) {
    let channel: Arc<dyn ChatChannel> = Arc::new(WebRtcChannel { inner: dc.clone() });

    let on_open = events.clone();
    dc.on_open(Box::new(move || {
        let _ = on_open.send(TransportEvent::ChannelOpen(channel.clone()));
        Box::pin(async {})
    }));

    let on_close = events.clone();
    dc.on_close(Box::new(move || {
        let _ = on_close.send(TransportEvent::ChannelClosed);
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if !msg.is_string {
            debug!(bytes = msg.data.len(), "ignoring binary data channel message");
        } else {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = events.send(TransportEvent::Message(text));
                }
                Err(e) => warn!(error = %e, "data channel text was not utf-8"),
            }
        }
        Box::pin(async {})
    }));
}

struct WebRtcChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl ChatChannel for WebRtcChannel {
    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<(), PeerError> {
        self.inner.send_text(text.to_string()).await?;
        Ok(())
    }
}
