use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

use super::{
    ChannelEngine, ChannelEvent, ConnectionState, EngineEvent, EngineFactory, EngineHandle,
    LocalTrack, NegotiationEngine, Payload,
};
use crate::config::{EngineConfig, IceTransportPolicy};
use crate::error::EngineError;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

fn setup_error(err: webrtc::Error) -> EngineError {
    EngineError::Setup(err.to_string())
}

fn negotiation_error(err: webrtc::Error) -> EngineError {
    EngineError::Negotiation(err.to_string())
}

fn channel_error(err: webrtc::Error) -> EngineError {
    EngineError::Channel(err.to_string())
}

/// Builds `RTCPeerConnection`s from the `webrtc` crate.
pub struct WebRtcEngineFactory {
    api: API,
}

impl WebRtcEngineFactory {
    pub fn new() -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup_error)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(setup_error)?;

        Ok(Self {
            api: APIBuilder::new()
                .with_media_engine(media_engine)
                .with_interceptor_registry(registry)
                .build(),
        })
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(&self, config: &EngineConfig) -> Result<EngineHandle, EngineError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_configuration(config))
                .await
                .map_err(setup_error)?,
        );
        let (events_tx, events) = mpsc::unbounded_channel();
        attach_handlers(&pc, events_tx);
        let engine = Arc::new(WebRtcEngine { pc });
        Ok(EngineHandle {
            engine: engine as Arc<dyn NegotiationEngine>,
            events,
        })
    }
}

fn attach_handlers(pc: &RTCPeerConnection, events_tx: mpsc::UnboundedSender<EngineEvent>) {
    let tx = events_tx.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(EngineEvent::NegotiationNeeded);
        })
    }));

    let tx = events_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let event = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => EngineEvent::IceCandidate(Some(from_rtc_candidate(init))),
                    Err(err) => {
                        warn!(target = "webrtc", error = %err, "dropping unserialisable candidate");
                        return;
                    }
                },
                None => EngineEvent::IceCandidate(None),
            };
            let _ = tx.send(event);
        })
    }));

    let tx = events_tx.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            debug!(target = "webrtc", state = %state, "ice connection state changed");
            let _ = tx.send(EngineEvent::ConnectionStateChange(from_rtc_state(state)));
        })
    }));

    let tx = events_tx.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        Box::pin(async move {
            debug!(target = "webrtc", label = dc.label(), "remote data channel announced");
            let channel = WebRtcChannel::wrap(dc);
            let _ = tx.send(EngineEvent::DataChannel(channel));
        })
    }));

    let tx = events_tx;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(EngineEvent::Track(track));
            })
        },
    ));
}

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcEngine {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl NegotiationEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_error)?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation_error)?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(negotiation_error)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc.local_description().await?;
        from_rtc_description(&description).ok()
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(negotiation_error)
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn ChannelEngine>, EngineError> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(channel_error)?;
        Ok(WebRtcChannel::wrap(dc))
    }

    async fn add_track(&self, track: LocalTrack) -> Result<(), EngineError> {
        self.pc
            .add_track(track)
            .await
            .map(|_sender| ())
            .map_err(negotiation_error)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc.close().await.map_err(negotiation_error)
    }

    fn detach(&self) {
        self.pc.on_negotiation_needed(Box::new(|| Box::pin(async {})));
        self.pc
            .on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
        self.pc.on_ice_connection_state_change(Box::new(|_: RTCIceConnectionState| {
            Box::pin(async {})
        }));
        self.pc
            .on_data_channel(Box::new(|_: Arc<RTCDataChannel>| Box::pin(async {})));
        self.pc.on_track(Box::new(
            |_: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                Box::pin(async {})
            },
        ));
    }
}

pub struct WebRtcChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl WebRtcChannel {
    fn wrap(dc: Arc<RTCDataChannel>) -> Arc<dyn ChannelEngine> {
        let (tx, rx) = mpsc::unbounded_channel();

        let open_tx = tx.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                let _ = open_tx.send(ChannelEvent::Open);
            })
        }));

        let message_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = message_tx.clone();
            Box::pin(async move {
                let payload = if msg.is_string {
                    Payload::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    Payload::Binary(msg.data)
                };
                let _ = tx.send(ChannelEvent::Message(payload));
            })
        }));

        let error_tx = tx.clone();
        dc.on_error(Box::new(move |err: webrtc::Error| {
            let tx = error_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Error(err.to_string()));
            })
        }));

        let close_tx = tx;
        dc.on_close(Box::new(move || {
            let tx = close_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Close);
            })
        }));

        Arc::new(Self {
            label: dc.label().to_string(),
            dc,
            events: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl ChannelEngine for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, payload: Payload) -> Result<usize, EngineError> {
        match payload {
            Payload::Text(text) => self.dc.send_text(text).await,
            Payload::Binary(bytes) => self.dc.send(&bytes).await,
        }
        .map_err(channel_error)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.dc.close().await.map_err(channel_error)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().take()
    }

    fn detach(&self) {
        self.dc.on_open(Box::new(|| Box::pin(async {})));
        self.dc
            .on_message(Box::new(|_: DataChannelMessage| Box::pin(async {})));
        self.dc
            .on_error(Box::new(|_: webrtc::Error| Box::pin(async {})));
        self.dc.on_close(Box::new(|| Box::pin(async {})));
    }
}

pub fn rtc_configuration(config: &EngineConfig) -> RTCConfiguration {
    let ice_servers = config
        .ice_servers
        .iter()
        .flatten()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();
    RTCConfiguration {
        ice_servers,
        ice_transport_policy: match config.ice_transport_policy {
            Some(IceTransportPolicy::All) => RTCIceTransportPolicy::All,
            Some(IceTransportPolicy::Relay) => RTCIceTransportPolicy::Relay,
            None => RTCIceTransportPolicy::Unspecified,
        },
        ice_candidate_pool_size: config.ice_candidate_pool_size.unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, EngineError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback.sdp = description.sdp;
            Ok(rollback)
        }
    }
    .map_err(negotiation_error)
}

fn from_rtc_description(
    description: &RTCSessionDescription,
) -> Result<SessionDescription, EngineError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(EngineError::Negotiation(
                "session description has no type".into(),
            ));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn from_rtc_state(state: RTCIceConnectionState) -> ConnectionState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => ConnectionState::New,
        RTCIceConnectionState::Checking => ConnectionState::Checking,
        RTCIceConnectionState::Connected => ConnectionState::Connected,
        RTCIceConnectionState::Completed => ConnectionState::Completed,
        RTCIceConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCIceConnectionState::Failed => ConnectionState::Failed,
        RTCIceConnectionState::Closed => ConnectionState::Closed,
    }
}
