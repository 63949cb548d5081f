//! Boundary to the peer connection engine.
//!
//! The orchestration layer never talks to a concrete WebRTC stack directly.
//! It drives a [`NegotiationEngine`] and consumes the engine's notifications
//! as [`EngineEvent`] values from the receiver handed out by the
//! [`EngineFactory`] that created it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::protocol::{IceCandidate, SessionDescription};

pub mod mock;
pub mod rtc;

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;
pub type RemoteTrack = Arc<TrackRemote>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Data channel payload: text or bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(value))
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload::Binary(Bytes::copy_from_slice(value))
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Binary(value)
    }
}

pub enum EngineEvent {
    NegotiationNeeded,
    /// `None` marks the end of candidate gathering.
    IceCandidate(Option<IceCandidate>),
    ConnectionStateChange(ConnectionState),
    DataChannel(Arc<dyn ChannelEngine>),
    Track(RemoteTrack),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Payload),
    Error(String),
    Close,
}

#[async_trait]
pub trait ChannelEngine: Send + Sync {
    fn label(&self) -> &str;

    async fn send(&self, payload: Payload) -> Result<usize, EngineError>;

    /// Requests closure; completion is reported as [`ChannelEvent::Close`].
    async fn close(&self) -> Result<(), EngineError>;

    /// Notification stream for this channel. Yields `None` once taken.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    /// Drops the callbacks feeding the notification stream.
    fn detach(&self);
}

#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn ChannelEngine>, EngineError>;

    async fn add_track(&self, track: LocalTrack) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;

    /// Drops every notification subscription registered with the engine.
    fn detach(&self);
}

pub struct EngineHandle {
    pub engine: Arc<dyn NegotiationEngine>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, config: &EngineConfig) -> Result<EngineHandle, EngineError>;
}
