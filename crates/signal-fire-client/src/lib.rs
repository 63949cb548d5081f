//! Client-side orchestration for the Signal-Fire signaling protocol.
//!
//! A [`Client`] keeps one websocket to the signaling server and multiplexes
//! session handshakes and peer connection negotiation for any number of
//! remote peers over it.

use std::sync::Arc;

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod session;

pub use client::{Client, ClientEvent, ClientEvents, Link, connect_with};
pub use config::{ClientConfig, EngineConfig, IceServer, IceTransportPolicy};
pub use engine::Payload;
pub use error::{ClientError, EngineError};
pub use peer::{DataChannel, DataChannelEvent, PeerConnection, PeerConnectionEvent};
pub use protocol::{Message, PROTOCOL};
pub use session::{IncomingSession, OutgoingSession, SessionEvent, SessionState};

/// Connects to the signaling server at `url` and negotiates peers with the
/// WebRTC engine.
pub async fn connect(
    url: &str,
    config: ClientConfig,
) -> Result<(Client, ClientEvents), ClientError> {
    let factory = engine::rtc::WebRtcEngineFactory::new()?;
    connect_with(url, Arc::new(factory), config).await
}
