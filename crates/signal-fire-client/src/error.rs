use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("engine negotiation failed: {0}")]
    Negotiation(String),
    #[error("data channel failed: {0}")]
    Channel(String),
    #[error("engine closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("connection setup failed: {0}")]
    Setup(String),
    #[error("connection not open")]
    NotOpen,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("cannot target the local peer")]
    SelfTarget,
    #[error("peer connection to {0} already established")]
    PeerConnectionExists(String),
    #[error("session request with {0} already active")]
    SessionActive(String),
    #[error("data channel {0} already created")]
    DataChannelExists(String),
    #[error("data channel {0} is closed")]
    DataChannelClosed(String),
    #[error("request already settled")]
    AlreadySettled,
    #[error("session settled as {0} before the connection arrived")]
    SessionSettled(String),
    #[error("local identity already assigned")]
    AlreadyWelcomed,
    #[error("request id {0} already in flight")]
    DuplicateRequestId(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}
