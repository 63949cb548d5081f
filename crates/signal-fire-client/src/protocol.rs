use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::config::EngineConfig;

/// WebSocket sub-protocol spoken by Signal-Fire servers.
pub const PROTOCOL: &str = "Signal-Fire@2";

/// Close codes used when the client tears the duplex connection down.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const PROTOCOL_MISMATCH: u16 = 1002;
    pub const UNSUPPORTED_PAYLOAD: u16 = 1003;
    pub const POLICY_VIOLATION: u16 = 1008;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("expected sub-protocol {expected} but server selected {actual}")]
    ProtocolMismatch { expected: String, actual: String },
    #[error("expected a text frame")]
    UnsupportedPayload,
    #[error("unable to parse message: {0}")]
    Malformed(String),
    #[error("{cmd} message missing {field}")]
    MissingField {
        cmd: &'static str,
        field: &'static str,
    },
}

impl ProtocolError {
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::ProtocolMismatch { .. } => close_code::PROTOCOL_MISMATCH,
            ProtocolError::UnsupportedPayload => close_code::UNSUPPORTED_PAYLOAD,
            ProtocolError::Malformed(_) | ProtocolError::MissingField { .. } => {
                close_code::POLICY_VIOLATION
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Welcome,
    SessionStart,
    SessionAccept,
    SessionReject,
    SessionCancel,
    SessionTimeout,
    Offer,
    Answer,
    Ice,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Welcome => "welcome",
            Command::SessionStart => "session-start",
            Command::SessionAccept => "session-accept",
            Command::SessionReject => "session-reject",
            Command::SessionCancel => "session-cancel",
            Command::SessionTimeout => "session-timeout",
            Command::Offer => "offer",
            Command::Answer => "answer",
            Command::Ice => "ice",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "welcome" => Command::Welcome,
            "session-start" => Command::SessionStart,
            "session-accept" => Command::SessionAccept,
            "session-reject" => Command::SessionReject,
            "session-cancel" => Command::SessionCancel,
            "session-timeout" => Command::SessionTimeout,
            "offer" => Command::Offer,
            "answer" => Command::Answer,
            "ice" => Command::Ice,
            _ => return Err(()),
        })
    }
}

/// The single wire entity. Requests carry a fresh `id` that the matching
/// response echoes; pushes are dispatched by `cmd`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Message {
    pub fn request(cmd: Command, target: impl Into<String>) -> Self {
        Self {
            cmd: Some(cmd.as_str().to_string()),
            target: Some(target.into()),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attaches a free-text reason as `data.message`.
    pub fn with_reason(self, reason: impl Into<String>) -> Self {
        self.with_data(json!({ "message": reason.into() }))
    }

    pub fn offer(target: impl Into<String>, sdp: &SessionDescription) -> Self {
        Self::request(Command::Offer, target).with_data(json!({ "sdp": sdp }))
    }

    pub fn answer(target: impl Into<String>, sdp: &SessionDescription) -> Self {
        Self::request(Command::Answer, target).with_data(json!({ "sdp": sdp }))
    }

    pub fn ice(target: impl Into<String>, candidate: &IceCandidate) -> Self {
        Self::request(Command::Ice, target).with_data(json!({ "candidate": candidate }))
    }

    pub fn command(&self) -> Option<Command> {
        self.cmd.as_deref().and_then(|cmd| cmd.parse().ok())
    }

    pub fn is_ok(&self) -> bool {
        self.ok.unwrap_or(false)
    }

    /// Server supplied reason (`data.message`), if any.
    pub fn reason(&self) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|data| data.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Browser-compatible `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Browser-compatible `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Deserialize)]
struct WelcomeData {
    id: String,
    #[serde(default)]
    config: Option<EngineConfig>,
}

#[derive(Deserialize)]
struct SdpData {
    sdp: SessionDescription,
}

#[derive(Deserialize)]
struct IceData {
    candidate: IceCandidate,
}

/// Typed view of every push notification the server may deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    Welcome {
        id: String,
        config: Option<EngineConfig>,
    },
    SessionStart {
        origin: String,
    },
    SessionAccept {
        origin: String,
    },
    SessionReject {
        origin: String,
        reason: Option<String>,
    },
    SessionCancel {
        origin: String,
        reason: Option<String>,
    },
    SessionTimeout {
        origin: String,
    },
    Offer {
        origin: String,
        sdp: SessionDescription,
    },
    Answer {
        origin: String,
        sdp: SessionDescription,
    },
    Ice {
        origin: String,
        candidate: IceCandidate,
    },
}

impl Push {
    /// Decodes a push. Messages without a recognised `cmd` yield `Ok(None)`.
    pub fn decode(message: &Message) -> Result<Option<Self>, ProtocolError> {
        let Some(cmd) = message.command() else {
            return Ok(None);
        };
        let push = match cmd {
            Command::Welcome => {
                let data: WelcomeData = payload(message, cmd)?;
                Push::Welcome {
                    id: data.id,
                    config: data.config,
                }
            }
            Command::SessionStart => Push::SessionStart {
                origin: origin(message, cmd)?,
            },
            Command::SessionAccept => Push::SessionAccept {
                origin: origin(message, cmd)?,
            },
            Command::SessionReject => Push::SessionReject {
                origin: origin(message, cmd)?,
                reason: message.reason(),
            },
            Command::SessionCancel => Push::SessionCancel {
                origin: origin(message, cmd)?,
                reason: message.reason(),
            },
            Command::SessionTimeout => Push::SessionTimeout {
                origin: origin(message, cmd)?,
            },
            Command::Offer => {
                let origin = origin(message, cmd)?;
                let data: SdpData = payload(message, cmd)?;
                Push::Offer {
                    origin,
                    sdp: data.sdp,
                }
            }
            Command::Answer => {
                let origin = origin(message, cmd)?;
                let data: SdpData = payload(message, cmd)?;
                Push::Answer {
                    origin,
                    sdp: data.sdp,
                }
            }
            Command::Ice => {
                let origin = origin(message, cmd)?;
                let data: IceData = payload(message, cmd)?;
                Push::Ice {
                    origin,
                    candidate: data.candidate,
                }
            }
        };
        Ok(Some(push))
    }

    pub fn command(&self) -> Command {
        match self {
            Push::Welcome { .. } => Command::Welcome,
            Push::SessionStart { .. } => Command::SessionStart,
            Push::SessionAccept { .. } => Command::SessionAccept,
            Push::SessionReject { .. } => Command::SessionReject,
            Push::SessionCancel { .. } => Command::SessionCancel,
            Push::SessionTimeout { .. } => Command::SessionTimeout,
            Push::Offer { .. } => Command::Offer,
            Push::Answer { .. } => Command::Answer,
            Push::Ice { .. } => Command::Ice,
        }
    }

    pub fn origin(&self) -> Option<&str> {
        match self {
            Push::Welcome { .. } => None,
            Push::SessionStart { origin }
            | Push::SessionAccept { origin }
            | Push::SessionReject { origin, .. }
            | Push::SessionCancel { origin, .. }
            | Push::SessionTimeout { origin }
            | Push::Offer { origin, .. }
            | Push::Answer { origin, .. }
            | Push::Ice { origin, .. } => Some(origin),
        }
    }
}

fn origin(message: &Message, cmd: Command) -> Result<String, ProtocolError> {
    message
        .origin
        .clone()
        .ok_or(ProtocolError::MissingField {
            cmd: cmd.as_str(),
            field: "origin",
        })
}

fn payload<T: DeserializeOwned>(message: &Message, cmd: Command) -> Result<T, ProtocolError> {
    let data = message.data.clone().ok_or(ProtocolError::MissingField {
        cmd: cmd.as_str(),
        field: "data",
    })?;
    serde_json::from_value(data)
        .map_err(|err| ProtocolError::Malformed(format!("{cmd} payload: {err}")))
}
