//! Pending session requests in both directions.
//!
//! Both variants wrap a [`SessionCore`] which owns the settle guard: a session
//! settles at most once, and settling always publishes the outcome event
//! followed by [`SessionEvent::Settled`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::client::Client;
use crate::error::ClientError;
use crate::peer::PeerConnection;
use crate::protocol::{Command, Message};

mod incoming;
mod outgoing;

pub use incoming::IncomingSession;
pub use outgoing::OutgoingSession;

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone)]
pub enum SessionState {
    Pending,
    Accepted(PeerConnection),
    Rejected(Option<String>),
    Canceled(Option<String>),
    TimedOut,
    Error(ClientError),
}

impl SessionState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, SessionState::Pending)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Accepted(_) => "accepted",
            SessionState::Rejected(_) => "rejected",
            SessionState::Canceled(_) => "canceled",
            SessionState::TimedOut => "timed-out",
            SessionState::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Accepted(PeerConnection),
    Rejected(Option<String>),
    Canceled(Option<String>),
    TimedOut,
    Error(ClientError),
    /// Always follows the outcome event.
    Settled,
}

pub(crate) struct SessionCore {
    client: Client,
    peer: String,
    direction: Direction,
    token: u64,
    settled: AtomicBool,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionCore {
    pub(crate) fn new(client: Client, peer: String, direction: Direction, token: u64) -> Self {
        Self {
            client,
            peer,
            direction,
            token,
            settled: AtomicBool::new(false),
            state: watch::Sender::new(SessionState::Pending),
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_pending(&self) -> Result<(), ClientError> {
        if self.is_settled() {
            Err(ClientError::AlreadySettled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub(crate) async fn settled(&self) -> SessionState {
        let mut state = self.state.subscribe();
        match state.wait_for(SessionState::is_settled).await {
            Ok(settled) => settled.clone(),
            Err(_) => self.state(),
        }
    }

    /// Returns `false` when the session had already settled.
    pub(crate) fn settle(&self, outcome: SessionState) -> bool {
        if !outcome.is_settled() {
            return false;
        }
        if self
            .settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(
                peer_id = %self.peer,
                direction = ?self.direction,
                outcome = outcome.name(),
                "ignoring settlement of settled session"
            );
            return false;
        }
        debug!(
            peer_id = %self.peer,
            direction = ?self.direction,
            outcome = outcome.name(),
            "session settled"
        );
        let event = match &outcome {
            SessionState::Accepted(connection) => SessionEvent::Accepted(connection.clone()),
            SessionState::Rejected(reason) => SessionEvent::Rejected(reason.clone()),
            SessionState::Canceled(reason) => SessionEvent::Canceled(reason.clone()),
            SessionState::TimedOut => SessionEvent::TimedOut,
            SessionState::Error(err) => SessionEvent::Error(err.clone()),
            SessionState::Pending => return false,
        };
        self.state.send_replace(outcome);
        let _ = self.events.send(event);
        let _ = self.events.send(SessionEvent::Settled);
        self.client
            .session_settled(self.direction, &self.peer, self.token);
        true
    }
}

impl fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("state", &self.state.borrow().name())
            .finish()
    }
}

pub(crate) fn request_error(response: &Message) -> ClientError {
    ClientError::Request(
        response
            .reason()
            .unwrap_or_else(|| "request failed".to_string()),
    )
}

/// A session update addressed to `peer`, with the reason as `data.message`.
pub(crate) fn update(cmd: Command, peer: &str, reason: Option<String>) -> Message {
    let message = Message::request(cmd, peer);
    match reason {
        Some(reason) => message.with_reason(reason),
        None => message,
    }
}
