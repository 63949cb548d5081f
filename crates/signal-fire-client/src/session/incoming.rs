use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use super::{Direction, SessionCore, SessionEvent, SessionState, request_error, update};
use crate::client::Client;
use crate::error::ClientError;
use crate::peer::PeerConnection;
use crate::protocol::{Command, Message};

/// A session request some other peer sent to us.
#[derive(Clone)]
pub struct IncomingSession {
    core: Arc<SessionCore>,
}

impl IncomingSession {
    pub(crate) fn new(client: Client, peer: String, token: u64) -> Self {
        Self {
            core: Arc::new(SessionCore::new(client, peer, Direction::Incoming, token)),
        }
    }

    /// The requesting peer.
    pub fn peer(&self) -> &str {
        self.core.peer()
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn is_settled(&self) -> bool {
        self.core.is_settled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.core.watch()
    }

    /// Resolves with the terminal state once the session settles.
    pub async fn settled(&self) -> SessionState {
        self.core.settled().await
    }

    /// Accepts the request and waits for the requester's peer connection to
    /// arrive. The requester drives negotiation, so the connection shows up
    /// with its first offer.
    pub async fn accept(&self) -> Result<PeerConnection, ClientError> {
        self.core.ensure_pending()?;
        let peer = self.core.peer().to_string();
        let client = self.core.client();
        let response = client
            .send(Message::request(Command::SessionAccept, peer.clone()))
            .await?;
        if !response.is_ok() {
            let err = request_error(&response);
            self.core.settle(SessionState::Error(err.clone()));
            return Err(err);
        }
        info!(peer_id = %peer, "accepted session; awaiting peer connection");

        let mut state = self.core.watch();
        let settled_first = tokio::select! {
            connection = client.await_peer_connection(&peer) => {
                let connection = connection?;
                if self.core.settle(SessionState::Accepted(connection.clone())) {
                    return Ok(connection);
                }
                self.core.state().name()
            }
            settled = state.wait_for(SessionState::is_settled) => match settled {
                Ok(settled) => settled.name(),
                Err(_) => return Err(ClientError::ConnectionClosed),
            },
        };
        debug!(peer_id = %peer, state = settled_first, "session settled before connection");
        Err(ClientError::SessionSettled(settled_first.to_string()))
    }

    /// Rejects the request, optionally telling the requester why.
    pub async fn reject(&self, reason: Option<String>) -> Result<(), ClientError> {
        self.core.ensure_pending()?;
        let message = update(Command::SessionReject, self.peer(), reason.clone());
        let response = self.core.client().send(message).await?;
        if !response.is_ok() {
            let err = request_error(&response);
            self.core.settle(SessionState::Error(err.clone()));
            return Err(err);
        }
        self.core.settle(SessionState::Rejected(reason));
        Ok(())
    }

    pub(crate) fn handle_cancel(&self, reason: Option<String>) {
        self.core.settle(SessionState::Canceled(reason));
    }

    pub(crate) fn handle_timeout(&self) {
        self.core.settle(SessionState::TimedOut);
    }

    pub(crate) fn token(&self) -> u64 {
        self.core.token()
    }
}

impl fmt::Debug for IncomingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.core, f)
    }
}
