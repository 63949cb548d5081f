use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use super::{Direction, SessionCore, SessionEvent, SessionState, request_error, update};
use crate::client::Client;
use crate::error::ClientError;
use crate::peer::PeerConnection;
use crate::protocol::Command;

/// A session request we sent to another peer.
#[derive(Clone)]
pub struct OutgoingSession {
    core: Arc<SessionCore>,
}

impl OutgoingSession {
    pub(crate) fn new(client: Client, peer: String, token: u64) -> Self {
        Self {
            core: Arc::new(SessionCore::new(client, peer, Direction::Outgoing, token)),
        }
    }

    /// The requested peer.
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

    /// Withdraws the request.
    pub async fn cancel(&self, reason: Option<String>) -> Result<(), ClientError> {
        self.core.ensure_pending()?;
        let message = update(Command::SessionCancel, self.peer(), reason.clone());
        let response = self.core.client().send(message).await?;
        if !response.is_ok() {
            let err = request_error(&response);
            self.core.settle(SessionState::Error(err.clone()));
            return Err(err);
        }
        self.core.settle(SessionState::Canceled(reason));
        Ok(())
    }

    /// Settles as accepted with the connection the client opened for the peer.
    pub(crate) fn handle_accept(&self, connection: PeerConnection) -> Result<(), ClientError> {
        self.core.ensure_pending()?;
        if self.core.settle(SessionState::Accepted(connection)) {
            Ok(())
        } else {
            Err(ClientError::AlreadySettled)
        }
    }

    pub(crate) fn handle_reject(&self, reason: Option<String>) {
        self.core.settle(SessionState::Rejected(reason));
    }

    pub(crate) fn handle_timeout(&self) {
        self.core.settle(SessionState::TimedOut);
    }

    pub(crate) fn handle_error(&self, err: ClientError) {
        self.core.settle(SessionState::Error(err));
    }

    pub(crate) fn token(&self) -> u64 {
        self.core.token()
    }
}

impl fmt::Debug for OutgoingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.core, f)
    }
}

